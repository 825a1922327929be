//! Decodes a single-file bencoded torrent descriptor into a typed,
//! immutable [`Metainfo`], computing the info-digest and splitting the
//! piece-digest blob along the way.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;

/// The `info` sub-dictionary, field order chosen to match the bencode
/// dictionary's required lexicographic key order ("length" < "name" <
/// "piece length" < "pieces") so re-encoding it reproduces the original
/// info-digest byte-for-byte.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct BencodeInfo {
    length: i64,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: ByteBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct BencodeTorrent {
    announce: String,
    info: BencodeInfo,
}

/// Immutable, parsed torrent descriptor.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub name: String,
    pub length: u64,
    pub piece_length: u64,
    pub piece_digests: Vec<[u8; 20]>,
    pub info_digest: [u8; 20],
}

impl Metainfo {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Metainfo> {
        let decoded: BencodeTorrent =
            from_bytes(bytes).context("failed to parse bencoded torrent descriptor")?;

        if decoded.info.length < 0 {
            bail!("info.length must be non-negative, got {}", decoded.info.length);
        }
        if decoded.info.piece_length <= 0 {
            bail!(
                "info.piece length must be positive, got {}",
                decoded.info.piece_length
            );
        }

        let info_digest = Self::hash_info(&decoded.info)?;
        let piece_digests = Self::split_piece_digests(&decoded.info.pieces)?;

        Ok(Metainfo {
            announce: decoded.announce,
            name: decoded.info.name,
            length: decoded.info.length as u64,
            piece_length: decoded.info.piece_length as u64,
            piece_digests,
            info_digest,
        })
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Metainfo> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("failed to open torrent descriptor at {}", path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    fn hash_info(info: &BencodeInfo) -> anyhow::Result<[u8; 20]> {
        let encoded = to_bytes(info).context("failed to re-encode info dictionary")?;
        let mut hasher = Sha1::new();
        hasher.update(&encoded);
        Ok(hasher.finalize().into())
    }

    fn split_piece_digests(pieces: &[u8]) -> anyhow::Result<Vec<[u8; 20]>> {
        if pieces.len() % 20 != 0 {
            bail!(
                "pieces blob length {} is not a multiple of 20",
                pieces.len()
            );
        }
        Ok(pieces
            .chunks(20)
            .map(|chunk| {
                let mut digest = [0u8; 20];
                digest.copy_from_slice(chunk);
                digest
            })
            .collect())
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_digests.len()
    }

    /// The exact length of piece `index`: `piece_length` for every piece but
    /// the last, which may be shorter.
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 == self.num_pieces() {
            self.length - self.piece_length * (self.num_pieces() as u64 - 1)
        } else {
            self.piece_length
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes(piece_length: i64, length: i64, num_pieces: usize) -> Vec<u8> {
        let pieces: Vec<u8> = (0..num_pieces).flat_map(|i| [i as u8; 20]).collect();
        let torrent = BencodeTorrent {
            announce: "http://tracker.example/announce".to_string(),
            info: BencodeInfo {
                length,
                name: "sample.iso".to_string(),
                piece_length,
                pieces: ByteBuf::from(pieces),
            },
        };
        to_bytes(&torrent).unwrap()
    }

    #[test]
    fn parses_basic_fields() {
        let bytes = sample_bytes(16384, 16384 * 2 + 100, 3);
        let meta = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(meta.announce, "http://tracker.example/announce");
        assert_eq!(meta.name, "sample.iso");
        assert_eq!(meta.num_pieces(), 3);
        assert_eq!(meta.piece_size(0), 16384);
        assert_eq!(meta.piece_size(1), 16384);
        assert_eq!(meta.piece_size(2), 100);
    }

    #[test]
    fn rejects_malformed_pieces_blob() {
        let mut bytes_raw = BencodeInfo {
            length: 100,
            name: "x".to_string(),
            piece_length: 50,
            pieces: ByteBuf::from(vec![0u8; 21]),
        };
        let torrent = BencodeTorrent {
            announce: "http://t/a".to_string(),
            info: bytes_raw.clone(),
        };
        let bytes = to_bytes(&torrent).unwrap();
        assert!(Metainfo::from_bytes(&bytes).is_err());

        bytes_raw.pieces = ByteBuf::from(vec![0u8; 40]);
        let torrent = BencodeTorrent {
            announce: "http://t/a".to_string(),
            info: bytes_raw,
        };
        let bytes = to_bytes(&torrent).unwrap();
        assert!(Metainfo::from_bytes(&bytes).is_ok());
    }

    #[test]
    fn info_digest_is_reencoding_of_info_dict() {
        let bytes = sample_bytes(16384, 16384, 1);
        let meta = Metainfo::from_bytes(&bytes).unwrap();

        // re-deriving the hash independently, from the same canonical bytes
        let decoded: BencodeTorrent = from_bytes(&bytes).unwrap();
        let reencoded = to_bytes(&decoded.info).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(&reencoded);
        let expected: [u8; 20] = hasher.finalize().into();

        assert_eq!(meta.info_digest, expected);
    }
}
