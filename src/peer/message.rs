//! The length-prefixed peer wire message codec: `<4-byte BE length><1-byte
//! id><payload>`. A zero-length frame is a keep-alive and carries no id.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("connection closed before a full frame was read")]
    ShortRead,
    #[error("unknown message id {0}")]
    UnknownId(u8),
    #[error("expected Have (id 4), got id {0}")]
    NotHave(u8),
    #[error("Have payload should be 4 bytes, got {0}")]
    BadHaveLength(usize),
    #[error("expected Piece (id 7), got id {0}")]
    NotPiece(u8),
    #[error("Piece payload too short: {0} bytes")]
    ShortPiece(usize),
    #[error("Piece index mismatch: expected {expected}, got {got}")]
    IndexMismatch { expected: u32, got: u32 },
    #[error("begin offset {begin} out of range for buffer of length {len}")]
    BeginOutOfRange { begin: u32, len: usize },
    #[error("block of {block_len} bytes at offset {begin} overruns buffer of length {len}")]
    BlockOverrun {
        begin: u32,
        block_len: usize,
        len: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(ID_CHOKE),
            Message::Unchoke => Some(ID_UNCHOKE),
            Message::Interested => Some(ID_INTERESTED),
            Message::NotInterested => Some(ID_NOT_INTERESTED),
            Message::Have(_) => Some(ID_HAVE),
            Message::Bitfield(_) => Some(ID_BITFIELD),
            Message::Request(..) => Some(ID_REQUEST),
            Message::Piece(..) => Some(ID_PIECE),
            Message::Cancel(..) => Some(ID_CANCEL),
            Message::Port(_) => Some(ID_PORT),
        }
    }

    /// Serializes the message to its wire form. The keep-alive sentinel
    /// serializes to four zero bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return vec![0, 0, 0, 0];
        };

        let mut buf = BytesMut::new();
        match self {
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(id);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(id);
                buf.put_slice(bits);
            }
            Message::Request(index, begin, length) | Message::Cancel(index, begin, length) => {
                buf.put_u32(13);
                buf.put_u8(id);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece(index, begin, block) => {
                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(id);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(id);
                buf.put_u16(*port);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(id);
            }
            Message::KeepAlive => unreachable!(),
        }
        buf.to_vec()
    }

    /// Parses a single frame's id + payload (length prefix already stripped
    /// and read in full by the caller). `payload.len() == 0` with no id read
    /// at all is represented by the caller returning `KeepAlive` directly;
    /// this function only ever sees a non-keep-alive frame.
    fn from_id_and_payload(id: u8, payload: &[u8]) -> Result<Message, MessageError> {
        let msg = match id {
            ID_CHOKE => Message::Choke,
            ID_UNCHOKE => Message::Unchoke,
            ID_INTERESTED => Message::Interested,
            ID_NOT_INTERESTED => Message::NotInterested,
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(MessageError::BadHaveLength(payload.len()));
                }
                Message::Have(u32::from_be_bytes(payload.try_into().unwrap()))
            }
            ID_BITFIELD => Message::Bitfield(payload.to_vec()),
            ID_REQUEST => {
                if payload.len() != 12 {
                    return Err(MessageError::ShortRead);
                }
                Message::Request(
                    u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    u32::from_be_bytes(payload[8..12].try_into().unwrap()),
                )
            }
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(MessageError::ShortPiece(payload.len()));
                }
                Message::Piece(
                    u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    payload[8..].to_vec(),
                )
            }
            ID_CANCEL => {
                if payload.len() != 12 {
                    return Err(MessageError::ShortRead);
                }
                Message::Cancel(
                    u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    u32::from_be_bytes(payload[8..12].try_into().unwrap()),
                )
            }
            ID_PORT => {
                if payload.len() != 2 {
                    return Err(MessageError::ShortRead);
                }
                Message::Port(u16::from_be_bytes(payload.try_into().unwrap()))
            }
            other => return Err(MessageError::UnknownId(other)),
        };
        Ok(msg)
    }

    /// Parses a complete frame (length prefix, id, payload all present in
    /// `frame`, with the 4-byte length prefix included).
    pub fn parse(frame: &[u8]) -> Result<Message, MessageError> {
        if frame.len() < 4 {
            return Err(MessageError::ShortRead);
        }
        let length = u32::from_be_bytes(frame[0..4].try_into().unwrap());
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if frame.len() < 4 + length as usize {
            return Err(MessageError::ShortRead);
        }
        let id = frame[4];
        let payload = &frame[5..4 + length as usize];
        Self::from_id_and_payload(id, payload)
    }
}

/// Requires id=4 (Have) and a 4-byte payload; returns the piece index.
pub fn parse_have(msg: &Message) -> Result<u32, MessageError> {
    match msg {
        Message::Have(index) => Ok(*index),
        other => Err(MessageError::NotHave(other.id().unwrap_or(0))),
    }
}

/// Builds a Request message for `index`/`begin`/`length`.
pub fn format_request(index: u32, begin: u32, length: u32) -> Message {
    Message::Request(index, begin, length)
}

/// Requires id=7 (Piece), `payload.len() >= 8`, `msg`'s index matching
/// `expected_index`, `begin < dest.len()`, and `begin + block.len() <=
/// dest.len()`. Copies the block into `dest[begin..begin+block.len()]` and
/// returns the number of bytes copied. Never mutates `dest` past the final
/// successful call on a validation failure.
pub fn parse_piece(expected_index: u32, dest: &mut [u8], msg: &Message) -> Result<usize, MessageError> {
    let (index, begin, block) = match msg {
        Message::Piece(index, begin, block) => (*index, *begin, block),
        other => return Err(MessageError::NotPiece(other.id().unwrap_or(0))),
    };
    if index != expected_index {
        return Err(MessageError::IndexMismatch {
            expected: expected_index,
            got: index,
        });
    }
    let begin = begin as usize;
    if begin >= dest.len() {
        return Err(MessageError::BeginOutOfRange {
            begin: begin as u32,
            len: dest.len(),
        });
    }
    let end = begin + block.len();
    if end > dest.len() {
        return Err(MessageError::BlockOverrun {
            begin: begin as u32,
            block_len: block.len(),
            len: dest.len(),
        });
    }
    dest[begin..end].copy_from_slice(block);
    Ok(block.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_round_trips() {
        let msg = Message::KeepAlive;
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(Message::parse(&bytes).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn have_serializes_per_spec() {
        let msg = Message::Have(u32::from_be_bytes([1, 2, 3, 4]));
        assert_eq!(msg.serialize(), vec![0, 0, 0, 5, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn every_variant_round_trips() {
        let variants = vec![
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
            Message::Bitfield(vec![0xff, 0x00, 0x80]),
            Message::Request(1, 2, 3),
            Message::Piece(1, 2, vec![9, 9, 9]),
            Message::Cancel(1, 2, 3),
            Message::Port(6881),
        ];
        for msg in variants {
            let bytes = msg.serialize();
            assert_eq!(Message::parse(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn format_request_matches_expected_bytes() {
        let msg = format_request(4, 567, 4321);
        let bytes = msg.serialize();
        assert_eq!(
            bytes,
            vec![
                0x00, 0x00, 0x00, 0x0d, 0x06, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x02, 0x37,
                0x00, 0x00, 0x10, 0xe1,
            ]
        );
    }

    #[test]
    fn parse_piece_copies_block_into_place() {
        let mut dest = vec![0u8; 10];
        let msg = Message::Piece(4, 2, vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let n = parse_piece(4, &mut dest, &msg).unwrap();
        assert_eq!(n, 6);
        assert_eq!(
            dest,
            vec![0, 0, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0, 0]
        );
    }

    #[test]
    fn parse_piece_rejects_wrong_index() {
        let mut dest = vec![0u8; 4];
        let msg = Message::Piece(1, 0, vec![1, 2]);
        assert!(parse_piece(2, &mut dest, &msg).is_err());
        assert_eq!(dest, vec![0, 0, 0, 0]);
    }

    #[test]
    fn parse_piece_rejects_block_past_end() {
        let mut dest = vec![0u8; 4];
        let msg = Message::Piece(1, 2, vec![1, 2, 3]);
        assert!(parse_piece(1, &mut dest, &msg).is_err());
        assert_eq!(dest, vec![0, 0, 0, 0]);
    }

    #[test]
    fn parse_have_requires_matching_id() {
        assert_eq!(parse_have(&Message::Have(7)).unwrap(), 7);
        assert!(parse_have(&Message::Choke).is_err());
    }

    #[test]
    fn request_and_cancel_frame_single_byte_length() {
        let req = format_request(0, 0, 1).serialize();
        assert_eq!(req[0..4], [0, 0, 0, 13]);
        let cancel = Message::Cancel(0, 0, 1).serialize();
        assert_eq!(cancel[0..5], [0, 0, 0, 13, 8]);
    }
}
