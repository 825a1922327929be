//! The fixed 49+pstrlen byte opening exchange: `<1-byte pstrlen><pstr><8
//! reserved bytes><20-byte info digest><20-byte peer id>`.

use thiserror::Error;

pub const PROTOCOL: &str = "BitTorrent protocol";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before a full handshake was read")]
    ShortRead,
    #[error("pstrlen was 0")]
    EmptyProtocol,
    #[error("info digest mismatch: expected {expected}, peer sent {got}")]
    InfoDigestMismatch { expected: String, got: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pstr: String,
    pub reserved: [u8; 8],
    pub info_digest: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_digest: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            pstr: PROTOCOL.to_string(),
            reserved: [0; 8],
            info_digest,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let pstr_len = self.pstr.len();
        let mut buf = Vec::with_capacity(49 + pstr_len);
        buf.push(pstr_len as u8);
        buf.extend_from_slice(self.pstr.as_bytes());
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_digest);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    pub fn parse(bytes: &[u8]) -> Result<Handshake, HandshakeError> {
        if bytes.is_empty() {
            return Err(HandshakeError::ShortRead);
        }
        let pstr_len = bytes[0] as usize;
        if pstr_len == 0 {
            return Err(HandshakeError::EmptyProtocol);
        }
        if bytes.len() < 1 + pstr_len + 8 + 20 + 20 {
            return Err(HandshakeError::ShortRead);
        }
        let mut offset = 1;
        let pstr = String::from_utf8_lossy(&bytes[offset..offset + pstr_len]).into_owned();
        offset += pstr_len;
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[offset..offset + 8]);
        offset += 8;
        let mut info_digest = [0u8; 20];
        info_digest.copy_from_slice(&bytes[offset..offset + 20]);
        offset += 20;
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[offset..offset + 20]);

        Ok(Handshake {
            pstr,
            reserved,
            info_digest,
            peer_id,
        })
    }

    /// Validates that the peer's handshake carries the info digest we sent.
    pub fn validate(&self, expected_info_digest: &[u8; 20]) -> Result<(), HandshakeError> {
        if &self.info_digest != expected_info_digest {
            return Err(HandshakeError::InfoDigestMismatch {
                expected: hex(expected_info_digest),
                got: hex(&self.info_digest),
            });
        }
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_digest_and_peer_id() {
        let info_digest = [0x42; 20];
        let mut peer_id = [0u8; 20];
        for (i, b) in peer_id.iter_mut().enumerate() {
            *b = i as u8;
        }
        let h = Handshake::new(info_digest, peer_id);
        let bytes = h.serialize();
        assert_eq!(bytes.len(), 68);
        let parsed = Handshake::parse(&bytes).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_zero_pstrlen() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&[0u8; 67]);
        assert!(matches!(
            Handshake::parse(&bytes),
            Err(HandshakeError::EmptyProtocol)
        ));
    }

    #[test]
    fn rejects_short_read() {
        let bytes = vec![19u8; 10];
        assert!(matches!(
            Handshake::parse(&bytes),
            Err(HandshakeError::ShortRead)
        ));
    }

    #[test]
    fn validate_rejects_mismatched_digest() {
        let h = Handshake::new([1; 20], [2; 20]);
        assert!(h.validate(&[9; 20]).is_err());
        assert!(h.validate(&[1; 20]).is_ok());
    }
}
