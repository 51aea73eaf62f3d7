//! The 68-byte handshake that precedes all peer-wire messages (spec §4.1).

use std::io::Read;

use crate::error::EngineError;

const PROTOCOL_ID: &str = "BitTorrent protocol";

#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    pub pstr: String,
    /// 8 reserved bytes; this engine sets and expects all zeroes.
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            pstr: PROTOCOL_ID.to_string(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, EngineError> {
        if bytes.len() != 68 {
            return Err(EngineError::MalformedInput(
                "handshake must be exactly 68 bytes".into(),
            ));
        }
        if bytes[0] != 19 {
            return Err(EngineError::MalformedInput(
                "handshake must start with pstrlen 19".into(),
            ));
        }
        let pstr = String::from_utf8(bytes[1..20].to_vec())
            .map_err(|_| EngineError::MalformedInput("handshake pstr is not utf8".into()))?;

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Handshake {
            pstr,
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Handshake, EngineError> {
        let mut buf = [0u8; 68];
        reader.read_exact(&mut buf)?;
        Handshake::from_bytes(&buf)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; 68];
        bytes[0] = 19;
        bytes[1..20].copy_from_slice(self.pstr.as_bytes());
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    /// Validates the remote's handshake against the info_hash we expect.
    pub fn matches(&self, info_hash: &[u8; 20]) -> bool {
        self.pstr == PROTOCOL_ID && &self.info_hash == info_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let info_hash = [7u8; 20];
        let peer_id = [9u8; 20];
        let hs = Handshake::new(info_hash, peer_id);
        let bytes = hs.to_bytes();
        assert_eq!(bytes.len(), 68);
        let back = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(hs, back);
    }

    #[test]
    fn matches_checks_info_hash_and_protocol_string() {
        let info_hash = [1u8; 20];
        let hs = Handshake::new(info_hash, [0u8; 20]);
        assert!(hs.matches(&info_hash));
        assert!(!hs.matches(&[2u8; 20]));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Handshake::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn rejects_bad_pstrlen() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).to_bytes();
        bytes[0] = 18;
        assert!(Handshake::from_bytes(&bytes).is_err());
    }
}
