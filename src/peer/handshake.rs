//! The 68-byte BitTorrent handshake, extended with the BEP 10 reserved-bit
//! convention this crate relies on to request the ut_metadata exchange.

use std::io::{Error, ErrorKind};

/// Bit 20 from the right of the reserved bytes (`reserved[5] & 0x10`)
/// advertises support for the extension protocol (BEP 10).
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;
const RESERVED_EXTENSION_BYTE: usize = 5;

#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    /// string identifier of the protocol (19 bytes), e.g. "BitTorrent protocol"
    pub pstr: String,
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    /// 20-byte string used as a unique ID for the client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        let mut reserved = [0u8; 8];
        reserved[RESERVED_EXTENSION_BYTE] |= EXTENSION_PROTOCOL_BIT;
        Handshake {
            pstr: "BitTorrent protocol".to_string(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, Error> {
        if bytes.len() < 68 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Handshake message should be at least 68 bytes long",
            ));
        }
        if bytes[0] != 19 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Handshake message should start with 19",
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        let pstr = String::from_utf8(bytes[1..20].to_vec())
            .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;

        Ok(Handshake {
            pstr,
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0; 68];
        bytes[0] = 19;
        bytes[1..20].copy_from_slice(self.pstr.as_bytes());
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[RESERVED_EXTENSION_BYTE] & EXTENSION_PROTOCOL_BIT != 0
    }

    pub fn check(&self, info_hash: &[u8]) -> bool {
        self.info_hash == info_hash && self.pstr == "BitTorrent protocol"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.to_bytes();
        let decoded = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(handshake, decoded);
    }

    #[test]
    fn advertises_extension_protocol_bit() {
        let handshake = Handshake::new([0u8; 20], [0u8; 20]);
        assert!(handshake.supports_extension_protocol());
    }

    #[test]
    fn rejects_short_messages() {
        assert!(Handshake::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn check_rejects_wrong_info_hash() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(!handshake.check(&[9u8; 20]));
    }
}
