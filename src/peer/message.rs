//! Peer-wire messages (BEP 3 §"peer messages"), extended with the BEP 10
//! `Extended` message this crate actually needs to speak ut_metadata.

use std::io::{Error, ErrorKind};

#[derive(Debug, PartialEq, Clone)]
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
    /// BEP 10 extension message: sub-message id followed by a bencoded
    /// dict and, for ut_metadata piece messages, trailing raw bytes.
    Extended(u8, Vec<u8>),
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(4 + self.len());
        msg.extend_from_slice(&(self.len() as u32).to_be_bytes());
        if matches!(self, Message::KeepAlive) {
            return msg;
        }
        msg.push(self.id());
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => msg.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bitfield) => msg.extend_from_slice(bitfield),
            Message::Request(index, begin, length) | Message::Cancel(index, begin, length) => {
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece(index, begin, block) => {
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(block);
            }
            Message::Port(port) => msg.extend_from_slice(&port.to_be_bytes()),
            Message::Extended(sub_id, payload) => {
                msg.push(*sub_id);
                msg.extend_from_slice(payload);
            }
        }
        msg
    }

    /// `data` must be a full frame: the 4-byte length prefix followed by
    /// exactly that many bytes of payload.
    pub fn deserialize(data: &[u8]) -> Result<Message, Error> {
        if data.len() < 4 {
            return Err(Error::new(ErrorKind::InvalidData, "frame shorter than length prefix"));
        }
        let mut declared = [0; 4];
        declared.copy_from_slice(&data[0..4]);
        let declared = u32::from_be_bytes(declared) as usize;
        if data.len() != 4 + declared {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "frame length does not match declared length prefix",
            ));
        }
        if declared == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = data[4];
        let body = &data[5..];
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if body.len() != 4 {
                    return Err(Error::new(ErrorKind::InvalidData, "Have message should carry a 4-byte index"));
                }
                let mut index = [0; 4];
                index.copy_from_slice(body);
                Message::Have(u32::from_be_bytes(index))
            }
            5 => Message::Bitfield(body.to_vec()),
            6 => {
                if body.len() != 12 {
                    return Err(Error::new(ErrorKind::InvalidData, "Request message should be 13 bytes long"));
                }
                Message::Request(read_u32(body, 0), read_u32(body, 4), read_u32(body, 8))
            }
            7 => {
                if body.len() < 8 {
                    return Err(Error::new(ErrorKind::InvalidData, "Piece message should be at least 9 bytes long"));
                }
                Message::Piece(read_u32(body, 0), read_u32(body, 4), body[8..].to_vec())
            }
            8 => {
                if body.len() != 12 {
                    return Err(Error::new(ErrorKind::InvalidData, "Cancel message should be 13 bytes long"));
                }
                Message::Cancel(read_u32(body, 0), read_u32(body, 4), read_u32(body, 8))
            }
            9 => {
                if body.len() != 2 {
                    return Err(Error::new(ErrorKind::InvalidData, "Port message should be 3 bytes long"));
                }
                let mut port = [0; 2];
                port.copy_from_slice(body);
                Message::Port(u16::from_be_bytes(port))
            }
            20 => {
                if body.is_empty() {
                    return Err(Error::new(ErrorKind::InvalidData, "Extended message needs a sub-message id"));
                }
                Message::Extended(body[0], body[1..].to_vec())
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Unknown message id {}", id),
                ))
            }
        };
        Ok(msg)
    }

    pub fn id(&self) -> u8 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request(_, _, _) => 6,
            Message::Piece(_, _, _) => 7,
            Message::Cancel(_, _, _) => 8,
            Message::Port(_) => 9,
            Message::Extended(_, _) => 20,
        }
    }

    /// Payload length excluding the 4-byte length prefix.
    pub fn len(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Choke => 1,
            Message::Unchoke => 1,
            Message::Interested => 1,
            Message::NotInterested => 1,
            Message::Have(_) => 5,
            Message::Bitfield(bitfield) => 1 + bitfield.len(),
            Message::Request(_, _, _) => 13,
            Message::Piece(_, _, block) => 9 + block.len(),
            Message::Cancel(_, _, _) => 13,
            Message::Port(_) => 3,
            Message::Extended(_, payload) => 2 + payload.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_u32(body: &[u8], at: usize) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&body[at..at + 4]);
    u32::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_round_trips() {
        let msg = Message::KeepAlive;
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&bytes).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn choke_round_trips() {
        let msg = Message::Choke;
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::deserialize(&bytes).unwrap(), Message::Choke);
    }

    #[test]
    fn bitfield_round_trips_with_large_payload() {
        let msg = Message::Bitfield(vec![0xFF; 512]);
        let bytes = msg.serialize();
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn piece_round_trips_with_a_16kib_block() {
        let msg = Message::Piece(0, 0, vec![7u8; 16384]);
        let bytes = msg.serialize();
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn extended_round_trips() {
        let msg = Message::Extended(0, b"d1:md11:ut_metadatai3eee".to_vec());
        let bytes = msg.serialize();
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn rejects_frame_whose_length_prefix_lies() {
        let mut bytes = Message::Choke.serialize();
        bytes[3] = 99; // claim a 99-byte payload that isn't there
        assert!(Message::deserialize(&bytes).is_err());
    }
}
