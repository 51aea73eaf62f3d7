//! Peer wire protocol messages (spec §4.1), after the handshake. Each
//! message is framed as a 4-byte big-endian length prefix followed by that
//! many bytes, the first of which (when the length is nonzero) is the
//! message id.

use std::io::Read;

use crate::error::EngineError;

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
}

impl Message {
    /// Serializes the full wire frame, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![0, 0, 0, 0],
            Message::Choke => vec![0, 0, 0, 1, 0],
            Message::Unchoke => vec![0, 0, 0, 1, 1],
            Message::Interested => vec![0, 0, 0, 1, 2],
            Message::NotInterested => vec![0, 0, 0, 1, 3],
            Message::Have(index) => {
                let mut msg = (5u32).to_be_bytes().to_vec();
                msg.push(4);
                msg.extend_from_slice(&index.to_be_bytes());
                msg
            }
            Message::Bitfield(bits) => {
                let mut msg = (1 + bits.len() as u32).to_be_bytes().to_vec();
                msg.push(5);
                msg.extend_from_slice(bits);
                msg
            }
            Message::Request(index, begin, length) => {
                let mut msg = (13u32).to_be_bytes().to_vec();
                msg.push(6);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
                msg
            }
            Message::Piece(index, begin, block) => {
                let mut msg = (9 + block.len() as u32).to_be_bytes().to_vec();
                msg.push(7);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(block);
                msg
            }
            Message::Cancel(index, begin, length) => {
                let mut msg = (13u32).to_be_bytes().to_vec();
                msg.push(8);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
                msg
            }
            Message::Port(port) => {
                let mut msg = (3u32).to_be_bytes().to_vec();
                msg.push(9);
                msg.extend_from_slice(&port.to_be_bytes());
                msg
            }
        }
    }

    /// Parses a message body: `payload[0]` is the id, `payload[1..]` the
    /// arguments. Does not include the 4-byte length prefix — callers read
    /// that separately via [`Message::read_from`].
    fn from_payload(payload: &[u8]) -> Result<Message, EngineError> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = payload[0];
        let body = &payload[1..];
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if body.len() != 4 {
                    return Err(EngineError::MalformedInput(
                        "have message must carry a 4-byte index".into(),
                    ));
                }
                Message::Have(u32::from_be_bytes(body.try_into().unwrap()))
            }
            5 => Message::Bitfield(body.to_vec()),
            6 => {
                if body.len() != 12 {
                    return Err(EngineError::MalformedInput(
                        "request message must be 12 bytes of arguments".into(),
                    ));
                }
                Message::Request(
                    u32::from_be_bytes(body[0..4].try_into().unwrap()),
                    u32::from_be_bytes(body[4..8].try_into().unwrap()),
                    u32::from_be_bytes(body[8..12].try_into().unwrap()),
                )
            }
            7 => {
                if body.len() < 8 {
                    return Err(EngineError::MalformedInput(
                        "piece message must carry index and begin".into(),
                    ));
                }
                Message::Piece(
                    u32::from_be_bytes(body[0..4].try_into().unwrap()),
                    u32::from_be_bytes(body[4..8].try_into().unwrap()),
                    body[8..].to_vec(),
                )
            }
            8 => {
                if body.len() != 12 {
                    return Err(EngineError::MalformedInput(
                        "cancel message must be 12 bytes of arguments".into(),
                    ));
                }
                Message::Cancel(
                    u32::from_be_bytes(body[0..4].try_into().unwrap()),
                    u32::from_be_bytes(body[4..8].try_into().unwrap()),
                    u32::from_be_bytes(body[8..12].try_into().unwrap()),
                )
            }
            9 => {
                if body.len() != 2 {
                    return Err(EngineError::MalformedInput(
                        "port message must carry a 2-byte port".into(),
                    ));
                }
                Message::Port(u16::from_be_bytes(body.try_into().unwrap()))
            }
            other => {
                return Err(EngineError::MalformedInput(format!(
                    "unknown message id {}",
                    other
                )))
            }
        };
        Ok(msg)
    }

    /// Reads one length-prefixed frame from a blocking stream.
    pub fn read_from(reader: &mut impl Read) -> Result<Message, EngineError> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        Message::from_payload(&payload)
    }

    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_, _, _) => Some(6),
            Message::Piece(_, _, _) => Some(7),
            Message::Cancel(_, _, _) => Some(8),
            Message::Port(_) => Some(9),
        }
    }
}
