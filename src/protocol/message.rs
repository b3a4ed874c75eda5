//! Peer-wire messages
//!
//! `<u32 length><u8 id>[payload]` frames. A zero length is a keep-alive.

use bytes::{Buf, BufMut, BytesMut};
use anyhow::Result;
use tracing::trace;

use crate::error::TorrentError;

/// Peer-wire message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    HaveAll = 0x0E,
    HaveNone = 0x0F,
    Extended = 20,
}

impl MessageId {
    /// Whether the id belongs to the fast extension
    pub fn is_fast(self) -> bool {
        matches!(self, MessageId::HaveAll | MessageId::HaveNone)
    }
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            0x0E => Ok(MessageId::HaveAll),
            0x0F => Ok(MessageId::HaveNone),
            20 => Ok(MessageId::Extended),
            _ => Err(TorrentError::protocol_violation(format!("Invalid message ID: {}", value)).into()),
        }
    }
}

/// Peer-wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    HaveAll,
    HaveNone,
    /// LTEP message; `id` 0 is the extension handshake
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Get the message ID (None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::HaveAll => Some(MessageId::HaveAll),
            Message::HaveNone => Some(MessageId::HaveNone),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }

    /// Length of the frame body (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Extended { payload, .. } => 2 + payload.len() as u32,
        }
    }

    /// Payload bytes that count towards transfer statistics
    pub fn block_len(&self) -> Option<usize> {
        match self {
            Message::Piece { block, .. } => Some(block.len()),
            _ => None,
        }
    }

    /// Serialize the message including its length prefix
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            _ => {}
        }

        buf.to_vec()
    }

    /// Deserialize a message including its length prefix
    pub fn deserialize(data: &[u8], fast_enabled: bool) -> Result<Self> {
        if data.len() < 4 {
            return Err(TorrentError::protocol_violation("Message shorter than its length prefix").into());
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() - 4 < length {
            return Err(TorrentError::protocol_violation(format!(
                "Truncated message: expected {} bytes, got {}",
                length,
                data.len() - 4
            ))
            .into());
        }
        Self::parse_body(&data[4..4 + length], fast_enabled)
    }

    /// Parse a frame body (`<id>[payload]`, no length prefix)
    ///
    /// Fast extension ids are only accepted when the capability was
    /// negotiated on this connection.
    pub fn parse_body(body: &[u8], fast_enabled: bool) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let mut buf = &body[1..];
        let message_id = MessageId::try_from(body[0])?;
        trace!("Parsing {:?} with {} payload bytes", message_id, buf.len());

        if message_id.is_fast() && !fast_enabled {
            return Err(TorrentError::protocol_violation(format!(
                "{:?} received without fast extension",
                message_id
            ))
            .into());
        }

        let need = |want: usize, buf: &[u8]| -> Result<()> {
            if buf.len() < want {
                return Err(TorrentError::protocol_violation(format!(
                    "{:?} message too short: expected {} bytes, got {}",
                    message_id,
                    want,
                    buf.len()
                ))
                .into());
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Have => {
                need(4, buf)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => {
                need(12, buf)?;
                Message::Request { index: buf.get_u32(), begin: buf.get_u32(), length: buf.get_u32() }
            }
            MessageId::Cancel => {
                need(12, buf)?;
                Message::Cancel { index: buf.get_u32(), begin: buf.get_u32(), length: buf.get_u32() }
            }
            MessageId::Piece => {
                need(8, buf)?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Port => {
                need(2, buf)?;
                Message::Port { listen_port: buf.get_u16() }
            }
            MessageId::Extended => {
                need(1, buf)?;
                let id = buf.get_u8();
                Message::Extended { id, payload: buf.to_vec() }
            }
        };
        Ok(message)
    }
}
