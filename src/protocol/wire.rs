//! Wire framing
//!
//! A buffered decoder for the handshake and length-prefixed frames, and the
//! two-strike liveness guard used to drop connections that never finish
//! their handshake.

use bytes::{Buf, BytesMut};
use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::message::Message;
use crate::error::TorrentError;

/// Largest accepted frame body: a 1 MiB block plus the piece header
pub const MAX_FRAME_LENGTH: usize = (1 << 20) + 13;

/// Incremental decoder over a read buffer
///
/// Reads go through `read_buf`, so a read future dropped by `select!`
/// leaves any partial frame in the buffer for the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(16 * 1024) }
    }

    /// Feed bytes obtained elsewhere (e.g. left over from MSE negotiation)
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take a handshake off the buffer if one is complete
    pub fn decode_handshake(&mut self) -> Result<Option<Handshake>> {
        if self.buffer.len() < HANDSHAKE_LENGTH {
            return Ok(None);
        }
        let handshake = Handshake::deserialize(&self.buffer[..HANDSHAKE_LENGTH])?;
        self.buffer.advance(HANDSHAKE_LENGTH);
        Ok(Some(handshake))
    }

    /// Take a message off the buffer if one is complete
    pub fn decode_frame(&mut self, fast_enabled: bool) -> Result<Option<Message>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::protocol_violation(format!(
                "Frame of {} bytes exceeds limit of {}",
                length, MAX_FRAME_LENGTH
            ))
            .into());
        }
        if self.buffer.len() < 4 + length {
            return Ok(None);
        }

        self.buffer.advance(4);
        let body = self.buffer.split_to(length);
        let message = Message::parse_body(&body, fast_enabled)?;
        trace!("Decoded {:?} ({} bytes)", message.message_id(), length);
        Ok(Some(message))
    }

    async fn fill<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<()> {
        let read = reader.read_buf(&mut self.buffer).await?;
        if read == 0 {
            debug!("Peer closed the connection with {} bytes buffered", self.buffer.len());
            return Err(TorrentError::network_error("Connection closed by peer").into());
        }
        Ok(())
    }

    /// Read until a full handshake is available
    pub async fn read_handshake<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        loop {
            if let Some(handshake) = self.decode_handshake()? {
                return Ok(handshake);
            }
            self.fill(reader).await?;
        }
    }

    /// Read until a full message is available
    pub async fn read_message<R: AsyncRead + Unpin>(&mut self, reader: &mut R, fast_enabled: bool) -> Result<Message> {
        loop {
            if let Some(message) = self.decode_frame(fast_enabled)? {
                return Ok(message);
            }
            self.fill(reader).await?;
        }
    }
}

/// Write one message and flush
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a handshake and flush
pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W, handshake: &Handshake) -> Result<()> {
    writer.write_all(&handshake.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

/// Result of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Handshake done
    Alive,
    /// First failed check
    Suspect,
    /// Second failed check: close the connection
    Useless,
}

/// Two-strike handshake guard
#[derive(Debug, Default)]
pub struct HandshakeGuard {
    handshaked: bool,
    suspect: bool,
}

impl HandshakeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_handshaked(&mut self) {
        self.handshaked = true;
    }

    /// Periodic check
    pub fn check(&mut self) -> GuardVerdict {
        if self.handshaked {
            GuardVerdict::Alive
        } else if self.suspect {
            GuardVerdict::Useless
        } else {
            self.suspect = true;
            GuardVerdict::Suspect
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{kind_of, TorrentError};

    #[test]
    fn test_decode_frames_across_partial_reads() {
        let mut decoder = FrameDecoder::new();
        let bytes = [Message::Have { piece_index: 7 }.serialize(), Message::KeepAlive.serialize()].concat();

        decoder.extend(&bytes[..3]);
        assert!(decoder.decode_frame(false).unwrap().is_none());
        decoder.extend(&bytes[3..7]);
        assert!(decoder.decode_frame(false).unwrap().is_none());
        decoder.extend(&bytes[7..]);
        assert_eq!(decoder.decode_frame(false).unwrap(), Some(Message::Have { piece_index: 7 }));
        assert_eq!(decoder.decode_frame(false).unwrap(), Some(Message::KeepAlive));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_oversized_frame_is_protocol_violation() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_FRAME_LENGTH as u32) + 1).to_be_bytes());
        let err = decoder.decode_frame(false).unwrap_err();
        assert!(matches!(kind_of(&err), Some(TorrentError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_handshake_then_frames() {
        let mut decoder = FrameDecoder::new();
        let handshake = Handshake::new([4u8; 20], [5u8; 20]);
        decoder.extend(&handshake.serialize());
        decoder.extend(&Message::Interested.serialize());

        assert_eq!(decoder.decode_handshake().unwrap(), Some(handshake));
        assert_eq!(decoder.decode_frame(false).unwrap(), Some(Message::Interested));
    }

    #[tokio::test]
    async fn test_read_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let sent = handshake.clone();
        let writer = tokio::spawn(async move {
            write_handshake(&mut a, &sent).await.unwrap();
            write_message(&mut a, &Message::Piece { index: 1, begin: 0, block: vec![9; 100] }).await.unwrap();
        });

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.read_handshake(&mut b).await.unwrap(), handshake);
        let message = decoder.read_message(&mut b, false).await.unwrap();
        assert_eq!(message.block_len(), Some(100));
        writer.await.unwrap();

        assert!(decoder.read_message(&mut b, false).await.is_err());
    }

    #[test]
    fn test_two_strike_guard() {
        let mut guard = HandshakeGuard::new();
        assert_eq!(guard.check(), GuardVerdict::Suspect);
        assert_eq!(guard.check(), GuardVerdict::Useless);

        let mut guard = HandshakeGuard::new();
        assert_eq!(guard.check(), GuardVerdict::Suspect);
        guard.mark_handshaked();
        assert_eq!(guard.check(), GuardVerdict::Alive);
    }
}
