//! Stream cipher layer
//!
//! RC4 keyed from the MSE shared secret, and [`CryptoStream`], a decorator
//! that encrypts and decrypts everything passing through an inner stream.
//! The framing code above it never sees ciphertext.

use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Keystream bytes discarded after keying
pub const RC4_DISCARD: usize = 1024;

/// RC4 stream cipher
#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rc4").finish_non_exhaustive()
    }
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (i, s) in state.iter_mut().enumerate() {
            *s = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Self { state, i: 0, j: 0 }
    }

    /// Keyed cipher with the first [`RC4_DISCARD`] keystream bytes dropped
    pub fn with_discard(key: &[u8]) -> Self {
        let mut cipher = Self::new(key);
        let mut discard = [0u8; RC4_DISCARD];
        cipher.apply(&mut discard);
        cipher
    }

    /// XOR the keystream into `data` in place
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state[self.state[self.i as usize].wrapping_add(self.state[self.j as usize]) as usize];
            *byte ^= k;
        }
    }
}

/// `sha1(label || secret || skey)`, the per-direction RC4 key
pub fn derive_key(label: &[u8], secret: &[u8], skey: &[u8; 20]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(label);
    hasher.update(secret);
    hasher.update(skey);
    hasher.finalize().into()
}

/// Cipher pair for one side of a connection
#[derive(Debug, Clone)]
pub struct CipherPair {
    pub encryptor: Rc4,
    pub decryptor: Rc4,
}

impl CipherPair {
    /// Initiator encrypts with keyA and decrypts with keyB
    pub fn initiator(secret: &[u8], skey: &[u8; 20]) -> Self {
        Self {
            encryptor: Rc4::with_discard(&derive_key(b"keyA", secret, skey)),
            decryptor: Rc4::with_discard(&derive_key(b"keyB", secret, skey)),
        }
    }

    /// Receiver encrypts with keyB and decrypts with keyA
    pub fn receiver(secret: &[u8], skey: &[u8; 20]) -> Self {
        Self {
            encryptor: Rc4::with_discard(&derive_key(b"keyB", secret, skey)),
            decryptor: Rc4::with_discard(&derive_key(b"keyA", secret, skey)),
        }
    }
}

/// Transparent encryption decorator over an async stream
///
/// With no cipher installed it is a plain passthrough that still serves any
/// bytes read ahead during negotiation.
#[derive(Debug)]
pub struct CryptoStream<S> {
    inner: S,
    ciphers: Option<CipherPair>,
    /// Plaintext already read from the wire
    read_ahead: BytesMut,
    /// Ciphertext accepted from the caller but not yet written
    write_pending: BytesMut,
}

impl<S> CryptoStream<S> {
    pub fn plaintext(inner: S, read_ahead: Vec<u8>) -> Self {
        Self {
            inner,
            ciphers: None,
            read_ahead: BytesMut::from(&read_ahead[..]),
            write_pending: BytesMut::new(),
        }
    }

    pub fn encrypted(inner: S, ciphers: CipherPair, read_ahead: Vec<u8>) -> Self {
        Self {
            inner,
            ciphers: Some(ciphers),
            read_ahead: BytesMut::from(&read_ahead[..]),
            write_pending: BytesMut::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.ciphers.is_some()
    }
}

impl<S: AsyncWrite + Unpin> CryptoStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_pending.is_empty() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_pending))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_pending.advance(written);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CryptoStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_ahead.is_empty() {
            let n = this.read_ahead.len().min(buf.remaining());
            buf.put_slice(&this.read_ahead[..n]);
            this.read_ahead.advance(n);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(ciphers) = this.ciphers.as_mut() {
            ciphers.decryptor.apply(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CryptoStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.ciphers.is_none() {
            return Pin::new(&mut this.inner).poll_write(cx, data);
        }

        // Bytes are encrypted exactly once and wait in `write_pending`
        // until the inner stream takes them
        if !this.write_pending.is_empty() {
            ready!(this.poll_drain(cx))?;
        }
        let start = this.write_pending.len();
        this.write_pending.extend_from_slice(data);
        if let Some(ciphers) = this.ciphers.as_mut() {
            ciphers.encryptor.apply(&mut this.write_pending[start..]);
        }
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_rc4_known_vector() {
        let mut cipher = Rc4::new(b"Key");
        let mut data = *b"Plaintext";
        cipher.apply(&mut data);
        assert_eq!(hex::encode(data), "bbf316e8d940af0ad3");
    }

    #[test]
    fn test_cipher_pairs_are_symmetric() {
        let secret = [7u8; 96];
        let skey = [9u8; 20];
        let mut a = CipherPair::initiator(&secret, &skey);
        let mut b = CipherPair::receiver(&secret, &skey);

        let mut data = b"hello swarm".to_vec();
        a.encryptor.apply(&mut data);
        assert_ne!(&data[..], b"hello swarm");
        b.decryptor.apply(&mut data);
        assert_eq!(&data[..], b"hello swarm");

        let mut reply = b"ack".to_vec();
        b.encryptor.apply(&mut reply);
        a.decryptor.apply(&mut reply);
        assert_eq!(&reply[..], b"ack");
    }

    #[tokio::test]
    async fn test_crypto_stream_round_trip() {
        let (left, right) = tokio::io::duplex(32);
        let secret = [3u8; 96];
        let skey = [4u8; 20];
        let mut a = CryptoStream::encrypted(left, CipherPair::initiator(&secret, &skey), Vec::new());
        let mut b = CryptoStream::encrypted(right, CipherPair::receiver(&secret, &skey), Vec::new());

        let payload: Vec<u8> = (0..200u8).collect();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            a.write_all(&sent).await.unwrap();
            a.flush().await.unwrap();
            a
        });

        let mut received = vec![0u8; payload.len()];
        b.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_plaintext_serves_read_ahead_first() {
        let (mut left, right) = tokio::io::duplex(32);
        let mut stream = CryptoStream::plaintext(right, b"abc".to_vec());
        left.write_all(b"def").await.unwrap();

        let mut out = [0u8; 6];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"abcdef");
        assert!(!stream.is_encrypted());
    }
}
