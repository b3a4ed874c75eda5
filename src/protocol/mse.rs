//! Message stream encryption
//!
//! Diffie-Hellman key exchange over the 768-bit MSE prime, followed by the
//! obfuscated info-hash exchange and crypto negotiation. Both roles end
//! with a [`CryptoStream`] that the peer-wire handshake is written through.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use num_bigint::BigUint;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::crypto::{CipherPair, CryptoStream};
use super::handshake::PROTOCOL_STRING;
use crate::error::TorrentError;

/// Diffie-Hellman public key length
pub const PUBLIC_KEY_LENGTH: usize = 96;
/// Private key length (160 bits)
pub const PRIVATE_KEY_LENGTH: usize = 20;
/// Largest random padding
pub const MAX_PADDING: usize = 512;
/// Verification constant: eight zero bytes
pub const VC: [u8; 8] = [0u8; 8];

pub const PROVIDE_PLAINTEXT: u32 = 0x01;
pub const PROVIDE_RC4: u32 = 0x02;

const GENERATOR: u32 = 2;

const PRIME: [u8; PUBLIC_KEY_LENGTH] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

/// Encryption policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    /// Never encrypt
    Plaintext,
    /// Connect in plaintext, accept either
    #[default]
    PreferPlaintext,
    /// Connect encrypted, accept either
    PreferEncrypt,
    /// Encrypted only, both directions
    Encrypt,
}

impl EncryptionMode {
    /// Whether outbound connections start with MSE
    pub fn crypt(self) -> bool {
        matches!(self, EncryptionMode::PreferEncrypt | EncryptionMode::Encrypt)
    }

    /// crypto_provide bits we offer
    pub fn provide(self) -> u32 {
        match self {
            EncryptionMode::Plaintext => PROVIDE_PLAINTEXT,
            EncryptionMode::PreferPlaintext | EncryptionMode::PreferEncrypt => PROVIDE_PLAINTEXT | PROVIDE_RC4,
            EncryptionMode::Encrypt => PROVIDE_RC4,
        }
    }

    /// Whether an unencrypted inbound handshake is acceptable
    pub fn allows_plaintext(self) -> bool {
        self != EncryptionMode::Encrypt
    }

    /// Pick one method out of a peer's crypto_provide
    pub fn select(self, provide: u32) -> Option<u32> {
        let both = provide & self.provide();
        let preferred = if self.crypt() { PROVIDE_RC4 } else { PROVIDE_PLAINTEXT };
        if both & preferred != 0 {
            Some(preferred)
        } else if both & PROVIDE_RC4 != 0 {
            Some(PROVIDE_RC4)
        } else if both & PROVIDE_PLAINTEXT != 0 {
            Some(PROVIDE_PLAINTEXT)
        } else {
            None
        }
    }
}

/// Ephemeral Diffie-Hellman key pair
pub struct KeyPair {
    private: BigUint,
    public: [u8; PUBLIC_KEY_LENGTH],
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut private = [0u8; PRIVATE_KEY_LENGTH];
        rand::thread_rng().fill(&mut private);
        let private = BigUint::from_bytes_be(&private);
        let public = BigUint::from(GENERATOR).modpow(&private, &prime());
        Self { private, public: to_fixed(&public) }
    }

    pub fn public(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.public
    }

    /// `S = Y^x mod P`
    pub fn shared_secret(&self, their_public: &[u8]) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
        let p = prime();
        let y = BigUint::from_bytes_be(their_public);
        if y <= BigUint::from(1u32) || y >= &p - 1u32 {
            return Err(TorrentError::protocol_violation("Degenerate MSE public key").into());
        }
        Ok(to_fixed(&y.modpow(&self.private, &p)))
    }
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&PRIME)
}

fn to_fixed(value: &BigUint) -> [u8; PUBLIC_KEY_LENGTH] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; PUBLIC_KEY_LENGTH];
    out[PUBLIC_KEY_LENGTH - bytes.len()..].copy_from_slice(&bytes);
    out
}

fn hash(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `HASH('req2', SKEY) xor HASH('req3', S)`
fn obfuscated_hash(info_hash: &[u8; 20], secret: &[u8]) -> [u8; 20] {
    let req2 = hash(&[b"req2", info_hash]);
    let req3 = hash(&[b"req3", secret]);
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = req2[i] ^ req3[i];
    }
    out
}

fn padding(random: bool) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=MAX_PADDING);
    let mut pad = vec![0u8; len];
    if random {
        rng.fill(&mut pad[..]);
    }
    pad
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut, want: usize) -> Result<()> {
    while buf.len() < want {
        if stream.read_buf(buf).await? == 0 {
            return Err(TorrentError::network_error("Connection closed during MSE handshake").into());
        }
    }
    Ok(())
}

/// Read until `pattern` shows up within `limit` bytes of `start`
///
/// Returns the offset just past the pattern.
async fn sync<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    start: usize,
    pattern: &[u8],
    limit: usize,
) -> Result<usize> {
    let horizon = start + limit + pattern.len();
    loop {
        if buf.len() >= start + pattern.len() {
            let window = &buf[start..buf.len().min(horizon)];
            if let Some(pos) = window.windows(pattern.len()).position(|w| w == pattern) {
                return Ok(start + pos + pattern.len());
            }
        }
        if buf.len() >= horizon {
            return Err(TorrentError::protocol_violation("MSE synchronisation failed").into());
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(TorrentError::network_error("Connection closed during MSE handshake").into());
        }
    }
}

/// Decrypt the next `len` bytes of `buf` in place and take them
async fn take_decrypted<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    ciphers: &mut CipherPair,
    len: usize,
) -> Result<BytesMut> {
    fill(stream, buf, len).await?;
    let mut chunk = buf.split_to(len);
    ciphers.decryptor.apply(&mut chunk);
    Ok(chunk)
}

fn remainder(mut buf: BytesMut, ciphers: &mut CipherPair, encrypted: bool) -> Vec<u8> {
    if encrypted {
        ciphers.decryptor.apply(&mut buf);
    }
    buf.to_vec()
}

/// Outbound MSE handshake
pub async fn initiate<S>(mut stream: S, info_hash: [u8; 20], mode: EncryptionMode) -> Result<CryptoStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let keys = KeyPair::generate();
    let mut out = BytesMut::new();
    out.put_slice(keys.public());
    out.put_slice(&padding(true));
    stream.write_all(&out).await?;
    stream.flush().await?;
    trace!("MSE: sent public key with {} bytes of padding", out.len() - PUBLIC_KEY_LENGTH);

    let mut buf = BytesMut::with_capacity(1024);
    fill(&mut stream, &mut buf, PUBLIC_KEY_LENGTH).await?;
    let secret = keys.shared_secret(&buf[..PUBLIC_KEY_LENGTH])?;
    buf.advance(PUBLIC_KEY_LENGTH);

    let mut ciphers = CipherPair::initiator(&secret, &info_hash);
    let pad_c = padding(false);
    let mut out = BytesMut::new();
    out.put_slice(&hash(&[b"req1", &secret]));
    out.put_slice(&obfuscated_hash(&info_hash, &secret));
    let encrypted_from = out.len();
    out.put_slice(&VC);
    out.put_u32(mode.provide());
    out.put_u16(pad_c.len() as u16);
    out.put_slice(&pad_c);
    out.put_u16(0);
    ciphers.encryptor.apply(&mut out[encrypted_from..]);
    stream.write_all(&out).await?;
    stream.flush().await?;

    let mut trial = ciphers.decryptor.clone();
    let mut encrypted_vc = VC;
    trial.apply(&mut encrypted_vc);
    let after_vc = sync(&mut stream, &mut buf, 0, &encrypted_vc, MAX_PADDING).await?;
    buf.advance(after_vc);
    ciphers.decryptor = trial;

    let mut header = take_decrypted(&mut stream, &mut buf, &mut ciphers, 6).await?;
    let select = header.get_u32();
    let pad_d = header.get_u16() as usize;
    if pad_d > MAX_PADDING {
        return Err(TorrentError::protocol_violation(format!("MSE padding of {} bytes", pad_d)).into());
    }
    take_decrypted(&mut stream, &mut buf, &mut ciphers, pad_d).await?;

    match select {
        PROVIDE_RC4 => {
            debug!("MSE: negotiated RC4");
            let read_ahead = remainder(buf, &mut ciphers, true);
            Ok(CryptoStream::encrypted(stream, ciphers, read_ahead))
        }
        PROVIDE_PLAINTEXT if mode.allows_plaintext() => {
            debug!("MSE: negotiated plaintext");
            Ok(CryptoStream::plaintext(stream, buf.to_vec()))
        }
        other => Err(TorrentError::protocol_violation(format!("MSE: peer selected unusable method {}", other)).into()),
    }
}

/// Inbound connection after MSE (or plaintext detection)
pub struct Accepted<S> {
    pub stream: CryptoStream<S>,
    /// Torrent identified during MSE, None for plaintext connections
    pub info_hash: Option<[u8; 20]>,
}

/// Inbound MSE handshake
///
/// A connection that opens with the plaintext protocol header is passed
/// through untouched when the policy allows it.
pub async fn accept<S>(mut stream: S, info_hashes: &[[u8; 20]], mode: EncryptionMode) -> Result<Accepted<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    fill(&mut stream, &mut buf, 20).await?;
    if buf[0] == PROTOCOL_STRING.len() as u8 && &buf[1..20] == PROTOCOL_STRING.as_bytes() {
        if !mode.allows_plaintext() {
            return Err(TorrentError::protocol_violation("Plaintext connection refused").into());
        }
        return Ok(Accepted { stream: CryptoStream::plaintext(stream, buf.to_vec()), info_hash: None });
    }
    if mode == EncryptionMode::Plaintext {
        return Err(TorrentError::protocol_violation("Encrypted connection refused").into());
    }

    fill(&mut stream, &mut buf, PUBLIC_KEY_LENGTH).await?;
    let keys = KeyPair::generate();
    let secret = keys.shared_secret(&buf[..PUBLIC_KEY_LENGTH])?;
    buf.advance(PUBLIC_KEY_LENGTH);

    let mut out = BytesMut::new();
    out.put_slice(keys.public());
    out.put_slice(&padding(true));
    stream.write_all(&out).await?;
    stream.flush().await?;

    let req1 = hash(&[b"req1", &secret]);
    let after_req1 = sync(&mut stream, &mut buf, 0, &req1, MAX_PADDING).await?;
    buf.advance(after_req1);

    fill(&mut stream, &mut buf, 20).await?;
    let obfuscated = buf.split_to(20);
    let info_hash = info_hashes
        .iter()
        .find(|ih| obfuscated_hash(ih, &secret)[..] == obfuscated[..])
        .copied()
        .ok_or_else(|| TorrentError::protocol_violation("MSE: unknown torrent"))?;

    let mut ciphers = CipherPair::receiver(&secret, &info_hash);
    let mut header = take_decrypted(&mut stream, &mut buf, &mut ciphers, 14).await?;
    if header[..8] != VC {
        return Err(TorrentError::protocol_violation("MSE: bad verification constant").into());
    }
    header.advance(8);
    let provide = header.get_u32();
    let pad_c = header.get_u16() as usize;
    if pad_c > MAX_PADDING {
        return Err(TorrentError::protocol_violation(format!("MSE padding of {} bytes", pad_c)).into());
    }
    take_decrypted(&mut stream, &mut buf, &mut ciphers, pad_c).await?;
    let ia_len = take_decrypted(&mut stream, &mut buf, &mut ciphers, 2).await?.get_u16() as usize;
    let initial_payload = take_decrypted(&mut stream, &mut buf, &mut ciphers, ia_len).await?;

    let select = mode
        .select(provide)
        .ok_or_else(|| TorrentError::protocol_violation(format!("MSE: no common method in {}", provide)))?;

    let pad_d = padding(false);
    let mut out = BytesMut::new();
    out.put_slice(&VC);
    out.put_u32(select);
    out.put_u16(pad_d.len() as u16);
    out.put_slice(&pad_d);
    ciphers.encryptor.apply(&mut out);
    stream.write_all(&out).await?;
    stream.flush().await?;

    let encrypted = select == PROVIDE_RC4;
    let mut read_ahead = initial_payload.to_vec();
    read_ahead.extend_from_slice(&remainder(buf, &mut ciphers, encrypted));
    debug!("MSE: accepted {} for {}", if encrypted { "RC4" } else { "plaintext" }, hex::encode(info_hash));

    let stream = if encrypted {
        CryptoStream::encrypted(stream, ciphers, read_ahead)
    } else {
        CryptoStream::plaintext(stream, read_ahead)
    };
    Ok(Accepted { stream, info_hash: Some(info_hash) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::Handshake;
    use crate::protocol::wire::{write_handshake, FrameDecoder};

    #[test]
    fn test_shared_secret_agrees() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let s1 = a.shared_secret(b.public()).unwrap();
        let s2 = b.shared_secret(a.public()).unwrap();
        assert_eq!(s1, s2);
        assert!(a.shared_secret(&[0u8; 96]).is_err());
    }

    #[test]
    fn test_select() {
        assert_eq!(EncryptionMode::PreferEncrypt.select(PROVIDE_PLAINTEXT | PROVIDE_RC4), Some(PROVIDE_RC4));
        assert_eq!(EncryptionMode::PreferPlaintext.select(PROVIDE_PLAINTEXT | PROVIDE_RC4), Some(PROVIDE_PLAINTEXT));
        assert_eq!(EncryptionMode::PreferPlaintext.select(PROVIDE_RC4), Some(PROVIDE_RC4));
        assert_eq!(EncryptionMode::Encrypt.select(PROVIDE_PLAINTEXT), None);
        assert_eq!(EncryptionMode::Plaintext.select(PROVIDE_RC4), None);
    }

    async fn negotiate(initiator: EncryptionMode, receiver: EncryptionMode) -> (bool, bool) {
        let info_hash = [0x5Au8; 20];
        let (left, right) = tokio::io::duplex(8192);

        let outbound = tokio::spawn(async move {
            let mut stream = initiate(left, info_hash, initiator).await.unwrap();
            write_handshake(&mut stream, &Handshake::new(info_hash, [1u8; 20])).await.unwrap();
            stream
        });

        let mut accepted = accept(right, &[[1u8; 20], info_hash], receiver).await.unwrap();
        assert_eq!(accepted.info_hash, Some(info_hash));
        let mut decoder = FrameDecoder::new();
        let handshake = decoder.read_handshake(&mut accepted.stream).await.unwrap();
        assert_eq!(handshake.info_hash, info_hash);

        let outbound = outbound.await.unwrap();
        (outbound.is_encrypted(), accepted.stream.is_encrypted())
    }

    #[tokio::test]
    async fn test_rc4_negotiation() {
        assert_eq!(negotiate(EncryptionMode::Encrypt, EncryptionMode::PreferEncrypt).await, (true, true));
    }

    #[tokio::test]
    async fn test_plaintext_selected_after_key_exchange() {
        assert_eq!(negotiate(EncryptionMode::PreferPlaintext, EncryptionMode::PreferPlaintext).await, (false, false));
    }

    #[tokio::test]
    async fn test_plaintext_header_passes_through() {
        let (mut left, right) = tokio::io::duplex(1024);
        let handshake = Handshake::new([2u8; 20], [3u8; 20]);
        write_handshake(&mut left, &handshake).await.unwrap();

        let mut accepted = accept(right, &[[2u8; 20]], EncryptionMode::PreferEncrypt).await.unwrap();
        assert_eq!(accepted.info_hash, None);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.read_handshake(&mut accepted.stream).await.unwrap(), handshake);
    }

    #[tokio::test]
    async fn test_plaintext_refused_when_encryption_required() {
        let (mut left, right) = tokio::io::duplex(1024);
        write_handshake(&mut left, &Handshake::new([2u8; 20], [3u8; 20])).await.unwrap();
        assert!(accept(right, &[[2u8; 20]], EncryptionMode::Encrypt).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_torrent_rejected() {
        let (left, right) = tokio::io::duplex(8192);
        let outbound = tokio::spawn(async move { initiate(left, [9u8; 20], EncryptionMode::Encrypt).await });
        assert!(accept(right, &[[8u8; 20]], EncryptionMode::Encrypt).await.is_err());
        assert!(outbound.await.unwrap().is_err());
    }
}
