//! DHT announce tokens
//!
//! A token is `sha1(secret || ip)`. The secret rotates on a fixed interval
//! and the previous secret stays valid for one more period, so a token
//! handed out just before a rotation is still accepted.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use sha1::{Digest, Sha1};
use tracing::debug;

/// How often the secret rotates
pub const TOKEN_ROTATION: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub struct TokenManager {
    current: [u8; 16],
    previous: [u8; 16],
    rotated_at: Instant,
    rotation: Duration,
}

impl TokenManager {
    pub fn new() -> Self {
        Self::with_rotation(TOKEN_ROTATION)
    }

    pub fn with_rotation(rotation: Duration) -> Self {
        let current = Self::random_secret();
        Self {
            current,
            previous: current,
            rotated_at: Instant::now(),
            rotation,
        }
    }

    fn random_secret() -> [u8; 16] {
        let mut secret = [0u8; 16];
        rand::thread_rng().fill(&mut secret);
        secret
    }

    fn derive(secret: &[u8; 16], ip: &IpAddr) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        match ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        hasher.finalize().to_vec()
    }

    /// Rotate the secret if the rotation interval has elapsed
    pub fn maybe_rotate(&mut self) {
        if self.rotated_at.elapsed() >= self.rotation {
            self.rotate();
        }
    }

    /// Rotate the secret now
    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = Self::random_secret();
        self.rotated_at = Instant::now();
        debug!("Rotated DHT token secret");
    }

    /// Token handed to a querier at `ip`
    pub fn generate(&mut self, ip: &IpAddr) -> Vec<u8> {
        self.maybe_rotate();
        Self::derive(&self.current, ip)
    }

    /// Whether `token` was issued to `ip` under the current or previous secret
    pub fn validate(&mut self, ip: &IpAddr, token: &[u8]) -> bool {
        self.maybe_rotate();
        token == Self::derive(&self.current, ip).as_slice() || token == Self::derive(&self.previous, ip).as_slice()
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}
