use ring::hmac;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod cipher;
pub mod dh;
pub mod prf;
pub mod sig;
pub mod task;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("random number generator failure")]
    Rng,
    #[error("key exchange failed: {0}")]
    KeyExchange(String),
    #[error("unsupported DH group {0}")]
    UnsupportedGroup(u16),
    #[error("DH secret already consumed")]
    SecretConsumed,
    #[error("cipher error: {0}")]
    Cipher(String),
    #[error("bad signature key: {0}")]
    BadKey(String),
    #[error("signing failed")]
    Signing,
}

/// Opaque symmetric key handle. The raw bytes are wiped when the handle
/// is dropped, including every intermediate produced by the KDF ladder.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymKey {
    bytes: Vec<u8>,
}

impl SymKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        SymKey { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// First `n` bytes as a fresh key. Panics if the key is shorter;
    /// callers size the source via the stretching loop first.
    pub fn truncated(&self, n: usize) -> SymKey {
        assert!(self.bytes.len() >= n, "symkey too short: {} < {}", self.bytes.len(), n);
        SymKey::new(self.bytes[..n].to_vec())
    }

    pub fn append(&mut self, other: &SymKey) {
        self.bytes.extend_from_slice(&other.bytes);
    }
}

// Key material must never end up in logs.
impl std::fmt::Debug for SymKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymKey({} bytes)", self.bytes.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrfAlgorithm {
    HmacSha1,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl PrfAlgorithm {
    fn ring_alg(self) -> hmac::Algorithm {
        match self {
            PrfAlgorithm::HmacSha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            PrfAlgorithm::HmacSha256 => hmac::HMAC_SHA256,
            PrfAlgorithm::HmacSha384 => hmac::HMAC_SHA384,
            PrfAlgorithm::HmacSha512 => hmac::HMAC_SHA512,
        }
    }

    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha1 => 20,
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// IKEv2 transform id (RFC 7296), also used for the IKEv1 hash mapping.
    pub fn ikev2_id(self) -> u16 {
        match self {
            PrfAlgorithm::HmacSha1 => 2,
            PrfAlgorithm::HmacSha256 => 5,
            PrfAlgorithm::HmacSha384 => 6,
            PrfAlgorithm::HmacSha512 => 7,
        }
    }

    pub fn from_ikev2_id(id: u16) -> Option<Self> {
        match id {
            2 => Some(PrfAlgorithm::HmacSha1),
            5 => Some(PrfAlgorithm::HmacSha256),
            6 => Some(PrfAlgorithm::HmacSha384),
            7 => Some(PrfAlgorithm::HmacSha512),
            _ => None,
        }
    }

    pub fn prf(self, key: &[u8], data: &[u8]) -> SymKey {
        let key = hmac::Key::new(self.ring_alg(), key);
        SymKey::new(hmac::sign(&key, data).as_ref().to_vec())
    }

    /// PRF over a concatenation without materializing it in one buffer.
    pub fn prf_parts(self, key: &[u8], parts: &[&[u8]]) -> SymKey {
        let key = hmac::Key::new(self.ring_alg(), key);
        let mut ctx = hmac::Context::with_key(&key);
        for part in parts {
            ctx.update(part);
        }
        SymKey::new(ctx.sign().as_ref().to_vec())
    }
}

/// Fill `buf` from the system RNG.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::SecureRandom;
    ring::rand::SystemRandom::new()
        .fill(buf)
        .map_err(|_| CryptoError::Rng)
}

/// Fresh nonce of the requested size.
pub fn random_nonce(size: usize) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = vec![0u8; size];
    fill_random(&mut nonce)?;
    Ok(nonce)
}

/// Fresh non-zero 64-bit SPI.
pub fn random_spi() -> Result<u64, CryptoError> {
    loop {
        let mut buf = [0u8; 8];
        fill_random(&mut buf)?;
        let spi = u64::from_be_bytes(buf);
        if spi != 0 {
            return Ok(spi);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prf_matches_direct_hmac() {
        let key = [0x0b; 20];
        let data = b"Hi There";
        let out = PrfAlgorithm::HmacSha256.prf(&key, data);
        let direct = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, &key), data);
        assert_eq!(out.as_bytes(), direct.as_ref());
    }

    #[test]
    fn prf_parts_equals_concatenation() {
        let key = b"test key";
        let joined = PrfAlgorithm::HmacSha1.prf(key, b"abcdef");
        let parts = PrfAlgorithm::HmacSha1.prf_parts(key, &[b"ab", b"cd", b"ef"]);
        assert_eq!(joined.as_bytes(), parts.as_bytes());
    }

    #[test]
    fn truncated_takes_prefix() {
        let k = SymKey::new((0..32).collect());
        let t = k.truncated(16);
        assert_eq!(t.len(), 16);
        assert_eq!(t.as_bytes(), &k.as_bytes()[..16]);
    }

    #[test]
    fn random_spi_is_nonzero() {
        for _ in 0..16 {
            assert_ne!(random_spi().unwrap(), 0);
        }
    }
}
