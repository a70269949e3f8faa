use ring::aead;

use crate::crypto::dh::DhGroup;
use crate::crypto::{CryptoError, PrfAlgorithm, SymKey};

/// Encryption transforms the daemon will negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncrAlgorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl EncrAlgorithm {
    pub fn ikev2_id(self) -> u16 {
        match self {
            EncrAlgorithm::Aes256Gcm => 20,
            EncrAlgorithm::ChaCha20Poly1305 => 28,
        }
    }

    pub fn from_ikev2_id(id: u16) -> Option<Self> {
        match id {
            20 => Some(EncrAlgorithm::Aes256Gcm),
            28 => Some(EncrAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    fn ring_alg(self) -> &'static aead::Algorithm {
        match self {
            EncrAlgorithm::Aes256Gcm => &aead::AES_256_GCM,
            EncrAlgorithm::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    pub fn key_len(self) -> usize {
        32
    }

    pub fn nonce_len(self) -> usize {
        12
    }

    pub fn tag_len(self) -> usize {
        16
    }
}

/// The negotiated transform set of an IKE SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub encr: EncrAlgorithm,
    pub prf: PrfAlgorithm,
    pub dh: DhGroup,
}

impl CipherSuite {
    pub fn seal(
        &self,
        key: &SymKey,
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let unbound = aead::UnboundKey::new(self.encr.ring_alg(), key.as_bytes())
            .map_err(|_| CryptoError::Cipher("bad key size".to_string()))?;
        let sealing = aead::LessSafeKey::new(unbound);

        let mut in_out = plaintext.to_vec();
        let nonce = aead::Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| CryptoError::Cipher("bad nonce".to_string()))?;
        sealing
            .seal_in_place_append_tag(nonce, aead::Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::Cipher("encryption failed".to_string()))?;
        Ok(in_out)
    }

    pub fn open(
        &self,
        key: &SymKey,
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let unbound = aead::UnboundKey::new(self.encr.ring_alg(), key.as_bytes())
            .map_err(|_| CryptoError::Cipher("bad key size".to_string()))?;
        let opening = aead::LessSafeKey::new(unbound);

        let mut in_out = ciphertext.to_vec();
        let nonce = aead::Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| CryptoError::Cipher("bad nonce".to_string()))?;
        let plaintext = opening
            .open_in_place(nonce, aead::Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::Cipher("decryption failed".to_string()))?;
        Ok(plaintext.to_vec())
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        CipherSuite {
            encr: EncrAlgorithm::Aes256Gcm,
            prf: PrfAlgorithm::HmacSha256,
            dh: DhGroup::EcpP256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let suite = CipherSuite::default();
        let key = SymKey::new(vec![7u8; 32]);
        let nonce = [1u8; 12];
        let aad = b"header bytes";

        let sealed = suite.seal(&key, &nonce, aad, b"the plaintext").unwrap();
        assert_ne!(&sealed[..13], b"the plaintext");
        let opened = suite.open(&key, &nonce, aad, &sealed).unwrap();
        assert_eq!(opened, b"the plaintext");
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let suite = CipherSuite::default();
        let key = SymKey::new(vec![7u8; 32]);
        let nonce = [1u8; 12];
        let sealed = suite.seal(&key, &nonce, b"aad one", b"data").unwrap();
        assert!(suite.open(&key, &nonce, b"aad two", &sealed).is_err());
    }
}
