//! ECDSA signature authentication: P-256 with SHA-256, DER-encoded
//! signatures on the wire. Peers are trusted through pinned raw public
//! keys (X9.62 uncompressed points); certificate-chain walking stays
//! outside this daemon.

use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair, UnparsedPublicKey};

use crate::crypto::CryptoError;

/// Our signing identity for signature-authenticated connections.
pub struct SigKeyPair {
    key: EcdsaKeyPair,
}

impl SigKeyPair {
    /// Load a P-256 private key from PKCS#8 DER bytes.
    pub fn from_pkcs8(der: &[u8]) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let key =
            EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, der, &rng)
                .map_err(|e| CryptoError::BadKey(format!("{:?}", e)))?;
        Ok(SigKeyPair { key })
    }

    /// The public half, in the X9.62 uncompressed form peers pin.
    pub fn public_key(&self) -> &[u8] {
        self.key.public_key().as_ref()
    }

    /// DER-encoded ECDSA signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let rng = SystemRandom::new();
        self.key
            .sign(&rng, data)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|_| CryptoError::Signing)
    }
}

impl std::fmt::Debug for SigKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigKeyPair(p256)")
    }
}

/// Verify a DER ECDSA signature against a pinned peer public key.
pub fn verify_signature(public_key: &[u8], data: &[u8], sig: &[u8]) -> bool {
    UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, public_key)
        .verify(data, sig)
        .is_ok()
}

#[cfg(test)]
pub(crate) fn test_keypair() -> (SigKeyPair, Vec<u8>) {
    let rng = SystemRandom::new();
    let pkcs8 =
        EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
    let pair = SigKeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
    let public = pair.public_key().to_vec();
    (pair, public)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let (pair, public) = test_keypair();
        let sig = pair.sign(b"authenticated octets").unwrap();
        assert!(verify_signature(&public, b"authenticated octets", &sig));
    }

    #[test]
    fn tampered_data_is_rejected() {
        let (pair, public) = test_keypair();
        let sig = pair.sign(b"authenticated octets").unwrap();
        assert!(!verify_signature(&public, b"different octets", &sig));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let (pair, _) = test_keypair();
        let (_, other_public) = test_keypair();
        let sig = pair.sign(b"authenticated octets").unwrap();
        assert!(!verify_signature(&other_public, b"authenticated octets", &sig));
    }

    #[test]
    fn garbage_private_key_is_a_loud_error() {
        assert!(matches!(
            SigKeyPair::from_pkcs8(&[0u8; 16]),
            Err(CryptoError::BadKey(_))
        ));
    }
}
