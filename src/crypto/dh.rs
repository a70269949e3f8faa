use ring::agreement;
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoError, SymKey};

/// Diffie-Hellman groups by IANA IKEv2 transform id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhGroup {
    /// Group 19, 256-bit random ECP
    EcpP256,
    /// Group 20, 384-bit random ECP
    EcpP384,
    /// Group 31, Curve25519
    Curve25519,
}

impl DhGroup {
    pub fn from_ikev2_id(id: u16) -> Option<Self> {
        match id {
            19 => Some(DhGroup::EcpP256),
            20 => Some(DhGroup::EcpP384),
            31 => Some(DhGroup::Curve25519),
            _ => None,
        }
    }

    pub fn ikev2_id(self) -> u16 {
        match self {
            DhGroup::EcpP256 => 19,
            DhGroup::EcpP384 => 20,
            DhGroup::Curve25519 => 31,
        }
    }

    fn ring_alg(self) -> &'static agreement::Algorithm {
        match self {
            DhGroup::EcpP256 => &agreement::ECDH_P256,
            DhGroup::EcpP384 => &agreement::ECDH_P384,
            DhGroup::Curve25519 => &agreement::X25519,
        }
    }

    /// Length of the KE payload body for this group.
    pub fn ke_len(self) -> usize {
        match self {
            DhGroup::EcpP256 => 65,
            DhGroup::EcpP384 => 97,
            DhGroup::Curve25519 => 32,
        }
    }
}

/// A group-specific private exponent plus its public value.
///
/// Exactly one actor owns a DhSecret at any moment: the SA state on the
/// event loop, or an in-flight crypto task. Transfers null the source
/// before writing the destination. The private half is single-use; it is
/// consumed by `compute_shared` while the public shell survives the
/// round-trip back to the state.
pub struct DhSecret {
    group: DhGroup,
    private: Option<agreement::EphemeralPrivateKey>,
    public_value: Vec<u8>,
}

impl DhSecret {
    pub fn generate(group: DhGroup) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let private = agreement::EphemeralPrivateKey::generate(group.ring_alg(), &rng)
            .map_err(|_| CryptoError::Rng)?;
        let public = private
            .compute_public_key()
            .map_err(|e| CryptoError::KeyExchange(format!("public key derivation: {:?}", e)))?;
        Ok(DhSecret {
            group,
            private: Some(private),
            public_value: public.as_ref().to_vec(),
        })
    }

    pub fn group(&self) -> DhGroup {
        self.group
    }

    pub fn public_value(&self) -> &[u8] {
        &self.public_value
    }

    /// Derive the shared secret from the peer's KE value. Consumes the
    /// private exponent. Safe to call from a worker thread; touches no
    /// state beyond this object.
    pub fn compute_shared(&mut self, remote_ke: &[u8]) -> Result<SymKey, CryptoError> {
        let private = self.private.take().ok_or(CryptoError::SecretConsumed)?;
        let peer = agreement::UnparsedPublicKey::new(self.group.ring_alg(), remote_ke);
        agreement::agree_ephemeral(private, &peer, |shared| SymKey::new(shared.to_vec()))
            .map_err(|e| CryptoError::KeyExchange(format!("agreement: {:?}", e)))
    }
}

impl std::fmt::Debug for DhSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DhSecret(group {}, {})",
            self.group.ikev2_id(),
            if self.private.is_some() { "live" } else { "consumed" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_round_trip() {
        for id in [19u16, 20, 31] {
            let g = DhGroup::from_ikev2_id(id).unwrap();
            assert_eq!(g.ikev2_id(), id);
        }
        assert!(DhGroup::from_ikev2_id(14).is_none());
    }

    #[test]
    fn shared_secret_agrees() {
        let mut a = DhSecret::generate(DhGroup::Curve25519).unwrap();
        let mut b = DhSecret::generate(DhGroup::Curve25519).unwrap();
        assert_eq!(a.public_value().len(), DhGroup::Curve25519.ke_len());

        let ab = a.compute_shared(&b.public_value().to_vec()).unwrap();
        let ba = b.compute_shared(&a.public_value().to_vec()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn private_half_is_single_use() {
        let mut a = DhSecret::generate(DhGroup::EcpP256).unwrap();
        let peer = DhSecret::generate(DhGroup::EcpP256).unwrap();
        a.compute_shared(peer.public_value()).unwrap();
        match a.compute_shared(peer.public_value()) {
            Err(CryptoError::SecretConsumed) => {}
            other => panic!("expected SecretConsumed, got {:?}", other.map(|_| ())),
        }
    }
}
