use crate::ids::NodeId;
use ed25519_dalek::{Signer as DalekSigner, SigningKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signing seed is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("signing seed must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Packet signing service used by the consensus engine.
///
/// Verification is the peer's business and lives outside this crate.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// Ed25519 signer backed by a 32-byte seed.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_hex_seed(seed: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(seed.trim())?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::InvalidLength(bytes.len()))?;
        Ok(Self::from_seed(seed))
    }

    /// Deterministic key derived from the node id. Only suitable for test
    /// networks where keys are not secret.
    pub fn from_node_id(id: &NodeId) -> Self {
        let digest = Sha256::digest(id.as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        Self::from_seed(seed)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_are_deterministic() {
        let signer = Ed25519Signer::from_node_id(&NodeId::from("node-1"));
        assert_eq!(signer.sign(b"proof"), signer.sign(b"proof"));
        assert_eq!(signer.sign(b"proof").len(), 64);
    }

    #[test]
    fn test_hex_seed_length_is_checked() {
        assert!(matches!(
            Ed25519Signer::from_hex_seed("abcd"),
            Err(SignerError::InvalidLength(2))
        ));
        assert!(Ed25519Signer::from_hex_seed(&"11".repeat(32)).is_ok());
        assert!(matches!(
            Ed25519Signer::from_hex_seed("zz"),
            Err(SignerError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_distinct_nodes_get_distinct_keys() {
        let a = Ed25519Signer::from_node_id(&NodeId::from("a"));
        let b = Ed25519Signer::from_node_id(&NodeId::from("b"));
        assert_ne!(a.public_key_hex(), b.public_key_hex());
    }
}
