//! Endpoint private addresses
//!
//! Format: `0{sha256-hex}`
//!
//! The id is derived from the endpoint's ed25519 public key, so a nonce
//! signature can be mapped back to the recipient it authorizes.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Private address of a local endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Version prefix of the address format
    pub const PREFIX: char = '0';

    /// Derive the id of an endpoint public key
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        EndpointId(format!("{}{}", Self::PREFIX, hex::encode(digest)))
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn test_endpoint_id_format() {
        let key = SigningKey::from_bytes(&[1u8; 32]).verifying_key();
        let id = EndpointId::from_public_key(&key);

        assert!(id.as_str().starts_with('0'));
        assert_eq!(id.as_str().len(), 65);
        assert!(id.as_str()[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_endpoint_id_is_stable_and_distinct() {
        let a = SigningKey::from_bytes(&[1u8; 32]).verifying_key();
        let b = SigningKey::from_bytes(&[2u8; 32]).verifying_key();

        assert_eq!(EndpointId::from_public_key(&a), EndpointId::from_public_key(&a));
        assert_ne!(EndpointId::from_public_key(&a), EndpointId::from_public_key(&b));
    }
}
