//! Endpoint keypairs and the credentials an endpoint presents when
//! collecting parcels.

use std::path::Path;

use chrono::Duration;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::identity::{EndpointCertificate, EndpointId, GatewayIdentity, NonceSignature};

/// Ed25519 keypair owned by a local endpoint
pub struct EndpointKeypair {
    signing_key: SigningKey,
}

impl EndpointKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Create a keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Private address derived from the public key
    pub fn endpoint_id(&self) -> EndpointId {
        EndpointId::from_public_key(&self.public_key())
    }

    /// Sign raw bytes
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl Clone for EndpointKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.seed())
    }
}

impl std::fmt::Debug for EndpointKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointKeypair")
            .field("endpoint_id", &self.endpoint_id())
            .finish()
    }
}

/// A keypair together with the certificate vouching for it
#[derive(Clone, Debug)]
pub struct EndpointCredentials {
    keypair: EndpointKeypair,
    certificate: EndpointCertificate,
}

/// On-disk form of [`EndpointCredentials`]
#[derive(Serialize, Deserialize)]
struct CredentialsFile {
    endpoint_id: String,
    signing_key: String,
    certificate: String,
}

impl EndpointCredentials {
    pub fn new(keypair: EndpointKeypair, certificate: EndpointCertificate) -> Self {
        Self {
            keypair,
            certificate,
        }
    }

    /// Generate a fresh endpoint keypair certified by `gateway`
    pub fn issue(gateway: &GatewayIdentity, validity: Duration) -> Self {
        let keypair = EndpointKeypair::generate();
        let certificate = gateway.issue_certificate(&keypair.public_key(), validity);
        Self::new(keypair, certificate)
    }

    pub fn keypair(&self) -> &EndpointKeypair {
        &self.keypair
    }

    pub fn certificate(&self) -> &EndpointCertificate {
        &self.certificate
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.keypair.endpoint_id()
    }

    /// Answer a collection challenge
    pub fn sign_nonce(&self, nonce: &[u8]) -> NonceSignature {
        NonceSignature {
            certificate: self.certificate.clone(),
            signature: self.keypair.sign(nonce),
        }
    }

    /// Write the credentials as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> GatewayResult<()> {
        let path = path.as_ref();
        let file = CredentialsFile {
            endpoint_id: self.endpoint_id().into_string(),
            signing_key: hex::encode(self.keypair.seed()),
            certificate: hex::encode(self.certificate.to_bytes()?),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| GatewayError::Identity(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read credentials written by [`EndpointCredentials::save`]
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let json = std::fs::read(path.as_ref())?;
        let file: CredentialsFile =
            serde_json::from_slice(&json).map_err(|e| GatewayError::Identity(e.to_string()))?;

        let seed: [u8; 32] = hex::decode(&file.signing_key)
            .map_err(|e| GatewayError::Identity(format!("signing key: {}", e)))?
            .try_into()
            .map_err(|_| GatewayError::Identity("signing key must be 32 bytes".to_string()))?;
        let certificate_bytes = hex::decode(&file.certificate)
            .map_err(|e| GatewayError::Identity(format!("certificate: {}", e)))?;
        let certificate = EndpointCertificate::from_bytes(&certificate_bytes)?;

        let keypair = EndpointKeypair::from_seed(&seed);
        if certificate.subject_key != keypair.public_key().to_bytes() {
            return Err(GatewayError::Identity(
                "certificate does not match signing key".to_string(),
            ));
        }

        Ok(Self::new(keypair, certificate))
    }
}
