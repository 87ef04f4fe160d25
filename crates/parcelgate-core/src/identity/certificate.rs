//! Endpoint certificates and the gateway identity that issues them

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, HandshakeError};
use crate::identity::EndpointId;

/// Binds an endpoint public key to the gateway that vouches for it.
///
/// The issuer signs the postcard encoding of every field except the
/// signature itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCertificate {
    /// Endpoint ed25519 public key
    pub subject_key: [u8; 32],
    /// Issuing gateway ed25519 public key
    pub issuer_key: [u8; 32],
    /// Start of validity, unix seconds
    pub not_before: i64,
    /// End of validity, unix seconds
    pub not_after: i64,
    /// Issuer signature (64 bytes)
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct CertificateBody<'a> {
    subject_key: &'a [u8; 32],
    issuer_key: &'a [u8; 32],
    not_before: i64,
    not_after: i64,
}

impl EndpointCertificate {
    /// Bytes covered by the issuer signature
    pub fn body_bytes(&self) -> Vec<u8> {
        let body = CertificateBody {
            subject_key: &self.subject_key,
            issuer_key: &self.issuer_key,
            not_before: self.not_before,
            not_after: self.not_after,
        };
        // Fixed-size fields only; encoding into a Vec cannot fail
        postcard::to_allocvec(&body).unwrap_or_default()
    }

    /// The endpoint's public key
    pub fn subject(&self) -> Result<VerifyingKey, HandshakeError> {
        VerifyingKey::from_bytes(&self.subject_key)
            .map_err(|e| HandshakeError::InvalidCertificate(format!("subject key: {}", e)))
    }

    /// The issuer's public key
    pub fn issuer(&self) -> Result<VerifyingKey, HandshakeError> {
        VerifyingKey::from_bytes(&self.issuer_key)
            .map_err(|e| HandshakeError::InvalidCertificate(format!("issuer key: {}", e)))
    }

    /// Private address of the certified endpoint
    pub fn subject_id(&self) -> Result<EndpointId, HandshakeError> {
        Ok(EndpointId::from_public_key(&self.subject()?))
    }

    /// Check the issuer signature over the certificate body
    pub fn verify_issuer_signature(&self) -> Result<(), HandshakeError> {
        let issuer = self.issuer()?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| HandshakeError::InvalidCertificate(format!("signature: {}", e)))?;
        issuer
            .verify_strict(&self.body_bytes(), &signature)
            .map_err(|_| HandshakeError::InvalidCertificate("issuer signature mismatch".into()))
    }

    /// Whether `now` falls inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let now = now.timestamp();
        self.not_before <= now && now <= self.not_after
    }

    /// Serialize the certificate to bytes using postcard
    pub fn to_bytes(&self) -> Result<Vec<u8>, GatewayError> {
        postcard::to_allocvec(self).map_err(|e| GatewayError::Identity(e.to_string()))
    }

    /// Deserialize a certificate from bytes using postcard
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GatewayError> {
        postcard::from_bytes(bytes).map_err(|e| GatewayError::Identity(e.to_string()))
    }
}

/// The gateway's long-lived signing identity
pub struct GatewayIdentity {
    signing_key: SigningKey,
}

impl GatewayIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Restore an identity from its 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Seed to persist this identity
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Issue a certificate for an endpoint key, valid from now for `validity`.
    pub fn issue_certificate(
        &self,
        subject: &VerifyingKey,
        validity: Duration,
    ) -> EndpointCertificate {
        let now = Utc::now();
        self.issue_certificate_between(subject, now, now + validity)
    }

    /// Issue a certificate with an explicit validity window
    pub fn issue_certificate_between(
        &self,
        subject: &VerifyingKey,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> EndpointCertificate {
        let mut certificate = EndpointCertificate {
            subject_key: subject.to_bytes(),
            issuer_key: self.verifying_key().to_bytes(),
            not_before: not_before.timestamp(),
            not_after: not_after.timestamp(),
            signature: Vec::new(),
        };
        certificate.signature = self
            .signing_key
            .sign(&certificate.body_bytes())
            .to_bytes()
            .to_vec();
        certificate
    }
}

impl std::fmt::Debug for GatewayIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayIdentity")
            .field("public_key", &hex::encode(self.verifying_key().as_bytes()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_key(byte: u8) -> VerifyingKey {
        SigningKey::from_bytes(&[byte; 32]).verifying_key()
    }

    #[test]
    fn test_issued_certificate_verifies() {
        let gateway = GatewayIdentity::generate();
        let cert = gateway.issue_certificate(&endpoint_key(3), Duration::days(1));

        assert!(cert.verify_issuer_signature().is_ok());
        assert!(cert.is_valid_at(Utc::now()));
        assert_eq!(cert.issuer_key, gateway.verifying_key().to_bytes());
        assert_eq!(
            cert.subject_id().unwrap(),
            EndpointId::from_public_key(&endpoint_key(3))
        );
    }

    #[test]
    fn test_tampered_certificate_fails() {
        let gateway = GatewayIdentity::generate();
        let mut cert = gateway.issue_certificate(&endpoint_key(3), Duration::days(1));
        cert.not_after += 3600;

        assert!(matches!(
            cert.verify_issuer_signature(),
            Err(HandshakeError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_validity_window() {
        let gateway = GatewayIdentity::generate();
        let now = Utc::now();
        let cert = gateway.issue_certificate_between(
            &endpoint_key(3),
            now - Duration::days(2),
            now - Duration::days(1),
        );

        assert!(!cert.is_valid_at(now));
        assert!(cert.is_valid_at(now - Duration::hours(36)));
    }

    #[test]
    fn test_identity_seed_roundtrip() {
        let gateway = GatewayIdentity::generate();
        let restored = GatewayIdentity::from_seed(&gateway.seed());
        assert_eq!(gateway.verifying_key(), restored.verifying_key());
    }

    #[test]
    fn test_certificate_serialization() {
        let gateway = GatewayIdentity::generate();
        let cert = gateway.issue_certificate(&endpoint_key(9), Duration::days(30));

        let bytes = cert.to_bytes().unwrap();
        assert_eq!(EndpointCertificate::from_bytes(&bytes).unwrap(), cert);
    }
}
