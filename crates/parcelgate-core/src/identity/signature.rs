//! Nonce signatures and their verification
//!
//! A collecting endpoint answers the server's challenge with one signature
//! per identity it wants parcels for. The verifier accepts the set only if
//! every member checks out.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::HandshakeError;
use crate::identity::{EndpointCertificate, EndpointId};

/// An endpoint's signature over a handshake nonce
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceSignature {
    /// Certificate of the signing endpoint
    pub certificate: EndpointCertificate,
    /// Ed25519 signature over the nonce (64 bytes)
    pub signature: Vec<u8>,
}

/// Verifies nonce signatures against a set of trusted issuer keys
#[derive(Clone, Debug)]
pub struct NonceVerifier {
    trusted: Vec<VerifyingKey>,
}

impl NonceVerifier {
    pub fn new(trusted: impl IntoIterator<Item = VerifyingKey>) -> Self {
        Self {
            trusted: trusted.into_iter().collect(),
        }
    }

    /// Verify one signature and recover the endpoint it belongs to.
    pub fn verify(
        &self,
        nonce: &[u8],
        signed: &NonceSignature,
        now: DateTime<Utc>,
    ) -> Result<EndpointId, HandshakeError> {
        let certificate = &signed.certificate;

        if !self
            .trusted
            .iter()
            .any(|key| key.as_bytes() == &certificate.issuer_key)
        {
            return Err(HandshakeError::UntrustedIssuer);
        }
        certificate.verify_issuer_signature()?;
        if !certificate.is_valid_at(now) {
            return Err(HandshakeError::CertificateExpired);
        }

        let subject = certificate.subject()?;
        let signature =
            Signature::from_slice(&signed.signature).map_err(|_| HandshakeError::InvalidSignature)?;
        subject
            .verify_strict(nonce, &signature)
            .map_err(|_| HandshakeError::InvalidSignature)?;

        Ok(EndpointId::from_public_key(&subject))
    }

    /// Verify a full handshake response.
    ///
    /// Fails on an empty set or if any single signature fails. Duplicate
    /// endpoints are reported once, in first-seen order.
    pub fn verify_all(
        &self,
        nonce: &[u8],
        signatures: &[NonceSignature],
    ) -> Result<Vec<EndpointId>, HandshakeError> {
        if signatures.is_empty() {
            return Err(HandshakeError::NoSignatures);
        }

        let now = Utc::now();
        let mut endpoints: Vec<EndpointId> = Vec::with_capacity(signatures.len());
        for signed in signatures {
            let id = self.verify(nonce, signed, now)?;
            if !endpoints.contains(&id) {
                endpoints.push(id);
            }
        }
        Ok(endpoints)
    }
}
