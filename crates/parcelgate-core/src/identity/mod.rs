//! Identity module for Parcelgate
//!
//! The gateway holds one long-lived ed25519 key and uses it to certify the
//! keys of local endpoints. During a collection handshake an endpoint
//! proves possession of its key by signing the server's nonce; the
//! certificate ties that key back to the gateway.
//!
//! ## Overview
//!
//! - **GatewayIdentity**: the gateway's signing key; issues certificates
//! - **EndpointCertificate**: endpoint key + issuer key + validity window
//! - **EndpointCredentials**: an endpoint keypair with its certificate
//! - **NonceVerifier**: checks handshake signatures and recovers the
//!   [`EndpointId`] (private address) each one authorizes
//!
//! ## Example
//!
//! ```rust
//! use chrono::Duration;
//! use parcelgate_core::identity::{EndpointCredentials, GatewayIdentity, NonceVerifier};
//!
//! let gateway = GatewayIdentity::generate();
//! let endpoint = EndpointCredentials::issue(&gateway, Duration::days(30));
//!
//! let verifier = NonceVerifier::new([gateway.verifying_key()]);
//! let nonce = b"challenge";
//! let ids = verifier.verify_all(nonce, &[endpoint.sign_nonce(nonce)]).unwrap();
//! assert_eq!(ids, vec![endpoint.endpoint_id()]);
//! ```

mod certificate;
mod endpoint_id;
mod keypair;
mod signature;

// Re-export public types
pub use certificate::{EndpointCertificate, GatewayIdentity};
pub use endpoint_id::EndpointId;
pub use keypair::{EndpointCredentials, EndpointKeypair};
pub use signature::{NonceSignature, NonceVerifier};
