//! Parcelgate Core Library
//!
//! Store-and-forward gateway between a remote relay peer and the endpoints
//! on a private network.
//!
//! ## Overview
//!
//! Parcels travel in two directions. Parcels *to the peer* are queued until
//! the delivery worker forwards them; parcels *to endpoints* are queued until
//! a local endpoint collects and acknowledges them. Every parcel lives as a
//! file plus a metadata side-car under the data directory, so the queue
//! survives restarts.
//!
//! ## Components
//!
//! - **Parcel store** ([`storage::ParcelStore`]): durable queue keyed by
//!   recipient and hashed parcel identity, with expiry and a collection
//!   ledger that makes redelivery from the peer idempotent
//! - **Worker orchestrator** ([`worker::WorkerOrchestrator`]): supervises the
//!   delivery worker process and fans its JSON-line messages out to
//!   subscribers
//! - **Status bus** ([`status::StatusBus`]): last-value connectivity status
//! - **Collection** ([`collection`]): challenge/response handshake and
//!   acknowledged delivery to endpoints
//! - **Identity** ([`identity`]): gateway key, endpoint certificates and
//!   nonce signatures
//!
//! ## Quick Start
//!
//! ```ignore
//! use parcelgate_core::{Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::open("/var/lib/parcelgate", GatewayConfig::default())?;
//!     gateway.storage().set_registration("relay.example.com")?;
//!
//!     let listener = tokio::net::TcpListener::bind(gateway.config().listen_addr).await?;
//!     gateway.serve(listener, std::future::pending()).await?;
//!     Ok(())
//! }
//! ```

pub mod collection;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod logging;
pub mod status;
pub mod storage;
pub mod types;
pub mod worker;

// Re-exports
pub use collection::{
    ClientFrame, CloseCode, CollectionClient, CollectionServer, NoArrivals, ParcelArrivalSource,
    ServerEvent, ServerFrame, StreamingMode,
};
pub use config::{resolve_data_dir, GatewayConfig, WorkerSpec};
pub use error::{
    GatewayError, GatewayResult, HandshakeError, ProtocolError, StoreError, SubprocessError,
    WorkerFailure,
};
pub use gateway::Gateway;
pub use identity::{
    EndpointCertificate, EndpointCredentials, EndpointId, EndpointKeypair, GatewayIdentity,
    NonceSignature, NonceVerifier,
};
pub use logging::{JsonLogEntry, JsonlLayer, LogContext};
pub use status::{ConnectivityStatus, StatusBus, StatusSubscription};
pub use storage::{ObjectWriter, ParcelStore, RegistrationStatus, Storage};
pub use types::*;
pub use worker::{SubprocessChannel, SubprocessMessage, WorkerOrchestrator, WorkerSubscription};
