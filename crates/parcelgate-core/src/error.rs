//! Error types for Parcelgate
//!
//! Each component has its own closed error enum so callers can match
//! exhaustively; [`GatewayError`] aggregates them for the outer layers.

use thiserror::Error;

/// Errors raised by the object writer, the parcel store and the redb ledger.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The key resolves outside the storage root
    #[error("Key escapes the storage root: {0}")]
    KeyOutsideRoot(String),

    /// An identity component cannot be used as a path segment
    #[error("Invalid key component: {0}")]
    InvalidKeyComponent(String),

    /// General I/O error (permissions, disk failures)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures of a worker subprocess and its message channel.
#[derive(Error, Debug)]
pub enum SubprocessError {
    /// The process could not be started
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// The worker exited because the gateway is not registered with a peer
    #[error("Worker reports the gateway is not registered")]
    Unregistered,

    /// The worker exited with a non-zero code
    #[error("Worker exited with code {code}")]
    Failed {
        /// Process exit code
        code: i32,
    },

    /// The worker was terminated by a signal
    #[error("Worker crashed (signal {signal:?})")]
    Crashed {
        /// Terminating signal, when the platform reports one
        signal: Option<i32>,
    },

    /// The channel to the worker is already closed
    #[error("Worker channel is closed")]
    ChannelClosed,

    /// Error during serialization of an outbound message
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// How a supervised worker stopped, as reported to orchestrator callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    /// The worker exited with code 0; workers are expected to run forever
    #[error("Worker exited unexpectedly")]
    UnexpectedExit,

    /// The worker stopped because the gateway is not registered
    #[error("Worker stopped: gateway is not registered")]
    Unregistered,

    /// The worker exited with a non-zero code
    #[error("Worker failed with exit code {code}")]
    Failed {
        /// Process exit code
        code: i32,
    },

    /// The worker was killed by a signal
    #[error("Worker crashed (signal {signal:?})")]
    Crashed {
        /// Terminating signal, when the platform reports one
        signal: Option<i32>,
    },
}

impl From<SubprocessError> for WorkerFailure {
    fn from(err: SubprocessError) -> Self {
        match err {
            SubprocessError::Unregistered => WorkerFailure::Unregistered,
            SubprocessError::Failed { code } => WorkerFailure::Failed { code },
            SubprocessError::Crashed { signal } => WorkerFailure::Crashed { signal },
            SubprocessError::SpawnFailed(_)
            | SubprocessError::ChannelClosed
            | SubprocessError::Serialization(_) => WorkerFailure::UnexpectedExit,
        }
    }
}

/// Reasons a collection handshake is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The response could not be decoded
    #[error("Malformed handshake response: {0}")]
    Malformed(String),

    /// The response carried no signatures at all
    #[error("Handshake response contains no signatures")]
    NoSignatures,

    /// The certificate was not issued by a trusted gateway key
    #[error("Certificate issuer is not trusted")]
    UntrustedIssuer,

    /// The certificate is malformed or its issuer signature is wrong
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The certificate is outside its validity window
    #[error("Certificate is not valid at this time")]
    CertificateExpired,

    /// The signature over the nonce does not verify
    #[error("Nonce signature is invalid")]
    InvalidSignature,
}

/// Framing and decoding failures on a collection connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A frame could not be decoded
    #[error("Failed to decode frame: {0}")]
    Decode(String),

    /// A frame could not be encoded
    #[error("Failed to encode frame: {0}")]
    Encode(String),

    /// A well-formed frame arrived at the wrong point of the exchange
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// The peer closed the connection with a close frame
    #[error("Connection closed ({code}): {reason}")]
    Closed {
        /// Close code
        code: u16,
        /// Human-readable reason
        reason: String,
    },

    /// The connection ended without a close frame
    #[error("Connection ended unexpectedly")]
    Disconnected,

    /// Transport failure
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for Parcelgate operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Parcel or ledger storage failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Worker subprocess failure
    #[error("Worker error: {0}")]
    Subprocess(#[from] SubprocessError),

    /// Handshake refused
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Malformed or unexpected protocol frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity-related error (keys, certificates)
    #[error("Identity error: {0}")]
    Identity(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using GatewayError
pub type GatewayResult<T> = Result<T, GatewayError>;
