//! Parcel collection wire protocol
//!
//! Frames are postcard-encoded and carried in length-delimited frames.
//!
//! ## Message Flow
//!
//! ```text
//! Endpoint                              Gateway
//!   |                                     |
//!   |--- Connect {streaming_mode} ------->|
//!   |<-- Challenge {nonce} ---------------|
//!   |--- HandshakeResponse {sigs} ------->|
//!   |                                     |
//!   |    (recipients = signing endpoints) |
//!   |                                     |
//!   |<-- Delivery {id, parcel} -----------|
//!   |<-- Delivery {id, parcel} -----------|
//!   |--- Ack {id} ----------------------->|
//!   |<-- Heartbeat -----------------------|
//!   |--- Ack {id} ----------------------->|
//!   |                                     |
//!   |<-- Close {1000, reason} ------------|
//!   |    (close-upon-completion only)     |
//! ```
//!
//! The gateway may close at any point with a [`CloseCode`] other than
//! `Normal` when the handshake or an acknowledgement is invalid.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::ProtocolError;
use crate::identity::NonceSignature;

/// Largest frame either side accepts
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Size of the handshake challenge
pub const NONCE_LENGTH: usize = 32;

/// Codec shared by both ends of the connection
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Frames sent by the endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Connection parameters, always the first frame
    Connect {
        /// `"close-upon-completion"` or `"keep-alive"`
        streaming_mode: String,
    },

    /// Signatures over the challenge nonce, one per endpoint
    HandshakeResponse { signatures: Vec<NonceSignature> },

    /// Acknowledge receipt of a delivery
    Ack {
        /// Raw bytes of the delivery id
        delivery_id: Vec<u8>,
    },
}

/// Frames sent by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Nonce the endpoints must sign
    Challenge { nonce: Vec<u8> },

    /// A parcel for one of the authenticated endpoints
    Delivery {
        /// Unique within the connection
        delivery_id: String,
        /// Serialized parcel
        parcel: Vec<u8>,
    },

    /// Keeps idle connections alive
    Heartbeat,

    /// Last frame of the connection
    Close { code: u16, reason: String },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        postcard::from_bytes(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        postcard::from_bytes(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        ServerFrame::Close {
            code: code.as_u16(),
            reason: reason.into(),
        }
    }
}

/// Reason the gateway ended a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Session finished, or the client went away
    Normal,
    /// Malformed or invalid handshake, or unknown acknowledgement
    CannotAccept,
    /// Unexpected failure inside the gateway
    ServerError,
    /// Gateway is not registered yet
    TryAgainLater,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::CannotAccept => 1003,
            CloseCode::ServerError => 1011,
            CloseCode::TryAgainLater => 1013,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(CloseCode::Normal),
            1003 => Some(CloseCode::CannotAccept),
            1011 => Some(CloseCode::ServerError),
            1013 => Some(CloseCode::TryAgainLater),
            _ => None,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Whether the session ends once the backlog is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingMode {
    CloseUponCompletion,
    #[default]
    KeepAlive,
}

impl StreamingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamingMode::CloseUponCompletion => "close-upon-completion",
            StreamingMode::KeepAlive => "keep-alive",
        }
    }

    /// Anything unrecognised means keep-alive
    pub fn parse(s: &str) -> Self {
        match s {
            "close-upon-completion" => StreamingMode::CloseUponCompletion,
            _ => StreamingMode::KeepAlive,
        }
    }
}

impl std::fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        for code in [
            CloseCode::Normal,
            CloseCode::CannotAccept,
            CloseCode::ServerError,
            CloseCode::TryAgainLater,
        ] {
            assert_eq!(CloseCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(CloseCode::TryAgainLater.as_u16(), 1013);
        assert_eq!(CloseCode::from_u16(4000), None);
    }

    #[test]
    fn test_streaming_mode_parse() {
        assert_eq!(
            StreamingMode::parse("close-upon-completion"),
            StreamingMode::CloseUponCompletion
        );
        assert_eq!(StreamingMode::parse("keep-alive"), StreamingMode::KeepAlive);
        assert_eq!(StreamingMode::parse("whatever"), StreamingMode::KeepAlive);
        assert_eq!(StreamingMode::parse(""), StreamingMode::KeepAlive);
    }

    #[test]
    fn test_server_frame_encoding() {
        let frame = ServerFrame::Delivery {
            delivery_id: "01J".to_string(),
            parcel: vec![1, 2, 3],
        };
        let decoded = ServerFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(matches!(
            ClientFrame::decode(&[0xff, 0xff, 0xff]),
            Err(ProtocolError::Decode(_))
        ));
    }
}
