//! Core types for Parcelgate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which way a parcel flows through the gateway.
///
/// The direction selects the storage namespace and which identity stays
/// readable in the derived key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Device → remote relay peer
    ToPeer,
    /// Remote relay peer → local endpoint
    ToEndpoint,
}

impl Direction {
    /// Namespace directory name for this direction
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToPeer => "to-peer",
            Direction::ToEndpoint => "to-endpoint",
        }
    }

    /// Parse a namespace name (`to-peer` / `to-endpoint`)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "to-peer" => Some(Direction::ToPeer),
            "to-endpoint" => Some(Direction::ToEndpoint),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relative path of a stored parcel within its direction's namespace.
///
/// Shaped as `plainComponent/hashedComponent`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredParcelKey(String);

impl StoredParcelKey {
    /// Wrap an existing key string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The readable identity component (sender or recipient id)
    pub fn plain_component(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }
}

impl std::fmt::Display for StoredParcelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StoredParcelKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// A store-and-forward message as produced by the relay protocol.
///
/// The gateway only looks at the addressing triple and the expiry date;
/// the payload is carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parcel {
    /// Private address of the sending endpoint
    pub sender_id: String,
    /// Private address of the recipient endpoint
    pub recipient_id: String,
    /// Sender-assigned identifier, unique per sender/recipient pair
    pub parcel_id: String,
    /// After this instant the parcel must not be delivered
    pub expiry_date: DateTime<Utc>,
    /// Encrypted payload
    pub payload: Vec<u8>,
}

impl Parcel {
    /// Create a new parcel
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        parcel_id: impl Into<String>,
        expiry_date: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            parcel_id: parcel_id.into(),
            expiry_date,
            payload,
        }
    }

    /// Serialize the parcel to bytes using postcard
    pub fn serialize(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserialize a parcel from bytes using postcard
    pub fn deserialize(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// A stored parcel that passed the metadata check during a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedParcel {
    /// Key within the listed direction
    pub key: StoredParcelKey,
    /// Expiry read from the metadata side-car
    pub expiry_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_direction_roundtrip() {
        for direction in [Direction::ToPeer, Direction::ToEndpoint] {
            assert_eq!(Direction::parse(direction.as_str()), Some(direction));
        }
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn test_plain_component() {
        let key = StoredParcelKey::new("0abc/deadbeef");
        assert_eq!(key.plain_component(), "0abc");
        assert_eq!(key.to_string(), "0abc/deadbeef");
    }

    #[test]
    fn test_parcel_serialization() {
        let parcel = Parcel::new(
            "S",
            "R",
            "1",
            Utc::now() + Duration::days(1),
            b"abc".to_vec(),
        );
        let bytes = parcel.serialize().unwrap();
        let decoded = Parcel::deserialize(&bytes).unwrap();
        assert_eq!(decoded, parcel);
    }
}
