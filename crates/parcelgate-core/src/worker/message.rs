//! Messages exchanged with worker processes
//!
//! One JSON object per line on the worker's stdout (and stdin for messages
//! the gateway sends). Lines that are not a known, well-formed message are
//! dropped.

use serde::{Deserialize, Serialize};

use crate::status::ConnectivityStatus;
use crate::types::StoredParcelKey;

/// Envelope tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SubprocessMessage {
    /// Link to the relay peer changed
    Status { status: ConnectivityStatus },

    /// A parcel for a local endpoint was stored
    #[serde(rename_all = "camelCase")]
    ParcelArrival {
        key: StoredParcelKey,
        recipient_id: String,
    },

    /// Protocol progress notification
    Stage { stage: String },
}

impl SubprocessMessage {
    /// Parse one line; `None` for anything unrecognised.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
