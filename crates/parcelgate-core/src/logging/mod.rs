//! JSONL logging for gateway components.
//!
//! Each component (the gateway server, a collecting client) appends to its
//! own file, one JSON object per line:
//!
//! ```text
//! logs/
//! ├── 2026-10-16_gateway.jsonl
//! └── 2026-10-16_collect.jsonl
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use parcelgate_core::logging::JsonlLayer;
//! use tracing_subscriber::prelude::*;
//!
//! let jsonl_layer = JsonlLayer::new("./logs", "gateway")?;
//!
//! let subscriber = tracing_subscriber::registry()
//!     .with(jsonl_layer)
//!     .with(tracing_subscriber::fmt::layer());
//!
//! tracing::subscriber::set_global_default(subscriber)?;
//! ```
//!
//! ### Querying logs with jq
//!
//! ```bash
//! # Everything one collection session logged
//! jq 'select(.ctx.session == "01J9...")' logs/*_gateway.jsonl
//!
//! # Lifecycle of one parcel
//! jq 'select(.ctx.parcel == "R/4f1c...")' logs/*_gateway.jsonl
//!
//! # Output of the second worker process
//! jq 'select(.ctx.generation == 2)' logs/*_gateway.jsonl
//!
//! # Refused handshakes
//! jq 'select(.msg | startswith("Rejected handshake"))' logs/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

// Re-exports for convenience
pub use entry::{JsonLogEntry, LogContext};
pub use layer::JsonlLayer;
pub use writer::{read_all_entries, ComponentLogWriter};
