//! Parcel collection by local endpoints
//!
//! An endpoint connects, proves possession of one or more endpoint keys by
//! signing a challenge, and receives the parcels queued for those endpoints.
//! Live sessions keep receiving parcels as the delivery worker stores them.
//!
//! - [`protocol`]: frames and close codes
//! - [`server`]: gateway side of a connection
//! - [`client`]: endpoint side of a connection

pub mod client;
pub mod protocol;
pub mod server;
mod session;

pub use client::{CollectionClient, ServerEvent};
pub use protocol::{ClientFrame, CloseCode, ServerFrame, StreamingMode};
pub use server::CollectionServer;
pub use session::DeliverySession;

use futures::stream::{self, BoxStream, StreamExt};

use crate::types::StoredParcelKey;
use crate::worker::WorkerOrchestrator;

/// Source of keys for parcels that arrive while a session is open
pub trait ParcelArrivalSource: Send + Sync {
    /// Keys of parcels arriving for any of `recipient_ids` from now on
    fn watch_arrivals(&self, recipient_ids: Vec<String>) -> BoxStream<'static, StoredParcelKey>;
}

impl ParcelArrivalSource for WorkerOrchestrator {
    fn watch_arrivals(&self, recipient_ids: Vec<String>) -> BoxStream<'static, StoredParcelKey> {
        self.watch_parcel_arrivals(recipient_ids)
    }
}

/// Arrival source for gateways without a delivery worker
#[derive(Debug, Clone, Copy, Default)]
pub struct NoArrivals;

impl ParcelArrivalSource for NoArrivals {
    fn watch_arrivals(&self, _recipient_ids: Vec<String>) -> BoxStream<'static, StoredParcelKey> {
        stream::pending().boxed()
    }
}
