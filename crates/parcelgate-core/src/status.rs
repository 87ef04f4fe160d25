//! Connectivity status broadcasting
//!
//! [`StatusBus`] keeps the last published value and pushes every change to
//! its subscribers. A new subscriber immediately receives the current value,
//! and publishing the value already held is a no-op, so subscribers never
//! see the same status twice in a row.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Whether the gateway currently has a link to its relay peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Connected,
    #[default]
    Disconnected,
}

impl std::fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityStatus::Connected => write!(f, "connected"),
            ConnectivityStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

struct BusState<T> {
    current: T,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

/// Last-value broadcaster with change coalescing
#[derive(Clone)]
pub struct StatusBus<T> {
    state: Arc<Mutex<BusState<T>>>,
}

impl<T: Clone + PartialEq + Send + 'static> StatusBus<T> {
    pub fn new(initial: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                current: initial,
                subscribers: Vec::new(),
            })),
        }
    }

    /// The value most recently published
    pub fn current(&self) -> T {
        self.state.lock().current.clone()
    }

    /// Publish a value. Returns `false` if it equals the current one.
    pub fn set_status(&self, value: T) -> bool {
        let mut state = self.state.lock();
        if state.current == value {
            return false;
        }
        state.current = value.clone();
        state
            .subscribers
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
        true
    }

    /// Subscribe to the current value and every later change
    pub fn subscribe(&self) -> StatusSubscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        // Sent under the lock so no publish can slip in ahead of it
        let _ = tx.send(state.current.clone());
        state.subscribers.push(tx);
        StatusSubscription { rx }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|subscriber| !subscriber.is_closed());
        state.subscribers.len()
    }
}

impl<T: Clone + PartialEq + Send + Default + 'static> Default for StatusBus<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Stream of values from a [`StatusBus`]. Dropping it unsubscribes.
pub struct StatusSubscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> StatusSubscription<T> {
    /// Wait for the next value
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for StatusSubscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
