//! Worker supervision and restart-transparent fan-out
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  WorkerOrchestrator                                              │
//! │  ├── slot: at most one live WorkerHandle                         │
//! │  │     └── pump task: SubprocessEvents ──► fan_out()             │
//! │  ├── listeners: id ──► bounded mpsc::Sender<SubprocessMessage>   │
//! │  └── failures: broadcast::Sender<WorkerFailure>                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Subscriptions register with the orchestrator rather than with a worker,
//! so a restarted worker's pump feeds the same listeners. Each listener
//! sees messages in the order the worker emitted them.
//!
//! Listeners are served concurrently. A full listener gets
//! [`STALLED_LISTENER_TIMEOUT`] to make room; one that does not is
//! unregistered, and its stream ends after the messages it already holds.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{join_all, ready};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::channel::{SubprocessChannel, SubprocessEvents};
use super::message::SubprocessMessage;
use crate::config::WorkerSpec;
use crate::error::{SubprocessError, WorkerFailure};
use crate::status::ConnectivityStatus;
use crate::types::StoredParcelKey;

/// Capacity of the failure broadcast channel
const FAILURE_CHANNEL_CAPACITY: usize = 16;

/// Default buffer of each subscription
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// How long a full subscription may hold up the pump before it is dropped
pub const STALLED_LISTENER_TIMEOUT: Duration = Duration::from_secs(1);

/// One live worker process and the task pumping its output
struct WorkerHandle {
    generation: u64,
    channel: Arc<SubprocessChannel>,
    pump: JoinHandle<()>,
}

impl WorkerHandle {
    /// Kill the process and wait for its pump to finish
    async fn terminate(self) {
        debug!(generation = self.generation, pid = self.channel.pid(), "Terminating worker");
        self.channel.destroy();
        if let Err(e) = self.pump.await {
            warn!(error = %e, "Worker pump task failed");
        }
    }
}

#[derive(Default)]
struct WorkerSlot {
    handle: Option<WorkerHandle>,
    restarting: bool,
    /// Bumped by every `shutdown()`
    shutdowns: u64,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<SubprocessMessage>>,
}

struct Inner {
    spec: WorkerSpec,
    slot: tokio::sync::Mutex<WorkerSlot>,
    listeners: parking_lot::Mutex<Listeners>,
    failures: broadcast::Sender<WorkerFailure>,
    capacity: usize,
    /// Generation of the live worker; 0 when none is running
    current: AtomicU64,
    next_generation: AtomicU64,
    spawn_count: AtomicU64,
}

impl Inner {
    /// Deliver a message to every listener registered now.
    ///
    /// Returns once each listener either accepted the message or was
    /// dropped.
    async fn fan_out(&self, message: SubprocessMessage) {
        let senders: Vec<(u64, mpsc::Sender<SubprocessMessage>)> = {
            let listeners = self.listeners.lock();
            let mut senders: Vec<_> = listeners
                .senders
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect();
            senders.sort_by_key(|(id, _)| *id);
            senders
        };

        let deliveries = senders.into_iter().map(|(id, sender)| {
            let message = message.clone();
            async move { (id, deliver(&sender, message).await) }
        });

        let mut dropped = Vec::new();
        for (id, outcome) in join_all(deliveries).await {
            match outcome {
                Delivery::Sent => {}
                Delivery::Closed => dropped.push(id),
                Delivery::Stalled => {
                    warn!(
                        worker = %self.spec.name,
                        listener = id,
                        "Dropping subscription that stopped reading"
                    );
                    dropped.push(id);
                }
            }
        }

        if !dropped.is_empty() {
            let mut listeners = self.listeners.lock();
            for id in dropped {
                listeners.senders.remove(&id);
            }
        }
    }
}

enum Delivery {
    Sent,
    Closed,
    Stalled,
}

async fn deliver(sender: &mpsc::Sender<SubprocessMessage>, message: SubprocessMessage) -> Delivery {
    match sender.try_send(message) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
        Err(TrySendError::Full(message)) => {
            match tokio::time::timeout(STALLED_LISTENER_TIMEOUT, sender.send(message)).await {
                Ok(Ok(())) => Delivery::Sent,
                Ok(Err(_)) => Delivery::Closed,
                Err(_) => Delivery::Stalled,
            }
        }
    }
}

/// Supervises one logical worker and multiplexes its output
#[derive(Clone)]
pub struct WorkerOrchestrator {
    inner: Arc<Inner>,
}

impl WorkerOrchestrator {
    pub fn new(spec: WorkerSpec) -> Self {
        Self::with_capacity(spec, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create an orchestrator whose subscriptions buffer `capacity` messages
    pub fn with_capacity(spec: WorkerSpec, capacity: usize) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                spec,
                slot: tokio::sync::Mutex::new(WorkerSlot::default()),
                listeners: parking_lot::Mutex::new(Listeners::default()),
                failures,
                capacity: capacity.max(1),
                current: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                spawn_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.inner.spec
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Spawn the worker unless one is already live.
    pub async fn start(&self) -> Result<(), SubprocessError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.restarting || self.is_running() {
            debug!(worker = %self.inner.spec.name, "Worker already running; start ignored");
            return Ok(());
        }
        slot.handle = Some(self.spawn_handle()?);
        Ok(())
    }

    /// Replace the live worker with a fresh process.
    ///
    /// A no-op when no worker is live. Calls made while a restart is in
    /// flight return immediately instead of restarting again.
    pub async fn restart(&self) -> Result<(), SubprocessError> {
        let (old, shutdowns) = {
            let mut slot = self.inner.slot.lock().await;
            if slot.restarting {
                debug!(worker = %self.inner.spec.name, "Restart already in progress");
                return Ok(());
            }
            if !self.is_running() {
                debug!(worker = %self.inner.spec.name, "Worker not running; restart ignored");
                return Ok(());
            }
            slot.restarting = true;
            // The old pump must not report its exit as a failure
            self.inner.current.store(0, Ordering::SeqCst);
            (slot.handle.take(), slot.shutdowns)
        };

        info!(worker = %self.inner.spec.name, "Restarting worker");
        if let Some(old) = old {
            old.terminate().await;
        }

        let spawned = self.spawn_handle();
        let mut slot = self.inner.slot.lock().await;
        slot.restarting = false;
        let handle = spawned?;

        if slot.shutdowns != shutdowns {
            drop(slot);
            info!(worker = %self.inner.spec.name, "Stopped during restart; discarding new worker");
            let _ = self.inner.current.compare_exchange(
                handle.generation,
                0,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            handle.terminate().await;
            return Ok(());
        }

        slot.handle = Some(handle);
        Ok(())
    }

    /// Stop the worker, if any. Listeners stay registered.
    pub async fn shutdown(&self) {
        let old = {
            let mut slot = self.inner.slot.lock().await;
            slot.shutdowns += 1;
            self.inner.current.store(0, Ordering::SeqCst);
            slot.handle.take()
        };
        if let Some(old) = old {
            info!(worker = %self.inner.spec.name, "Stopping worker");
            old.terminate().await;
        }
    }

    /// Whether a worker process is currently live
    pub fn is_running(&self) -> bool {
        self.inner.current.load(Ordering::SeqCst) != 0
    }

    /// Number of processes spawned so far
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawn_count.load(Ordering::SeqCst)
    }

    /// Send a message to the live worker
    pub async fn send<M: Serialize>(&self, message: &M) -> Result<(), SubprocessError> {
        let channel = {
            let slot = self.inner.slot.lock().await;
            match &slot.handle {
                Some(handle) if self.is_running() => handle.channel.clone(),
                _ => return Err(SubprocessError::ChannelClosed),
            }
        };
        channel.write(message).await
    }

    fn spawn_handle(&self) -> Result<WorkerHandle, SubprocessError> {
        let (channel, events) = SubprocessChannel::spawn(&self.inner.spec)?;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.current.store(generation, Ordering::SeqCst);
        self.inner.spawn_count.fetch_add(1, Ordering::SeqCst);

        let pump = tokio::spawn(
            pump(Arc::downgrade(&self.inner), events, generation)
                .instrument(info_span!("worker", worker = %self.inner.spec.name, generation)),
        );
        Ok(WorkerHandle {
            generation,
            channel: Arc::new(channel),
            pump,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ═══════════════════════════════════════════════════════════════════════

    /// Every message from the current and all future workers
    pub fn subscribe(&self) -> WorkerSubscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = {
            let mut listeners = self.inner.listeners.lock();
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.senders.insert(id, tx);
            id
        };
        WorkerSubscription {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered subscriptions
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().senders.len()
    }

    /// Failures of workers that were not stopped by this orchestrator
    pub fn subscribe_failures(&self) -> broadcast::Receiver<WorkerFailure> {
        self.inner.failures.subscribe()
    }

    /// Connectivity status changes reported by the worker
    pub fn stream_status(&self) -> BoxStream<'static, ConnectivityStatus> {
        self.subscribe()
            .filter_map(|message| {
                ready(match message {
                    SubprocessMessage::Status { status } => Some(status),
                    _ => None,
                })
            })
            .boxed()
    }

    /// Keys of parcels arriving for any of `recipient_ids`
    pub fn watch_parcel_arrivals<I>(&self, recipient_ids: I) -> BoxStream<'static, StoredParcelKey>
    where
        I: IntoIterator<Item = String>,
    {
        let recipients: HashSet<String> = recipient_ids.into_iter().collect();
        self.subscribe()
            .filter_map(move |message| {
                ready(match message {
                    SubprocessMessage::ParcelArrival { key, recipient_id }
                        if recipients.contains(&recipient_id) =>
                    {
                        Some(key)
                    }
                    _ => None,
                })
            })
            .boxed()
    }

    /// Protocol stage notifications
    pub fn watch_stages(&self) -> BoxStream<'static, String> {
        self.subscribe()
            .filter_map(|message| {
                ready(match message {
                    SubprocessMessage::Stage { stage } => Some(stage),
                    _ => None,
                })
            })
            .boxed()
    }
}

async fn pump(inner: Weak<Inner>, mut events: SubprocessEvents, generation: u64) {
    let mut failure = WorkerFailure::UnexpectedExit;

    while let Some(event) = events.next().await {
        match event {
            Ok(message) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.fan_out(message).await;
            }
            Err(err) => failure = err.into(),
        }
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let was_current = inner
        .current
        .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok();
    if was_current {
        warn!(worker = %inner.spec.name, generation, %failure, "Worker stopped");
        let _ = inner.failures.send(failure);
    }
}

/// Registration with a [`WorkerOrchestrator`]; dropping it unregisters.
pub struct WorkerSubscription {
    id: u64,
    rx: mpsc::Receiver<SubprocessMessage>,
    inner: Weak<Inner>,
}

impl Stream for WorkerSubscription {
    type Item = SubprocessMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for WorkerSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().senders.remove(&self.id);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    const ARRIVAL_THEN_SLEEP: &str = r#"printf '{"type":"parcelArrival","key":"R/%s","recipientId":"R"}\n' $$; printf '{"type":"parcelArrival","key":"X/%s","recipientId":"X"}\n' $$; exec sleep 30"#;

    async fn next<S: Stream + Unpin>(stream: &mut S) -> S::Item {
        tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("timed out waiting for worker output")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell("test", "exec sleep 30"));

        orchestrator.start().await.unwrap();
        orchestrator.start().await.unwrap();
        assert!(orchestrator.is_running());
        assert_eq!(orchestrator.spawn_count(), 1);

        orchestrator.shutdown().await;
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_restart_without_worker_is_noop() {
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell("test", "exec sleep 30"));
        orchestrator.restart().await.unwrap();
        assert_eq!(orchestrator.spawn_count(), 0);
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_arrivals_survive_restart() {
        let orchestrator =
            WorkerOrchestrator::new(WorkerSpec::shell("test", ARRIVAL_THEN_SLEEP));
        let mut arrivals = orchestrator.watch_parcel_arrivals(["R".to_string()]);

        orchestrator.start().await.unwrap();
        let first = next(&mut arrivals).await;
        assert!(first.as_str().starts_with("R/"));

        orchestrator.restart().await.unwrap();
        let second = next(&mut arrivals).await;
        assert!(second.as_str().starts_with("R/"));
        assert_ne!(first, second, "second key must come from the new process");
        assert_eq!(orchestrator.spawn_count(), 2);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_restarts_are_not_duplicated() {
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell("test", "exec sleep 30"));
        orchestrator.start().await.unwrap();

        let (a, b) = tokio::join!(orchestrator.restart(), orchestrator.restart());
        a.unwrap();
        b.unwrap();

        assert_eq!(orchestrator.spawn_count(), 2);
        assert!(orchestrator.is_running());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_is_broadcast() {
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell("test", "exit 7"));
        let mut failures = orchestrator.subscribe_failures();

        orchestrator.start().await.unwrap();
        let failure = tokio::time::timeout(Duration::from_secs(10), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure, WorkerFailure::Failed { code: 7 });
        assert!(!orchestrator.is_running());

        // A stopped worker can be started again
        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_clean_exit_is_unexpected() {
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell("test", "exit 0"));
        let mut failures = orchestrator.subscribe_failures();

        orchestrator.start().await.unwrap();
        let failure = tokio::time::timeout(Duration::from_secs(10), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure, WorkerFailure::UnexpectedExit);
    }

    #[tokio::test]
    async fn test_requested_termination_is_not_a_failure() {
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell("test", "exec sleep 30"));
        let mut failures = orchestrator.subscribe_failures();

        orchestrator.start().await.unwrap();
        orchestrator.restart().await.unwrap();
        orchestrator.shutdown().await;

        assert!(matches!(failures.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_status_and_stage_streams() {
        let script = r#"echo '{"type":"stage","stage":"handshake"}'; echo '{"type":"status","status":"connected"}'; echo '{"type":"status","status":"disconnected"}'; exec sleep 30"#;
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell("test", script));
        let mut statuses = orchestrator.stream_status();
        let mut stages = orchestrator.watch_stages();

        orchestrator.start().await.unwrap();

        assert_eq!(next(&mut statuses).await, ConnectivityStatus::Connected);
        assert_eq!(next(&mut statuses).await, ConnectivityStatus::Disconnected);
        assert_eq!(next(&mut stages).await, "handshake");

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_listener_does_not_block_others() {
        let script = r#"i=0; while [ $i -lt 20 ]; do printf '{"type":"parcelArrival","key":"R/%s","recipientId":"R"}\n' $i; i=$((i+1)); done; exec sleep 30"#;
        let orchestrator = WorkerOrchestrator::with_capacity(WorkerSpec::shell("test", script), 2);
        let mut stalled = orchestrator.watch_parcel_arrivals(["R".to_string()]);
        let mut active = orchestrator.watch_parcel_arrivals(["R".to_string()]);

        orchestrator.start().await.unwrap();
        for i in 0..20 {
            assert_eq!(next(&mut active).await.as_str(), format!("R/{}", i));
        }
        assert_eq!(orchestrator.listener_count(), 1);

        // The dropped subscription keeps what it had buffered, then ends
        assert_eq!(next(&mut stalled).await.as_str(), "R/0");
        assert_eq!(next(&mut stalled).await.as_str(), "R/1");
        assert!(stalled.next().await.is_none());

        tokio::time::timeout(Duration::from_secs(10), orchestrator.shutdown())
            .await
            .expect("shutdown must not wait on a stalled listener");
    }

    #[tokio::test]
    async fn test_shutdown_during_restart_leaves_no_worker() {
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell("test", "exec sleep 30"));
        orchestrator.start().await.unwrap();

        let (restarted, ()) = tokio::join!(orchestrator.restart(), orchestrator.shutdown());
        restarted.unwrap();
        assert!(!orchestrator.is_running());

        // Nothing is left behind to block a later start
        orchestrator.start().await.unwrap();
        assert!(orchestrator.is_running());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropping_subscription_unregisters() {
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell("test", "exec sleep 30"));
        let first = orchestrator.subscribe();
        let second = orchestrator.watch_parcel_arrivals(["R".to_string()]);
        assert_eq!(orchestrator.listener_count(), 2);

        drop(first);
        assert_eq!(orchestrator.listener_count(), 1);
        drop(second);
        assert_eq!(orchestrator.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_send_reaches_worker() {
        let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell(
            "test",
            "while read line; do echo \"$line\"; done",
        ));
        let mut stages = orchestrator.watch_stages();

        assert!(matches!(
            orchestrator
                .send(&SubprocessMessage::Stage { stage: "x".into() })
                .await,
            Err(SubprocessError::ChannelClosed)
        ));

        orchestrator.start().await.unwrap();
        orchestrator
            .send(&SubprocessMessage::Stage {
                stage: "ping".into(),
            })
            .await
            .unwrap();
        assert_eq!(next(&mut stages).await, "ping");

        orchestrator.shutdown().await;
    }
}
