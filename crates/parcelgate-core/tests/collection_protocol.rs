//! Collection protocol tests
//!
//! Runs a CollectionServer against a CollectionClient over an in-memory
//! duplex pipe, with real parcel storage in a temporary directory.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use parcelgate_core::collection::ParcelArrivalSource;
use parcelgate_core::{
    ClientFrame, CloseCode, CollectionClient, CollectionServer, Direction, EndpointCredentials,
    GatewayIdentity, NoArrivals, NonceVerifier, ObjectWriter, Parcel, ParcelStore, ServerEvent,
    ServerFrame, Storage, StoredParcelKey, StreamingMode, SubprocessMessage, WorkerOrchestrator,
    WorkerSpec,
};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Harness
// ============================================================================

/// Arrival source the test pushes keys into by hand
#[derive(Clone, Default)]
struct ManualArrivals {
    watchers: Arc<Mutex<Vec<(Vec<String>, mpsc::UnboundedSender<StoredParcelKey>)>>>,
}

impl ManualArrivals {
    fn announce(&self, key: &StoredParcelKey, recipient_id: &str) {
        let watchers = self.watchers.lock().unwrap();
        for (ids, tx) in watchers.iter() {
            if ids.iter().any(|id| id == recipient_id) {
                let _ = tx.unbounded_send(key.clone());
            }
        }
    }
}

impl ParcelArrivalSource for ManualArrivals {
    fn watch_arrivals(&self, recipient_ids: Vec<String>) -> BoxStream<'static, StoredParcelKey> {
        let (tx, rx) = mpsc::unbounded();
        self.watchers.lock().unwrap().push((recipient_ids, tx));
        rx.boxed()
    }
}

struct Harness {
    temp: TempDir,
    storage: Storage,
    store: ParcelStore,
    gateway: GatewayIdentity,
    server: CollectionServer,
}

impl Harness {
    fn new(arrivals: Arc<dyn ParcelArrivalSource>) -> Self {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().join("gateway.redb")).unwrap();
        storage.set_registration("relay.example.com").unwrap();
        let store = ParcelStore::new(ObjectWriter::new(temp.path().join("parcels")), storage.clone());
        let gateway = GatewayIdentity::generate();
        let server = CollectionServer::new(
            store.clone(),
            arrivals,
            NonceVerifier::new([gateway.verifying_key()]),
            Arc::new(storage.clone()),
        )
        .with_heartbeat_interval(Duration::from_millis(50));

        Self {
            temp,
            storage,
            store,
            gateway,
            server,
        }
    }

    fn credentials(&self) -> EndpointCredentials {
        EndpointCredentials::issue(&self.gateway, chrono::Duration::days(1))
    }

    fn connect(&self) -> (CollectionClient<DuplexStream>, JoinHandle<CloseCode>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = self.server.clone();
        let task = tokio::spawn(async move { server.serve_connection(server_io).await });
        (CollectionClient::new(client_io), task)
    }

    async fn queue_for(&self, recipient: &EndpointCredentials, parcel_id: &str) -> StoredParcelKey {
        self.queue_expiring(recipient, parcel_id, chrono::Duration::hours(1))
            .await
    }

    async fn queue_expiring(
        &self,
        recipient: &EndpointCredentials,
        parcel_id: &str,
        ttl: chrono::Duration,
    ) -> StoredParcelKey {
        let parcel = Parcel::new(
            "peer",
            recipient.endpoint_id().as_str(),
            parcel_id,
            Utc::now() + ttl,
            parcel_id.as_bytes().to_vec(),
        );
        self.store
            .store(&parcel.serialize().unwrap(), &parcel, Direction::ToEndpoint)
            .await
            .unwrap()
    }
}

/// Next event that is not a heartbeat
async fn next_event(client: &mut CollectionClient<DuplexStream>) -> Option<ServerEvent> {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match client.next_event().await.unwrap() {
                Some(ServerEvent::Heartbeat) => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("no event from server")
}

async fn expect_delivery(client: &mut CollectionClient<DuplexStream>) -> (String, Parcel) {
    match next_event(client).await {
        Some(ServerEvent::Delivery {
            delivery_id,
            parcel,
        }) => (delivery_id, Parcel::deserialize(&parcel).unwrap()),
        other => panic!("expected a delivery, got {:?}", other),
    }
}

async fn expect_close(client: &mut CollectionClient<DuplexStream>, code: CloseCode) {
    match next_event(client).await {
        Some(ServerEvent::Closed { code: got, .. }) => assert_eq!(got, code.as_u16()),
        other => panic!("expected close {}, got {:?}", code, other),
    }
}

async fn finished(task: JoinHandle<CloseCode>) -> CloseCode {
    tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("connection did not finish")
        .unwrap()
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_zero_signatures_are_refused() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let (mut client, task) = harness.connect();

    client.handshake(StreamingMode::KeepAlive, &[]).await.unwrap();

    expect_close(&mut client, CloseCode::CannotAccept).await;
    assert_eq!(finished(task).await, CloseCode::CannotAccept);
}

#[tokio::test]
async fn test_one_bad_signature_rejects_all() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let trusted = harness.credentials();
    let untrusted = EndpointCredentials::issue(&GatewayIdentity::generate(), chrono::Duration::days(1));
    harness.queue_for(&trusted, "p1").await;

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::CloseUponCompletion, &[trusted, untrusted])
        .await
        .unwrap();

    expect_close(&mut client, CloseCode::CannotAccept).await;
    assert_eq!(finished(task).await, CloseCode::CannotAccept);
}

#[tokio::test]
async fn test_signature_over_wrong_nonce_is_refused() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let credentials = harness.credentials();
    let (mut client, task) = harness.connect();

    let _nonce = client.open(StreamingMode::KeepAlive).await.unwrap();
    client
        .authenticate(b"not the challenge", &[credentials])
        .await
        .unwrap();

    expect_close(&mut client, CloseCode::CannotAccept).await;
    assert_eq!(finished(task).await, CloseCode::CannotAccept);
}

#[tokio::test]
async fn test_unexpected_first_frame_is_refused() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let (mut client, task) = harness.connect();

    client
        .send(&ClientFrame::Ack {
            delivery_id: b"early".to_vec(),
        })
        .await
        .unwrap();

    expect_close(&mut client, CloseCode::CannotAccept).await;
    assert_eq!(finished(task).await, CloseCode::CannotAccept);
}

#[tokio::test]
async fn test_undecodable_handshake_response_is_refused() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let (mut client, task) = harness.connect();
    client.open(StreamingMode::KeepAlive).await.unwrap();

    // A length-delimited frame whose body names no known frame variant
    let mut io = client.into_inner();
    io.write_all(&[0, 0, 0, 2, 9, 0]).await.unwrap();
    let mut client = CollectionClient::new(io);

    expect_close(&mut client, CloseCode::CannotAccept).await;
    assert_eq!(finished(task).await, CloseCode::CannotAccept);
}

#[tokio::test]
async fn test_unregistered_gateway_asks_to_retry() {
    let harness = Harness::new(Arc::new(NoArrivals));
    harness.storage.clear_registration().unwrap();
    let (mut client, task) = harness.connect();

    let frame = tokio::time::timeout(TIMEOUT, client.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        frame,
        Some(ServerFrame::Close { code: 1013, .. })
    ));
    assert_eq!(finished(task).await, CloseCode::TryAgainLater);
}

#[tokio::test]
async fn test_aborted_handshake_closes_normally() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let (mut client, task) = harness.connect();

    let nonce = client.open(StreamingMode::KeepAlive).await.unwrap();
    assert_eq!(nonce.len(), 32);
    drop(client);

    assert_eq!(finished(task).await, CloseCode::Normal);
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_close_upon_completion_with_nothing_queued() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let (mut client, task) = harness.connect();

    client
        .handshake(StreamingMode::CloseUponCompletion, &[harness.credentials()])
        .await
        .unwrap();

    expect_close(&mut client, CloseCode::Normal).await;
    assert_eq!(finished(task).await, CloseCode::Normal);
}

#[tokio::test]
async fn test_two_endpoints_collect_with_out_of_order_acks() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let alice = harness.credentials();
    let bob = harness.credentials();
    let alice_key = harness.queue_for(&alice, "for-alice").await;
    let bob_key = harness.queue_for(&bob, "for-bob").await;

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::CloseUponCompletion, &[alice.clone(), bob.clone()])
        .await
        .unwrap();

    let (first_id, first) = expect_delivery(&mut client).await;
    let (second_id, second) = expect_delivery(&mut client).await;
    assert_ne!(first_id, second_id);
    // Recipients are served in handshake order
    assert_eq!(first.parcel_id, "for-alice");
    assert_eq!(second.parcel_id, "for-bob");
    assert_eq!(second.payload, b"for-bob");

    client.acknowledge(&second_id).await.unwrap();
    client.acknowledge(&first_id).await.unwrap();

    expect_close(&mut client, CloseCode::Normal).await;
    assert_eq!(finished(task).await, CloseCode::Normal);

    assert!(!harness.store.exists(&alice_key, Direction::ToEndpoint).await.unwrap());
    assert!(!harness.store.exists(&bob_key, Direction::ToEndpoint).await.unwrap());
}

#[tokio::test]
async fn test_only_authenticated_recipients_are_served() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let alice = harness.credentials();
    let bob = harness.credentials();
    harness.queue_for(&alice, "for-alice").await;
    let bob_key = harness.queue_for(&bob, "for-bob").await;

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::CloseUponCompletion, &[alice])
        .await
        .unwrap();

    let (id, parcel) = expect_delivery(&mut client).await;
    assert_eq!(parcel.parcel_id, "for-alice");
    client.acknowledge(&id).await.unwrap();

    expect_close(&mut client, CloseCode::Normal).await;
    finished(task).await;
    assert!(harness.store.exists(&bob_key, Direction::ToEndpoint).await.unwrap());
}

#[tokio::test]
async fn test_expired_parcels_are_not_delivered() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let alice = harness.credentials();
    let stale = harness
        .queue_expiring(&alice, "stale", chrono::Duration::seconds(-5))
        .await;

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::CloseUponCompletion, &[alice])
        .await
        .unwrap();

    expect_close(&mut client, CloseCode::Normal).await;
    finished(task).await;
    assert!(!harness.store.exists(&stale, Direction::ToEndpoint).await.unwrap());
}

#[tokio::test]
async fn test_unknown_ack_is_refused() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let alice = harness.credentials();
    let key = harness.queue_for(&alice, "p1").await;

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::CloseUponCompletion, &[alice])
        .await
        .unwrap();
    expect_delivery(&mut client).await;

    client.acknowledge("not-a-delivery").await.unwrap();

    expect_close(&mut client, CloseCode::CannotAccept).await;
    assert_eq!(finished(task).await, CloseCode::CannotAccept);
    assert!(harness.store.exists(&key, Direction::ToEndpoint).await.unwrap());
}

#[tokio::test]
async fn test_unacknowledged_parcel_is_redelivered_next_session() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let alice = harness.credentials();
    let key = harness.queue_for(&alice, "p1").await;

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::CloseUponCompletion, &[alice.clone()])
        .await
        .unwrap();
    expect_delivery(&mut client).await;
    drop(client);

    assert_eq!(finished(task).await, CloseCode::Normal);
    assert!(harness.store.exists(&key, Direction::ToEndpoint).await.unwrap());

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::CloseUponCompletion, &[alice])
        .await
        .unwrap();
    let (id, parcel) = expect_delivery(&mut client).await;
    assert_eq!(parcel.parcel_id, "p1");
    client.acknowledge(&id).await.unwrap();
    expect_close(&mut client, CloseCode::Normal).await;
    finished(task).await;
}

#[tokio::test]
async fn test_store_failure_closes_with_server_error() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let alice = harness.credentials();

    // A file where the recipient's queue directory should be
    let queue_dir = harness.temp.path().join("parcels/to-endpoint");
    std::fs::create_dir_all(&queue_dir).unwrap();
    std::fs::write(queue_dir.join(alice.endpoint_id().as_str()), b"not a directory").unwrap();

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::CloseUponCompletion, &[alice])
        .await
        .unwrap();

    expect_close(&mut client, CloseCode::ServerError).await;
    assert_eq!(finished(task).await, CloseCode::ServerError);
}

// ============================================================================
// Live sessions
// ============================================================================

#[tokio::test]
async fn test_keep_alive_sends_heartbeats() {
    let harness = Harness::new(Arc::new(NoArrivals));
    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::KeepAlive, &[harness.credentials()])
        .await
        .unwrap();

    for _ in 0..2 {
        let event = tokio::time::timeout(TIMEOUT, client.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, Some(ServerEvent::Heartbeat));
    }

    drop(client);
    assert_eq!(finished(task).await, CloseCode::Normal);
}

#[tokio::test]
async fn test_keep_alive_delivers_backlog_then_live_arrivals() {
    let arrivals = ManualArrivals::default();
    let harness = Harness::new(Arc::new(arrivals.clone()));
    let alice = harness.credentials();
    harness.queue_for(&alice, "backlog").await;

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::KeepAlive, &[alice.clone()])
        .await
        .unwrap();

    let (id, parcel) = expect_delivery(&mut client).await;
    assert_eq!(parcel.parcel_id, "backlog");
    client.acknowledge(&id).await.unwrap();

    // Acknowledging everything does not end a live session
    let event = tokio::time::timeout(TIMEOUT, client.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, Some(ServerEvent::Heartbeat));

    let live_key = harness.queue_for(&alice, "live").await;
    arrivals.announce(&live_key, alice.endpoint_id().as_str());

    let (id, parcel) = expect_delivery(&mut client).await;
    assert_eq!(parcel.parcel_id, "live");
    client.acknowledge(&id).await.unwrap();

    drop(client);
    assert_eq!(finished(task).await, CloseCode::Normal);
}

#[tokio::test]
async fn test_vanished_and_in_flight_arrivals_are_skipped() {
    let arrivals = ManualArrivals::default();
    let harness = Harness::new(Arc::new(arrivals.clone()));
    let alice = harness.credentials();
    let recipient = alice.endpoint_id().into_string();
    let backlog = harness.queue_for(&alice, "backlog").await;

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::KeepAlive, &[alice.clone()])
        .await
        .unwrap();
    let (first_id, _) = expect_delivery(&mut client).await;

    // Already awaiting an ack, and a key with nothing behind it
    arrivals.announce(&backlog, &recipient);
    arrivals.announce(&StoredParcelKey::new(format!("{}/gone", recipient)), &recipient);

    let fresh = harness.queue_for(&alice, "fresh").await;
    arrivals.announce(&fresh, &recipient);

    let (_, parcel) = expect_delivery(&mut client).await;
    assert_eq!(parcel.parcel_id, "fresh");

    client.acknowledge(&first_id).await.unwrap();
    drop(client);
    assert_eq!(finished(task).await, CloseCode::Normal);
}

#[tokio::test]
async fn test_invalid_arrival_key_does_not_end_session() {
    let arrivals = ManualArrivals::default();
    let harness = Harness::new(Arc::new(arrivals.clone()));
    let alice = harness.credentials();
    let recipient = alice.endpoint_id().into_string();

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::KeepAlive, &[alice.clone()])
        .await
        .unwrap();
    assert_eq!(
        tokio::time::timeout(TIMEOUT, client.next_event()).await.unwrap().unwrap(),
        Some(ServerEvent::Heartbeat)
    );

    arrivals.announce(&StoredParcelKey::new("../../outside"), &recipient);
    let fresh = harness.queue_for(&alice, "fresh").await;
    arrivals.announce(&fresh, &recipient);

    let (id, parcel) = expect_delivery(&mut client).await;
    assert_eq!(parcel.parcel_id, "fresh");
    client.acknowledge(&id).await.unwrap();

    drop(client);
    assert_eq!(finished(task).await, CloseCode::Normal);
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_arrivals_reach_live_session() {
    // Echoes every message back, so the test can make the worker announce
    let orchestrator = WorkerOrchestrator::new(WorkerSpec::shell(
        "echo-worker",
        "while read line; do echo \"$line\"; done",
    ));
    orchestrator.start().await.unwrap();

    let harness = Harness::new(Arc::new(orchestrator.clone()));
    let alice = harness.credentials();

    let (mut client, task) = harness.connect();
    client
        .handshake(StreamingMode::KeepAlive, &[alice.clone()])
        .await
        .unwrap();
    // Streaming has started, so the session is subscribed
    assert_eq!(
        tokio::time::timeout(TIMEOUT, client.next_event()).await.unwrap().unwrap(),
        Some(ServerEvent::Heartbeat)
    );

    let key = harness.queue_for(&alice, "from-worker").await;
    orchestrator
        .send(&SubprocessMessage::ParcelArrival {
            key: key.clone(),
            recipient_id: alice.endpoint_id().into_string(),
        })
        .await
        .unwrap();

    let (id, parcel) = expect_delivery(&mut client).await;
    assert_eq!(parcel.parcel_id, "from-worker");
    client.acknowledge(&id).await.unwrap();

    drop(client);
    assert_eq!(finished(task).await, CloseCode::Normal);
    assert!(!harness.store.exists(&key, Direction::ToEndpoint).await.unwrap());

    orchestrator.shutdown().await;
}
