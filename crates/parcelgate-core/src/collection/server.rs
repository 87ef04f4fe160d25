//! Gateway side of a collection connection
//!
//! ```text
//! Connected ─► ChallengeSent ─┬─► HandshakeFailed ─► Closed (1003)
//!                             └─► Authenticated ─► Streaming ─► Closed
//! ```
//!
//! While streaming, three things run on the connection task at once:
//!
//! - delivery: backlog from the [`ParcelStore`], then live arrivals
//! - acknowledgements: each ack deletes the parcel from the store
//! - heartbeat ticker
//!
//! All frames reach the socket through a single writer task.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use futures::SinkExt;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use super::protocol::{frame_codec, ClientFrame, CloseCode, ServerFrame, StreamingMode, NONCE_LENGTH};
use super::session::DeliverySession;
use super::ParcelArrivalSource;
use crate::error::{GatewayResult, StoreError};
use crate::identity::{EndpointId, NonceVerifier};
use crate::storage::{ParcelStore, RegistrationStatus};
use crate::types::{Direction, StoredParcelKey};

/// Default time between heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Frames queued for the writer task
const OUTBOUND_BUFFER: usize = 32;

/// How long the writer may take to flush the final frames
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

const COMPLETED_REASON: &str = "All available parcels delivered";

/// How a connection ended, before the close frame is written
enum Outcome {
    Close { code: CloseCode, reason: String },
    Disconnected,
}

impl Outcome {
    fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Outcome::Close {
            code,
            reason: reason.into(),
        }
    }
}

enum Inbound {
    Frame(ClientFrame),
    Malformed(String),
    Disconnected,
}

enum DeliveryEnd {
    Exhausted,
    Disconnected,
}

/// Serves collection connections for one gateway
#[derive(Clone)]
pub struct CollectionServer {
    store: ParcelStore,
    arrivals: Arc<dyn ParcelArrivalSource>,
    verifier: NonceVerifier,
    registration: Arc<dyn RegistrationStatus>,
    heartbeat_interval: Duration,
}

impl CollectionServer {
    pub fn new(
        store: ParcelStore,
        arrivals: Arc<dyn ParcelArrivalSource>,
        verifier: NonceVerifier,
        registration: Arc<dyn RegistrationStatus>,
    ) -> Self {
        Self {
            store,
            arrivals,
            verifier,
            registration,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Run one connection to completion and report how it was closed.
    ///
    /// Never fails: internal errors are logged and end the connection with
    /// [`CloseCode::ServerError`].
    pub async fn serve_connection<S>(&self, io: S) -> CloseCode
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mut frames = FramedRead::new(read_half, frame_codec());
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let mut writer = tokio::spawn(write_frames(
            FramedWrite::new(write_half, frame_codec()),
            out_rx,
        ));

        let code = match self.run(&mut frames, &out_tx).await {
            Ok(Outcome::Close { code, reason }) => {
                debug!(%code, %reason, "Closing collection connection");
                let _ = out_tx.send(ServerFrame::close(code, reason)).await;
                code
            }
            Ok(Outcome::Disconnected) => {
                debug!("Collection client went away");
                CloseCode::Normal
            }
            Err(e) => {
                error!(error = %e, "Collection connection failed");
                let _ = out_tx
                    .send(ServerFrame::close(CloseCode::ServerError, "Internal server error"))
                    .await;
                CloseCode::ServerError
            }
        };

        drop(out_tx);
        if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
            warn!("Collection client did not drain its connection");
            writer.abort();
        }
        code
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Handshake
    // ═══════════════════════════════════════════════════════════════════════

    async fn run<R>(
        &self,
        frames: &mut FramedRead<R, LengthDelimitedCodec>,
        out: &mpsc::Sender<ServerFrame>,
    ) -> GatewayResult<Outcome>
    where
        R: AsyncRead + Unpin,
    {
        if !self.registration.is_registered()? {
            info!("Refusing collection while the gateway is unregistered");
            return Ok(Outcome::close(
                CloseCode::TryAgainLater,
                "Gateway is not registered yet",
            ));
        }

        let mode = match read_frame(frames).await {
            Inbound::Frame(ClientFrame::Connect { streaming_mode }) => {
                StreamingMode::parse(&streaming_mode)
            }
            Inbound::Frame(_) => {
                return Ok(Outcome::close(
                    CloseCode::CannotAccept,
                    "Expected connection parameters",
                ))
            }
            Inbound::Malformed(e) => {
                debug!(error = %e, "Malformed connection parameters");
                return Ok(Outcome::close(
                    CloseCode::CannotAccept,
                    "Malformed connection parameters",
                ));
            }
            Inbound::Disconnected => return Ok(Outcome::Disconnected),
        };

        let mut nonce = vec![0u8; NONCE_LENGTH];
        rand::rng().fill_bytes(&mut nonce);
        if out
            .send(ServerFrame::Challenge {
                nonce: nonce.clone(),
            })
            .await
            .is_err()
        {
            return Ok(Outcome::Disconnected);
        }

        let signatures = match read_frame(frames).await {
            Inbound::Frame(ClientFrame::HandshakeResponse { signatures }) => signatures,
            Inbound::Frame(_) => {
                return Ok(Outcome::close(
                    CloseCode::CannotAccept,
                    "Expected handshake response",
                ))
            }
            Inbound::Malformed(e) => {
                debug!(error = %e, "Malformed handshake response");
                return Ok(Outcome::close(
                    CloseCode::CannotAccept,
                    "Malformed handshake response",
                ));
            }
            Inbound::Disconnected => {
                debug!("Client aborted the handshake");
                return Ok(Outcome::Disconnected);
            }
        };

        let endpoints = match self.verifier.verify_all(&nonce, &signatures) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                info!(error = %e, signatures = signatures.len(), "Rejected handshake");
                return Ok(Outcome::close(CloseCode::CannotAccept, e.to_string()));
            }
        };

        let recipients: Vec<String> = endpoints.into_iter().map(EndpointId::into_string).collect();
        tracing::Span::current().record("endpoint", recipients.join(",").as_str());
        info!(endpoints = recipients.len(), %mode, "Endpoints authenticated");

        self.stream_parcels(frames, out, recipients, mode).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Streaming
    // ═══════════════════════════════════════════════════════════════════════

    async fn stream_parcels<R>(
        &self,
        frames: &mut FramedRead<R, LengthDelimitedCodec>,
        out: &mpsc::Sender<ServerFrame>,
        recipients: Vec<String>,
        mode: StreamingMode,
    ) -> GatewayResult<Outcome>
    where
        R: AsyncRead + Unpin,
    {
        // Subscribe before listing so parcels stored in between are not missed
        let live = match mode {
            StreamingMode::KeepAlive => Some(self.arrivals.watch_arrivals(recipients.clone())),
            StreamingMode::CloseUponCompletion => None,
        };
        let queued = self
            .store
            .list_queued_for_recipients(Direction::ToEndpoint, &recipients);
        let keys = match live {
            Some(live) => queued.chain(live.map(Ok)).boxed(),
            None => queued,
        };

        let session = Mutex::new(DeliverySession::new(recipients));
        let delivery = self.deliver(keys, &session, out);
        let acks = self.process_acks(frames, &session);
        tokio::pin!(delivery);
        tokio::pin!(acks);

        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut delivering = true;

        loop {
            tokio::select! {
                end = &mut delivery, if delivering => {
                    delivering = false;
                    match end? {
                        DeliveryEnd::Disconnected => return Ok(Outcome::Disconnected),
                        DeliveryEnd::Exhausted => {
                            let complete = session.lock().is_complete();
                            if complete {
                                return Ok(Outcome::close(CloseCode::Normal, COMPLETED_REASON));
                            }
                        }
                    }
                }
                outcome = &mut acks => return outcome,
                _ = heartbeat.tick() => {
                    if out.send(ServerFrame::Heartbeat).await.is_err() {
                        return Ok(Outcome::Disconnected);
                    }
                }
            }
        }
    }

    async fn deliver(
        &self,
        mut keys: BoxStream<'static, Result<StoredParcelKey, StoreError>>,
        session: &Mutex<DeliverySession>,
        out: &mpsc::Sender<ServerFrame>,
    ) -> GatewayResult<DeliveryEnd> {
        while let Some(key) = keys.next().await {
            let key = key?;
            let in_flight = session.lock().is_in_flight(&key);
            if in_flight {
                debug!(%key, "Parcel already awaiting acknowledgement");
                continue;
            }

            let parcel = match self.store.retrieve(&key, Direction::ToEndpoint).await {
                Ok(Some(parcel)) => parcel,
                Ok(None) => {
                    debug!(%key, "Parcel vanished before delivery");
                    continue;
                }
                Err(StoreError::KeyOutsideRoot(_)) => {
                    warn!(%key, "Ignoring arrival with an invalid parcel key");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let delivery_id = session.lock().record(key.clone());
            debug!(%key, %delivery_id, "Delivering parcel");
            if out
                .send(ServerFrame::Delivery {
                    delivery_id,
                    parcel,
                })
                .await
                .is_err()
            {
                return Ok(DeliveryEnd::Disconnected);
            }
        }

        session.lock().mark_no_more_parcels();
        Ok(DeliveryEnd::Exhausted)
    }

    async fn process_acks<R>(
        &self,
        frames: &mut FramedRead<R, LengthDelimitedCodec>,
        session: &Mutex<DeliverySession>,
    ) -> GatewayResult<Outcome>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let delivery_id = match read_frame(frames).await {
                Inbound::Frame(ClientFrame::Ack { delivery_id }) => delivery_id,
                Inbound::Frame(_) => {
                    return Ok(Outcome::close(CloseCode::CannotAccept, "Expected acknowledgement"))
                }
                Inbound::Malformed(e) => {
                    debug!(error = %e, "Malformed acknowledgement");
                    return Ok(Outcome::close(
                        CloseCode::CannotAccept,
                        "Malformed acknowledgement",
                    ));
                }
                Inbound::Disconnected => return Ok(Outcome::Disconnected),
            };

            let acknowledged = session.lock().acknowledge(&delivery_id);
            let Some(key) = acknowledged else {
                info!(
                    delivery_id = %String::from_utf8_lossy(&delivery_id),
                    "Unknown acknowledgement"
                );
                return Ok(Outcome::close(CloseCode::CannotAccept, "Unknown delivery id"));
            };

            self.store.delete(&key, Direction::ToEndpoint).await?;
            debug!(%key, "Parcel collected");

            let complete = session.lock().is_complete();
            if complete {
                return Ok(Outcome::close(CloseCode::Normal, COMPLETED_REASON));
            }
        }
    }
}

impl std::fmt::Debug for CollectionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionServer")
            .field("store", &self.store)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

async fn read_frame<R>(frames: &mut FramedRead<R, LengthDelimitedCodec>) -> Inbound
where
    R: AsyncRead + Unpin,
{
    match frames.next().await {
        None => Inbound::Disconnected,
        Some(Ok(bytes)) => match ClientFrame::decode(&bytes) {
            Ok(frame) => Inbound::Frame(frame),
            Err(e) => Inbound::Malformed(e.to_string()),
        },
        Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => Inbound::Malformed(e.to_string()),
        Some(Err(e)) => {
            debug!(error = %e, "Collection connection read failed");
            Inbound::Disconnected
        }
    }
}

/// Sole owner of the socket's write half. Stops after a close frame.
async fn write_frames<W>(
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
    mut rx: mpsc::Receiver<ServerFrame>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let last = matches!(frame, ServerFrame::Close { .. });
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                continue;
            }
        };
        if let Err(e) = sink.send(bytes).await {
            debug!(error = %e, "Collection client stopped reading");
            return;
        }
        if last {
            break;
        }
    }
    if let Err(e) = SinkExt::<Bytes>::close(&mut sink).await {
        debug!(error = %e, "Failed to shut down collection connection");
    }
}
