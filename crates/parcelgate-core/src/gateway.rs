//! Gateway - the primary entry point
//!
//! Gateway wires together:
//! - the redb ledger and the on-disk parcel tree
//! - the gateway identity that certifies endpoints
//! - the delivery worker and its connectivity status
//! - the collection endpoint local endpoints connect to
//!
//! # Example
//!
//! ```ignore
//! use parcelgate_core::{Gateway, GatewayConfig};
//!
//! let gateway = Gateway::open("~/.local/share/parcelgate", GatewayConfig::default())?;
//! gateway.start_worker().await?;
//!
//! let listener = tokio::net::TcpListener::bind(gateway.config().listen_addr).await?;
//! gateway.serve(listener, tokio::signal::ctrl_c().map(|_| ())).await?;
//! gateway.shutdown().await;
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::collection::{CollectionServer, NoArrivals, ParcelArrivalSource};
use crate::config::{GatewayConfig, DATABASE_FILE, PARCELS_DIR};
use crate::error::{GatewayResult, WorkerFailure};
use crate::identity::{EndpointCredentials, GatewayIdentity, NonceVerifier};
use crate::status::{ConnectivityStatus, StatusBus};
use crate::storage::{ObjectWriter, ParcelStore, Storage};
use crate::worker::WorkerOrchestrator;

/// A running parcel gateway
pub struct Gateway {
    data_dir: PathBuf,
    config: GatewayConfig,
    storage: Storage,
    store: ParcelStore,
    identity: GatewayIdentity,
    orchestrator: Option<WorkerOrchestrator>,
    status: StatusBus<ConnectivityStatus>,
    server: CollectionServer,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Open (or initialize) the gateway stored in `data_dir`.
    ///
    /// Generates and persists the gateway identity on first use.
    pub fn open(data_dir: impl AsRef<Path>, config: GatewayConfig) -> GatewayResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let storage = Storage::new(data_dir.join(DATABASE_FILE))?;
        let store = ParcelStore::new(ObjectWriter::new(data_dir.join(PARCELS_DIR)), storage.clone());

        let identity = match storage.load_gateway_key()? {
            Some(seed) => GatewayIdentity::from_seed(&seed),
            None => {
                let identity = GatewayIdentity::generate();
                storage.save_gateway_key(&identity.seed())?;
                info!(public_key = %hex::encode(identity.verifying_key().as_bytes()), "Generated gateway identity");
                identity
            }
        };

        let orchestrator = config
            .worker
            .clone()
            .map(|spec| WorkerOrchestrator::with_capacity(spec, config.subscriber_capacity));
        let arrivals: Arc<dyn ParcelArrivalSource> = match &orchestrator {
            Some(orchestrator) => Arc::new(orchestrator.clone()),
            None => Arc::new(NoArrivals),
        };

        let server = CollectionServer::new(
            store.clone(),
            arrivals,
            NonceVerifier::new([identity.verifying_key()]),
            Arc::new(storage.clone()),
        )
        .with_heartbeat_interval(config.heartbeat_interval());

        info!(data_dir = %data_dir.display(), worker = orchestrator.is_some(), "Gateway opened");

        Ok(Self {
            data_dir,
            config,
            storage,
            store,
            identity,
            orchestrator,
            status: StatusBus::new(ConnectivityStatus::Disconnected),
            server,
            background: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn parcel_store(&self) -> &ParcelStore {
        &self.store
    }

    pub fn identity(&self) -> &GatewayIdentity {
        &self.identity
    }

    /// The worker orchestrator, if a worker is configured
    pub fn orchestrator(&self) -> Option<&WorkerOrchestrator> {
        self.orchestrator.as_ref()
    }

    /// Connectivity to the relay peer as reported by the worker
    pub fn status(&self) -> &StatusBus<ConnectivityStatus> {
        &self.status
    }

    pub fn collection_server(&self) -> &CollectionServer {
        &self.server
    }

    /// Issue credentials for a new local endpoint
    pub fn issue_endpoint_credentials(&self, validity: chrono::Duration) -> EndpointCredentials {
        EndpointCredentials::issue(&self.identity, validity)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Worker
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the delivery worker and keep [`status`](Self::status) in step
    /// with it. Does nothing when no worker is configured.
    pub async fn start_worker(&self) -> GatewayResult<()> {
        let Some(orchestrator) = self.orchestrator.clone() else {
            debug!("No worker configured");
            return Ok(());
        };

        // Subscribed before the worker exists so its first status is seen
        let mut statuses = orchestrator.stream_status();
        let bus = self.status.clone();
        let forward = tokio::spawn(async move {
            while let Some(status) = statuses.next().await {
                if bus.set_status(status) {
                    info!(%status, "Connectivity changed");
                }
            }
        });
        let supervise = tokio::spawn(supervise_worker(
            orchestrator.clone(),
            orchestrator.subscribe_failures(),
            self.status.clone(),
            self.config.worker_respawn_delay(),
        ));

        if let Err(e) = orchestrator.start().await {
            forward.abort();
            supervise.abort();
            return Err(e.into());
        }
        self.background.lock().extend([forward, supervise]);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Collection endpoint
    // ═══════════════════════════════════════════════════════════════════════

    /// Accept collection connections until `shutdown` resolves.
    ///
    /// Each connection runs on its own task; open connections are dropped
    /// when serving stops.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %listener.local_addr()?, "Collection endpoint listening");
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.server.clone();
                        connections.spawn(
                            async move {
                                let code = server.serve_connection(stream).await;
                                debug!(%code, "Connection closed");
                            }
                            .instrument(info_span!(
                                "collection",
                                %peer,
                                session = %ulid::Ulid::new(),
                                endpoint = tracing::field::Empty
                            )),
                        );
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }

        connections.shutdown().await;
        info!("Collection endpoint stopped");
        Ok(())
    }

    /// Stop the worker and background tasks
    pub async fn shutdown(&self) {
        let background: Vec<_> = self.background.lock().drain(..).collect();
        for task in background {
            task.abort();
        }
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.shutdown().await;
        }
        self.status.set_status(ConnectivityStatus::Disconnected);
        info!("Gateway shut down");
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("data_dir", &self.data_dir)
            .field("identity", &self.identity)
            .field("worker", &self.orchestrator.is_some())
            .finish_non_exhaustive()
    }
}

/// Reacts to worker failures: marks the gateway disconnected and starts
/// the worker again after `respawn_delay`, unless it reported that the
/// gateway is unregistered.
async fn supervise_worker(
    orchestrator: WorkerOrchestrator,
    mut failures: broadcast::Receiver<WorkerFailure>,
    status: StatusBus<ConnectivityStatus>,
    respawn_delay: Option<Duration>,
) {
    loop {
        let failure = match failures.recv().await {
            Ok(failure) => failure,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed worker failure notifications");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        status.set_status(ConnectivityStatus::Disconnected);

        if failure == WorkerFailure::Unregistered {
            warn!("Worker reports the gateway is unregistered; not restarting it");
            continue;
        }
        let Some(delay) = respawn_delay else {
            warn!(%failure, "Worker failed; automatic restart is disabled");
            continue;
        };

        info!(%failure, delay_secs = delay.as_secs(), "Restarting worker after failure");
        tokio::time::sleep(delay).await;
        if let Err(e) = orchestrator.start().await {
            error!(error = %e, "Failed to restart worker");
        }
    }
}
