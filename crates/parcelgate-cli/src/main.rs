//! Parcelgate CLI
//!
//! Thin wrapper around parcelgate-core for running and inspecting a gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Show gateway information
//! parcelgate info
//!
//! # Run the gateway (collection endpoint + delivery worker)
//! parcelgate serve
//!
//! # Mark the gateway as registered with a relay peer
//! parcelgate register relay.example.com:443
//!
//! # Issue credentials for a local endpoint
//! parcelgate endpoint issue ./alice.json
//!
//! # Collect parcels as that endpoint
//! parcelgate collect ./alice.json
//!
//! # Inspect the queues
//! parcelgate parcels list --direction to-endpoint
//! parcelgate parcels sweep
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use parcelgate_core::config::LOGS_DIR;
use parcelgate_core::logging::JsonlLayer;
use parcelgate_core::{
    resolve_data_dir, CloseCode, CollectionClient, Direction, EndpointCredentials, Gateway,
    GatewayConfig, Parcel, ServerEvent, StoredParcelKey, StreamingMode,
};
use tracing::{debug, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Parcelgate - store-and-forward parcel gateway
#[derive(Parser)]
#[command(name = "parcelgate")]
#[command(version = "0.1.0")]
#[command(about = "Parcelgate - store-and-forward parcel gateway")]
#[command(
    long_about = "Queues parcels between a remote relay peer and the endpoints of a private network, and lets local endpoints collect theirs."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: $PARCELGATE_DATA_DIR or the platform data dir)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Also write JSONL logs to <data-dir>/logs
    #[arg(long, global = true)]
    jsonl_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show gateway information
    Info,

    /// Run the gateway until interrupted
    Serve {
        /// Collection endpoint address (default: from gateway.json)
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Parcel queue management
    Parcels {
        #[command(subcommand)]
        action: ParcelsAction,
    },

    /// Record the relay peer this gateway is registered with
    Register {
        /// Address of the relay peer
        peer_address: String,
    },

    /// Forget the relay peer registration
    Unregister,

    /// Endpoint credential management
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },

    /// Collect parcels from a gateway as one or more endpoints
    Collect {
        /// Credential files written by `endpoint issue`
        #[arg(required = true)]
        credentials: Vec<PathBuf>,

        /// Gateway address (default: listen address from gateway.json)
        #[arg(short, long)]
        addr: Option<String>,

        /// Stay connected and receive parcels as they arrive
        #[arg(short, long)]
        keep_alive: bool,

        /// Do not acknowledge; parcels stay queued on the gateway
        #[arg(long)]
        no_ack: bool,
    },
}

#[derive(Subcommand)]
enum ParcelsAction {
    /// List queued parcels
    List {
        /// Only this direction (to-peer or to-endpoint)
        #[arg(short = 'D', long, value_parser = parse_direction)]
        direction: Option<Direction>,
    },

    /// Show one parcel
    Show {
        /// Stored parcel key (plain/hashed)
        key: String,

        #[arg(short = 'D', long, value_parser = parse_direction, default_value = "to-endpoint")]
        direction: Direction,
    },

    /// Delete one parcel
    Delete {
        /// Stored parcel key (plain/hashed)
        key: String,

        #[arg(short = 'D', long, value_parser = parse_direction, default_value = "to-endpoint")]
        direction: Direction,
    },

    /// Remove expired and corrupt parcels
    Sweep {
        /// Only this direction (to-peer or to-endpoint)
        #[arg(short = 'D', long, value_parser = parse_direction)]
        direction: Option<Direction>,
    },
}

#[derive(Subcommand)]
enum EndpointAction {
    /// Generate an endpoint keypair with a certificate from this gateway
    Issue {
        /// Where to write the credentials
        out_file: PathBuf,

        /// Certificate validity in days
        #[arg(long, default_value_t = 365)]
        days: i64,
    },
}

fn setup_logging(verbosity: u8, jsonl_dir: Option<&Path>, component: &str) -> Result<()> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let jsonl_layer = match jsonl_dir {
        Some(dir) => Some(
            JsonlLayer::new(dir, component)
                .with_context(|| format!("Failed to open log directory {}", dir.display()))?,
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(jsonl_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    Ok(())
}

fn parse_direction(s: &str) -> Result<Direction, String> {
    Direction::parse(s).ok_or_else(|| format!("'{}' is not one of: to-peer, to-endpoint", s))
}

fn directions(only: Option<Direction>) -> Vec<Direction> {
    match only {
        Some(direction) => vec![direction],
        None => vec![Direction::ToPeer, Direction::ToEndpoint],
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir);

    let component = match cli.command {
        Commands::Collect { .. } => "collect",
        _ => "gateway",
    };
    let logs_dir = cli.jsonl_logs.then(|| data_dir.join(LOGS_DIR));
    setup_logging(cli.verbose, logs_dir.as_deref(), component)?;

    let config = GatewayConfig::load(&data_dir)?;

    match cli.command {
        Commands::Info => {
            let gateway = open_gateway(&data_dir, config)?;
            let storage = gateway.storage();
            let store = gateway.parcel_store();

            println!("Parcelgate v0.1.0");
            println!();
            println!("Gateway:");
            println!(
                "  Public key: {}",
                hex::encode(gateway.identity().verifying_key().as_bytes())
            );
            match storage.registered_peer()? {
                Some(peer) => println!("  Registered with: {}", peer),
                None => println!("  Registered with: (not registered)"),
            }
            println!("  Collection endpoint: {}", gateway.config().listen_addr);
            match &gateway.config().worker {
                Some(worker) => println!("  Worker: {} ({})", worker.name, worker.command),
                None => println!("  Worker: (none configured)"),
            }
            println!();
            println!("Queued parcels:");
            for direction in directions(None) {
                let count = store
                    .list_queued(direction)
                    .try_fold(0usize, |count, _| async move { Ok(count + 1) })
                    .await?;
                println!("  {}: {}", direction, count);
            }
            println!();
            println!("Data directory: {}", gateway.data_dir().display());
        }

        Commands::Serve { listen } => {
            let gateway = open_gateway(&data_dir, config)?;
            let addr = listen.unwrap_or(gateway.config().listen_addr);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to listen on {}", addr))?;

            println!("Starting Parcelgate...");
            println!();
            println!(
                "Gateway key: {}",
                hex::encode(gateway.identity().verifying_key().as_bytes())
            );
            println!("Collection endpoint: {}", listener.local_addr()?);
            if gateway.storage().registered_peer()?.is_none() {
                println!("Warning: gateway is not registered; endpoints will be asked to retry");
            }

            gateway.start_worker().await?;

            println!();
            println!("Gateway is running. Press Ctrl+C to stop.");

            gateway
                .serve(listener, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "Failed to listen for Ctrl+C");
                        std::future::pending::<()>().await;
                    }
                })
                .await?;

            println!();
            println!("Shutting down...");
            gateway.shutdown().await;
        }

        Commands::Parcels { action } => {
            let gateway = open_gateway(&data_dir, config)?;
            let store = gateway.parcel_store();
            match action {
                ParcelsAction::List { direction } => {
                    let mut total = 0;
                    for direction in directions(direction) {
                        let mut queued = store.list_queued(direction);
                        while let Some(parcel) = queued.try_next().await? {
                            println!(
                                "{}  {}  expires {}",
                                direction,
                                parcel.key,
                                parcel.expiry_date.to_rfc3339()
                            );
                            total += 1;
                        }
                    }
                    if total == 0 {
                        println!("No queued parcels.");
                    }
                }

                ParcelsAction::Show { key, direction } => {
                    let key = StoredParcelKey::new(key);
                    let bytes = store
                        .retrieve(&key, direction)
                        .await?
                        .with_context(|| format!("No parcel {} in {}", key, direction))?;
                    let parcel = Parcel::deserialize(&bytes)
                        .with_context(|| format!("Parcel {} is not readable", key))?;

                    println!("Parcel: {}", key);
                    println!("  Direction: {}", direction);
                    println!("  Sender: {}", parcel.sender_id);
                    println!("  Recipient: {}", parcel.recipient_id);
                    println!("  Parcel ID: {}", parcel.parcel_id);
                    println!("  Expires: {}", parcel.expiry_date.to_rfc3339());
                    println!("  Payload: {} bytes", parcel.payload.len());
                }

                ParcelsAction::Delete { key, direction } => {
                    let key = StoredParcelKey::new(key);
                    if !store.exists(&key, direction).await? {
                        anyhow::bail!("No parcel {} in {}", key, direction);
                    }
                    store.delete(&key, direction).await?;
                    println!("Deleted {}", key);
                }

                ParcelsAction::Sweep { direction } => {
                    for direction in directions(direction) {
                        let remaining = store.sweep_expired(direction).await?;
                        println!("{}: {} parcel(s) remaining", direction, remaining);
                    }
                }
            }
        }

        Commands::Register { peer_address } => {
            let gateway = open_gateway(&data_dir, config)?;
            gateway.storage().set_registration(&peer_address)?;
            println!("Registered with {}", peer_address);
        }

        Commands::Unregister => {
            let gateway = open_gateway(&data_dir, config)?;
            if gateway.storage().registered_peer()?.is_none() {
                println!("Gateway was not registered.");
            } else {
                gateway.storage().clear_registration()?;
                println!("Registration removed.");
            }
        }

        Commands::Endpoint { action } => match action {
            EndpointAction::Issue { out_file, days } => {
                let gateway = open_gateway(&data_dir, config)?;
                if days <= 0 {
                    anyhow::bail!("Validity must be at least one day");
                }
                let credentials =
                    gateway.issue_endpoint_credentials(chrono::Duration::days(days));
                credentials
                    .save(&out_file)
                    .with_context(|| format!("Failed to write {}", out_file.display()))?;

                println!("Endpoint: {}", credentials.endpoint_id());
                println!("Credentials written to {}", out_file.display());
            }
        },

        Commands::Collect {
            credentials,
            addr,
            keep_alive,
            no_ack,
        } => {
            let addr = addr.unwrap_or_else(|| config.listen_addr.to_string());
            collect(&credentials, &addr, keep_alive, no_ack).await?;
        }
    }

    Ok(())
}

fn open_gateway(data_dir: &Path, config: GatewayConfig) -> Result<Gateway> {
    Gateway::open(data_dir, config)
        .with_context(|| format!("Failed to open gateway in {}", data_dir.display()))
}

async fn collect(
    credential_files: &[PathBuf],
    addr: &str,
    keep_alive: bool,
    no_ack: bool,
) -> Result<()> {
    let credentials = credential_files
        .iter()
        .map(|path| {
            EndpointCredentials::load(path)
                .with_context(|| format!("Failed to load credentials from {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut client = CollectionClient::connect_tcp(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    let mode = if keep_alive {
        StreamingMode::KeepAlive
    } else {
        StreamingMode::CloseUponCompletion
    };
    client
        .handshake(mode, &credentials)
        .await
        .context("Handshake failed")?;

    let mut collected = 0usize;
    loop {
        tokio::select! {
            event = client.next_event() => match event? {
                Some(ServerEvent::Delivery { delivery_id, parcel }) => {
                    match Parcel::deserialize(&parcel) {
                        Ok(parcel) => println!(
                            "{}  {} -> {}  {} bytes",
                            parcel.parcel_id,
                            parcel.sender_id,
                            parcel.recipient_id,
                            parcel.payload.len()
                        ),
                        Err(e) => warn!(%delivery_id, error = %e, "Received an unreadable parcel"),
                    }
                    if !no_ack {
                        client.acknowledge(&delivery_id).await?;
                    }
                    collected += 1;
                }
                Some(ServerEvent::Heartbeat) => debug!("Heartbeat"),
                Some(ServerEvent::Closed { code, reason }) => {
                    if code != CloseCode::Normal.as_u16() {
                        anyhow::bail!("Gateway closed the connection ({}): {}", code, reason);
                    }
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Collected {} parcel(s)", collected);
    Ok(())
}
