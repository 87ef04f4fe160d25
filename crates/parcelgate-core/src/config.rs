//! Gateway configuration
//!
//! Read from `<data_dir>/gateway.json`. A missing file means defaults; a
//! file that does not parse is an error rather than silently ignored.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Configuration file name inside the data directory
pub const CONFIG_FILE: &str = "gateway.json";
/// redb database file name inside the data directory
pub const DATABASE_FILE: &str = "gateway.redb";
/// Parcel tree directory inside the data directory
pub const PARCELS_DIR: &str = "parcels";
/// JSONL log directory inside the data directory
pub const LOGS_DIR: &str = "logs";
/// Environment variable overriding the default data directory
pub const DATA_DIR_ENV: &str = "PARCELGATE_DATA_DIR";

/// How to launch a worker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Name used in logs
    pub name: String,
    /// Program to execute
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Convenience for `sh -c <script>`
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(name, "sh").args(["-c".to_string(), script.into()])
    }
}

/// Top-level gateway settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the collection endpoint listens on
    pub listen_addr: SocketAddr,
    /// Seconds between heartbeats on a collection connection
    pub heartbeat_interval_secs: u64,
    /// Delivery worker to supervise, if any
    pub worker: Option<WorkerSpec>,
    /// Buffer size of each worker subscription
    pub subscriber_capacity: usize,
    /// Seconds to wait before starting a failed worker again; 0 disables
    pub worker_respawn_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 13276)),
            heartbeat_interval_secs: 5,
            worker: None,
            subscriber_capacity: 256,
            worker_respawn_secs: 5,
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn worker_respawn_delay(&self) -> Option<Duration> {
        (self.worker_respawn_secs > 0).then(|| Duration::from_secs(self.worker_respawn_secs))
    }

    /// Load the configuration of a data directory
    pub fn load(data_dir: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = data_dir.as_ref().join(CONFIG_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Write the configuration into a data directory
    pub fn save(&self, data_dir: impl AsRef<Path>) -> GatewayResult<()> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let json =
            serde_json::to_vec_pretty(self).map_err(|e| GatewayError::Config(e.to_string()))?;
        std::fs::write(data_dir.join(CONFIG_FILE), json)?;
        Ok(())
    }
}

/// Pick the data directory: explicit path, then `PARCELGATE_DATA_DIR`, then
/// the platform data directory.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("parcelgate")
        })
}
