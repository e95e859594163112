// NelsonConfig — load/merge configuration from a JSON file under the
// platform config directory, following the `dirs`-based convention.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::NelsonError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NeighborSeed {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub tcp_port: Option<u16>,
    #[serde(default)]
    pub udp_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NelsonConfig {
    /// Static neighbors configured out-of-band, never removed by a reshuffle.
    pub neighbors: Vec<NeighborSeed>,

    /// Port this node listens for inbound peer links on.
    pub port: u16,
    /// Ledger TCP neighbor port advertised for self.
    pub tcp_port: Option<u16>,
    /// Ledger UDP neighbor port advertised for self.
    pub udp_port: Option<u16>,
    /// Host Nelson binds its status HTTP API to.
    pub api_hostname: String,
    /// Port the status HTTP API listens on.
    pub api_port: u16,

    /// Base URL of the ledger node's JSON-RPC API this node manages.
    pub iri_rpc_url: String,
    /// Port of the ledger node's own HTTP API (distinct from `api_port`).
    pub iri_api_port: u16,

    pub beat_interval_secs: u64,
    pub cycle_interval_secs: u64,
    pub epoch_interval_secs: u64,

    /// Number of peers sampled into a hello message's gossip payload.
    pub gossip_size: usize,
    /// Outbound HTTP request timeout for IRI RPC calls.
    pub request_timeout_secs: u64,

    /// Whether this node treats itself as authoritative (master mode)
    /// for weight calculation, favoring connection recency over age.
    pub master_mode: bool,

    /// Permit multiple peers per hostname, differentiated by port, rather
    /// than treating hostname alone as the dedup key.
    pub multi_port: bool,

    /// Use an ephemeral, non-persistent peer store.
    pub temporary: bool,
    pub data_dir: Option<PathBuf>,
}

impl Default for NelsonConfig {
    fn default() -> Self {
        Self {
            neighbors: Vec::new(),
            port: 14600,
            tcp_port: Some(15600),
            udp_port: Some(14600),
            api_hostname: "0.0.0.0".to_string(),
            api_port: 14265,
            iri_rpc_url: "http://localhost:14265".to_string(),
            iri_api_port: 14265,
            beat_interval_secs: 5,
            cycle_interval_secs: 20,
            epoch_interval_secs: 300,
            gossip_size: 6,
            request_timeout_secs: 10,
            master_mode: false,
            multi_port: false,
            temporary: false,
            data_dir: None,
        }
    }
}

impl NelsonConfig {
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("nelson"))
    }

    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("config.json"))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("nelson")
        })
    }

    /// Load the config file if present, otherwise return defaults.
    pub fn load() -> Result<Self, NelsonError> {
        let Some(path) = Self::config_file() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| NelsonError::Config(e.to_string()))?;
        serde_json::from_str(&data).map_err(|e| NelsonError::Config(e.to_string()))
    }

    pub fn save(&self) -> Result<(), NelsonError> {
        let Some(path) = Self::config_file() else {
            return Err(NelsonError::Config("no config directory available".into()));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| NelsonError::Config(e.to_string()))?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|e| NelsonError::Config(e.to_string()))?;
        std::fs::write(&path, data).map_err(|e| NelsonError::Config(e.to_string()))
    }

    pub fn beat_interval(&self) -> Duration {
        Duration::from_secs(self.beat_interval_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn epoch_interval(&self) -> Duration {
        Duration::from_secs(self.epoch_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn add_neighbor(&mut self, ip: String, port: u16) {
        if !self.neighbors.iter().any(|n| n.ip == ip && n.port == port) {
            self.neighbors.push(NeighborSeed {
                ip,
                port,
                tcp_port: Some(port),
                udp_port: Some(port),
            });
        }
    }

    pub fn remove_neighbor(&mut self, ip: &str, port: u16) {
        self.neighbors.retain(|n| !(n.ip == ip && n.port == port));
    }
}
