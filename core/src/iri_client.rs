// IRIClient — JSON-RPC client talking to the ledger node's neighbor API.
//
// Request/response style throughout: no continuation callbacks. Grounded
// on the pack's use of `reqwest` for typed outbound JSON bodies (the
// local control-API's `hyper::Client` pattern doesn't fit a request with
// a typed JSON body and response).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::peer_list::clean_address;
use crate::IriError;

const HEALTH_TICK: Duration = Duration::from_secs(15);
const POLL_RETRY: Duration = Duration::from_secs(5);

/// Extract the bare host (IP or hostname, no scheme, no port) a static
/// neighbor is matched on. `getNeighbors` reports `host:port`; URIs built
/// locally are `udp://host:port` or `tcp://host:port` — both normalize to
/// the same key so static-neighbor membership is checked by host alone,
/// not by scheme or port.
fn static_key(uri_or_address: &str) -> String {
    let without_scheme = uri_or_address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(uri_or_address);
    let host = without_scheme.split(':').next().unwrap_or(without_scheme);
    clean_address(host)
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    uris: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct NeighborsResponse {
    #[serde(default)]
    neighbors: Vec<NeighborInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeighborInfo {
    pub address: String,
    #[serde(default)]
    pub connection_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddRemoveResponse {
    #[serde(rename = "addedNeighbors", default)]
    added_neighbors: Option<u32>,
    #[serde(rename = "removedNeighbors", default)]
    removed_neighbors: Option<u32>,
}

pub struct IriClient {
    http: reqwest::Client,
    base_url: String,
    static_neighbors: RwLock<HashSet<String>>,
    healthy: AtomicBool,
}

impl IriClient {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Arc<Self>, IriError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| IriError::Request(e.to_string()))?;

        Ok(Arc::new(Self {
            http,
            base_url,
            static_neighbors: RwLock::new(HashSet::new()),
            healthy: AtomicBool::new(false),
        }))
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        req: &RpcRequest<'_>,
    ) -> Result<T, IriError> {
        let response = self
            .http
            .post(&self.base_url)
            .header("X-IOTA-API-Version", "1")
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IriError::Timeout
                } else {
                    IriError::Request(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(IriError::Response(format!(
                "ledger returned status {}",
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| IriError::Response(e.to_string()))
    }

    pub async fn get_neighbors(&self) -> Result<Vec<NeighborInfo>, IriError> {
        let req = RpcRequest {
            command: "getNeighbors",
            uris: None,
        };
        let resp: NeighborsResponse = self.call(&req).await?;
        Ok(resp.neighbors)
    }

    pub async fn add_neighbors(&self, uris: &[String]) -> Result<u32, IriError> {
        let req = RpcRequest {
            command: "addNeighbors",
            uris: Some(uris),
        };
        let resp: AddRemoveResponse = self.call(&req).await?;
        Ok(resp.added_neighbors.unwrap_or(0))
    }

    /// Remove neighbors, always filtering out any URI the caller has
    /// registered as static — static neighbors are never torn down by
    /// this path regardless of what the caller passed in.
    pub async fn remove_neighbors(&self, uris: &[String]) -> Result<u32, IriError> {
        let filtered: Vec<String> = uris
            .iter()
            .filter(|u| !self.is_static_neighbor(u))
            .cloned()
            .collect();
        if filtered.is_empty() {
            return Ok(0);
        }
        let req = RpcRequest {
            command: "removeNeighbors",
            uris: Some(&filtered),
        };
        let resp: AddRemoveResponse = self.call(&req).await?;
        Ok(resp.removed_neighbors.unwrap_or(0))
    }

    /// Replace the full neighbor set on the ledger node with `uris`.
    ///
    /// When `preserve_static` is false (the default everywhere in this
    /// system), static neighbors are torn down and re-added along with
    /// everything else — matching the reference daemon's behavior even
    /// though it looks surprising. Pass `true` to keep static neighbors
    /// untouched across the swap.
    pub async fn update_neighbors(
        &self,
        uris: &[String],
        preserve_static: bool,
    ) -> Result<(), IriError> {
        let current = self.get_neighbors().await?;
        let current_uris: Vec<String> = current.into_iter().map(|n| n.address).collect();

        let to_remove: Vec<String> = if preserve_static {
            current_uris
                .into_iter()
                .filter(|u| !self.is_static_neighbor(u))
                .collect()
        } else {
            current_uris
        };

        if !to_remove.is_empty() {
            let req = RpcRequest {
                command: "removeNeighbors",
                uris: Some(&to_remove),
            };
            let _: AddRemoveResponse = self.call(&req).await?;
        }

        if !uris.is_empty() {
            self.add_neighbors(uris).await?;
        }
        Ok(())
    }

    pub async fn remove_all_neighbors(&self) -> Result<(), IriError> {
        let current = self.get_neighbors().await?;
        let uris: Vec<String> = current
            .into_iter()
            .map(|n| n.address)
            .filter(|u| !self.is_static_neighbor(u))
            .collect();
        if uris.is_empty() {
            return Ok(());
        }
        let req = RpcRequest {
            command: "removeNeighbors",
            uris: Some(&uris),
        };
        let _: AddRemoveResponse = self.call(&req).await?;
        Ok(())
    }

    pub fn register_static(&self, uri_or_address: &str) {
        self.static_neighbors.write().insert(static_key(uri_or_address));
    }

    pub fn is_static_neighbor(&self, uri_or_address: &str) -> bool {
        self.static_neighbors.read().contains(&static_key(uri_or_address))
    }

    /// Poll `getNeighbors` until the ledger node responds, recording every
    /// reported neighbor (TCP or UDP) as static. Intended to run once at
    /// startup; the caller drives the recurring health tick separately.
    pub async fn start(self: &Arc<Self>) -> Result<(), IriError> {
        loop {
            match self.get_neighbors().await {
                Ok(neighbors) => {
                    for n in &neighbors {
                        self.register_static(&n.address);
                    }
                    self.healthy.store(true, Ordering::Release);
                    tracing::info!("IRI client connected to ledger node at {}", self.base_url);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("getNeighbors poll failed, retrying: {e}");
                    tokio::time::sleep(POLL_RETRY).await;
                }
            }
        }
    }

    pub fn health_tick_interval() -> Duration {
        HEALTH_TICK
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// One health-ticker probe: re-checks `getNeighbors`, flips `healthy`
    /// accordingly, and returns true iff this call just transitioned health
    /// from false to true (the caller schedules an epoch-reshuffle on that
    /// transition, never on a steady-state success or failure).
    pub async fn health_tick(&self) -> bool {
        match self.get_neighbors().await {
            Ok(_) => !self.healthy.swap(true, Ordering::AcqRel),
            Err(e) => {
                tracing::warn!("health tick failed: {e}");
                self.healthy.store(false, Ordering::Release);
                false
            }
        }
    }
}
