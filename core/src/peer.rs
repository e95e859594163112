// Peer — a single known neighbor candidate.
//
// Peer carries its own identity plus a handle back into the PeerList slab
// that owns it. It never holds a reference or closure into the list
// directly — PeerList is the only thing that persists or reshuffles
// state, Peer just describes one record.

use serde::{Deserialize, Serialize};

/// Index into `PeerList`'s internal slab. Stable for the lifetime of the
/// record; never reused while the record is alive.
pub type PeerHandle = u64;

/// Upper bound on `Peer::weight`. Stored and sampling weights are both
/// clamped to this range.
pub const MAX_WEIGHT: f64 = 4_000_000.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    pub id: PeerHandle,
    pub hostname: Option<String>,
    pub ip: String,
    pub port: u16,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,

    /// Stored weight, independent of the live master/normal weight
    /// function PeerList applies at sample time.
    pub weight: f64,
    pub is_trusted: bool,

    pub date_created: u64,
    pub date_last_connected: Option<u64>,
    pub connected: bool,
    /// Number of connection attempts since the last success.
    pub tried: u32,
}

/// Fields a caller may update on an existing record. Anything left `None`
/// is left untouched.
#[derive(Debug, Default, Clone)]
pub struct PeerUpdate {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub weight: Option<f64>,
    pub connected: Option<bool>,
    pub date_last_connected: Option<u64>,
    pub tried: Option<u32>,
}

impl Peer {
    pub fn new(id: PeerHandle, ip: String, port: u16, now: u64) -> Self {
        Self {
            id,
            hostname: None,
            ip,
            port,
            tcp_port: None,
            udp_port: None,
            weight: 1.0,
            is_trusted: false,
            date_created: now,
            date_last_connected: None,
            connected: false,
            tried: 0,
        }
    }

    /// Apply an in-place update. `persist` is a hint the caller (PeerList)
    /// uses to decide whether to flush the backing store after the
    /// mutation — Peer itself never touches storage.
    pub fn update(&mut self, new_data: PeerUpdate, _persist: bool) {
        if let Some(hostname) = new_data.hostname {
            self.hostname = Some(hostname);
        }
        if let Some(port) = new_data.port {
            self.port = port;
        }
        if let Some(tcp_port) = new_data.tcp_port {
            self.tcp_port = Some(tcp_port);
        }
        if let Some(udp_port) = new_data.udp_port {
            self.udp_port = Some(udp_port);
        }
        if let Some(weight) = new_data.weight {
            self.weight = weight.clamp(0.0, MAX_WEIGHT);
        }
        if let Some(connected) = new_data.connected {
            self.connected = connected;
            if connected {
                self.tried = 0;
            }
        }
        if let Some(ts) = new_data.date_last_connected {
            self.date_last_connected = Some(ts);
        }
        if let Some(tried) = new_data.tried {
            self.tried = tried;
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.is_trusted
    }

    pub fn get_udp_uri(&self) -> Option<String> {
        self.udp_port.map(|p| format!("udp://{}:{}", self.ip, p))
    }

    pub fn get_tcp_uri(&self) -> Option<String> {
        self.tcp_port.map(|p| format!("tcp://{}:{}", self.ip, p))
    }
}
