// PeerList — the persistent, weighted-sampling store of known peers.
//
// Grounded on the shape of a persistent map-of-records with per-entry
// backoff-like counters (tried/weight), re-specified against the address
// normalization and weighted-sampling rules this system needs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rand::Rng;

use crate::peer::{Peer, PeerHandle, PeerUpdate, MAX_WEIGHT};
use crate::store::StorageBackend;
use crate::NelsonError;

/// A peer drawn from [`PeerList::get_weighted`], paired with the ratio of
/// its sampling weight to the heaviest candidate in the pool it was drawn
/// from. Trusted peers always carry `ratio = 1.0`.
#[derive(Debug, Clone)]
pub struct WeightedPeer {
    pub peer: Peer,
    pub ratio: f64,
}

const PEER_KEY_PREFIX: &[u8] = b"peer:";

fn peer_key(id: PeerHandle) -> Vec<u8> {
    let mut key = PEER_KEY_PREFIX.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A peer to seed the list with on first run (e.g. `NEIGHBORS` config).
#[derive(Debug, Clone)]
pub struct PeerSeed {
    pub ip: String,
    pub port: u16,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub is_trusted: bool,
}

struct Inner {
    peers: HashMap<PeerHandle, Peer>,
    by_address: HashMap<String, PeerHandle>,
    next_id: PeerHandle,
}

pub struct PeerList {
    inner: RwLock<Inner>,
    storage: Arc<dyn StorageBackend>,
    /// When true, weight is computed from connection recency only (master
    /// mode); when false, weight grows with age and the stored weight.
    master_mode: bool,
    /// When true, the same hostname may carry multiple peers differentiated
    /// by port; when false (the default), a hostname dedups to one peer and
    /// a later `add` with different ports just updates that peer in place.
    multi_port: bool,
}

impl PeerList {
    pub fn new(storage: Arc<dyn StorageBackend>, master_mode: bool, multi_port: bool) -> Self {
        Self {
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
                by_address: HashMap::new(),
                next_id: 1,
            }),
            storage,
            master_mode,
            multi_port,
        }
    }

    /// The dedup key a peer's `(host, port)` lands on. Under `multiPort`
    /// the port differentiates two otherwise-identical hosts; otherwise a
    /// host collapses to a single entry regardless of port.
    fn dedup_key(&self, host: &str, port: u16) -> String {
        let cleaned = clean_address(host);
        if self.multi_port {
            format!("{cleaned}:{port}")
        } else {
            cleaned
        }
    }

    /// Load persisted peers from storage, seeding any `defaults` not
    /// already present by address.
    pub fn load(&self, defaults: &[PeerSeed]) -> Result<(), NelsonError> {
        let rows = self
            .storage
            .scan_prefix(PEER_KEY_PREFIX)
            .map_err(NelsonError::Storage)?;

        {
            let mut inner = self.inner.write();
            for (_, value) in rows {
                let peer: Peer =
                    serde_json::from_slice(&value).map_err(|e| NelsonError::Storage(e.to_string()))?;
                inner.next_id = inner.next_id.max(peer.id + 1);
                let key = self.dedup_key(peer.hostname.as_deref().unwrap_or(&peer.ip), peer.port);
                inner.by_address.insert(key, peer.id);
                inner.peers.insert(peer.id, peer);
            }
        }

        for seed in defaults {
            if self.find_by_address(&seed.ip, seed.port).is_none() {
                self.add(
                    seed.ip.clone(),
                    seed.port,
                    seed.tcp_port,
                    seed.udp_port,
                    seed.is_trusted,
                    1.0,
                )?;
            }
        }
        Ok(())
    }

    /// Look up an existing peer, then insert/update/merge per the normal
    /// dedup rule: a fresh address inserts a new record; a match with
    /// differing ports updates them in place (unless `multiPort` is set,
    /// in which case port is part of the identity and never collides
    /// here); a match with a higher supplied `weight` raises it. Otherwise
    /// the existing record is returned unchanged.
    pub fn add(
        &self,
        ip: String,
        port: u16,
        tcp_port: Option<u16>,
        udp_port: Option<u16>,
        is_trusted: bool,
        weight: f64,
    ) -> Result<PeerHandle, NelsonError> {
        let ip = clean_address(&ip);

        if let Some(existing_id) = self.find_by_address(&ip, port) {
            let mut changed = false;
            {
                let mut inner = self.inner.write();
                let peer = inner
                    .peers
                    .get_mut(&existing_id)
                    .ok_or(NelsonError::PeerNotFound)?;
                if !self.multi_port
                    && (peer.port != port || peer.tcp_port != tcp_port || peer.udp_port != udp_port)
                {
                    peer.port = port;
                    peer.tcp_port = tcp_port;
                    peer.udp_port = udp_port;
                    changed = true;
                }
                if weight > peer.weight {
                    peer.weight = weight.clamp(0.0, MAX_WEIGHT);
                    changed = true;
                }
            }
            if changed {
                self.persist(existing_id)?;
            }
            return Ok(existing_id);
        }

        let now = now_secs();
        let id = {
            let mut inner = self.inner.write();
            let id = inner.next_id;
            inner.next_id += 1;

            let mut peer = Peer::new(id, ip, port, now);
            peer.tcp_port = tcp_port;
            peer.udp_port = udp_port;
            peer.is_trusted = is_trusted;
            peer.weight = weight.clamp(0.0, MAX_WEIGHT);

            let key = self.dedup_key(&peer.ip, peer.port);
            inner.by_address.insert(key, id);
            inner.peers.insert(id, peer);
            id
        };
        self.persist(id)?;
        Ok(id)
    }

    pub fn find_by_address(&self, host: &str, port: u16) -> Option<PeerHandle> {
        let key = self.dedup_key(host, port);
        self.inner.read().by_address.get(&key).copied()
    }

    pub fn get(&self, handle: PeerHandle) -> Option<Peer> {
        self.inner.read().peers.get(&handle).cloned()
    }

    pub fn update(&self, handle: PeerHandle, new_data: PeerUpdate, persist: bool) -> Result<(), NelsonError> {
        {
            let mut inner = self.inner.write();
            let peer = inner
                .peers
                .get_mut(&handle)
                .ok_or(NelsonError::PeerNotFound)?;
            peer.update(new_data, persist);
        }
        if persist {
            self.persist(handle)?;
        }
        Ok(())
    }

    pub fn mark_connected(&self, handle: PeerHandle) -> Result<(), NelsonError> {
        self.update(
            handle,
            PeerUpdate {
                connected: Some(true),
                date_last_connected: Some(now_secs()),
                ..Default::default()
            },
            true,
        )
    }

    pub fn mark_failed(&self, handle: PeerHandle) -> Result<(), NelsonError> {
        let tried = self
            .get(handle)
            .map(|p| p.tried + 1)
            .ok_or(NelsonError::PeerNotFound)?;
        self.update(
            handle,
            PeerUpdate {
                connected: Some(false),
                tried: Some(tried),
                ..Default::default()
            },
            true,
        )
    }

    pub fn clear(&self) -> Result<(), NelsonError> {
        let ids: Vec<PeerHandle> = {
            let mut inner = self.inner.write();
            let ids: Vec<PeerHandle> = inner.peers.keys().copied().collect();
            inner.peers.clear();
            inner.by_address.clear();
            ids
        };
        for id in ids {
            self.storage
                .remove(&peer_key(id))
                .map_err(NelsonError::Storage)?;
        }
        self.storage.flush().map_err(NelsonError::Storage)
    }

    pub fn is_trusted(&self, host: &str, port: u16) -> bool {
        self.find_by_address(host, port)
            .and_then(|id| self.get(id))
            .map(|p| p.is_trusted())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Peer> {
        self.inner.read().peers.values().cloned().collect()
    }

    /// Weight a peer according to the current sampling mode.
    ///
    /// Master mode rewards recently-connected peers; normal mode grows a
    /// peer's pull with both its age and its stored weight, so long-lived
    /// peers with a higher trust score dominate samples over time.
    fn peer_weight(&self, peer: &Peer) -> f64 {
        let now = now_secs();
        if self.master_mode {
            let last = peer.date_last_connected.unwrap_or(peer.date_created);
            ((last.saturating_sub(peer.date_created)) as f64).max(1.0)
        } else {
            let age = (now.saturating_sub(peer.date_created)) as f64;
            (age * peer.weight).max(1.0)
        }
    }

    /// Draw `amount` distinct peers without replacement, weighted by
    /// [`peer_weight`]. Every handle in `exclude` is skipped entirely
    /// (e.g. peers already holding an open link, when picking replacements).
    /// `amount == 0` means "all of them" (the pool size).
    ///
    /// Samples against a parallel `(handle, weight)` vector and removes
    /// both the chosen index and its weight together on each draw, so a
    /// later `position()` never looks up a handle whose backing slot has
    /// already been spliced out from under it. Each result carries the
    /// ratio of its drawn weight to the heaviest candidate in the pool;
    /// trusted peers always carry ratio 1.0.
    pub fn get_weighted(&self, amount: usize, exclude: &[PeerHandle]) -> Vec<WeightedPeer> {
        let inner = self.inner.read();
        let mut candidates: Vec<(PeerHandle, f64)> = inner
            .peers
            .values()
            .filter(|p| !exclude.contains(&p.id))
            .map(|p| (p.id, self.peer_weight(p)))
            .collect();

        let weights_max = candidates
            .iter()
            .map(|(_, w)| *w)
            .fold(0.0_f64, f64::max)
            .max(1.0);

        let target = if amount == 0 { candidates.len() } else { amount };
        let mut chosen = Vec::with_capacity(target.min(candidates.len()));
        let mut rng = rand::thread_rng();

        while chosen.len() < target && !candidates.is_empty() {
            let total: f64 = candidates.iter().map(|(_, w)| w).sum();
            let mut pointer = rng.gen_range(0.0..total);
            let mut pick = candidates.len() - 1;
            for (idx, (_, w)) in candidates.iter().enumerate() {
                if pointer < *w {
                    pick = idx;
                    break;
                }
                pointer -= w;
            }
            let (handle, weight) = candidates.remove(pick);
            if let Some(peer) = inner.peers.get(&handle) {
                let ratio = if peer.is_trusted { 1.0 } else { weight / weights_max };
                chosen.push(WeightedPeer {
                    peer: peer.clone(),
                    ratio,
                });
            }
        }
        chosen
    }

    fn persist(&self, handle: PeerHandle) -> Result<(), NelsonError> {
        let peer = self
            .inner
            .read()
            .peers
            .get(&handle)
            .cloned()
            .ok_or(NelsonError::PeerNotFound)?;
        let bytes = serde_json::to_vec(&peer).map_err(|e| NelsonError::Storage(e.to_string()))?;
        self.storage
            .put(&peer_key(handle), &bytes)
            .map_err(NelsonError::Storage)?;
        self.storage.flush().map_err(NelsonError::Storage)
    }
}

/// Strip an IPv4-mapped IPv6 prefix and rewrite private/loopback literals
/// to `localhost`, so the same physical peer always normalizes to one
/// address key regardless of which interface reported it.
pub fn clean_address(address: &str) -> String {
    let stripped = address.strip_prefix("::ffff:").unwrap_or(address);

    let (host, rest) = match stripped.split_once(':') {
        Some((h, r)) => (h, Some(r)),
        None => (stripped, None),
    };

    let host = if is_private_literal(host) {
        "localhost"
    } else {
        host
    };

    match rest {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn is_private_literal(host: &str) -> bool {
    matches!(
        host,
        "127.0.0.1" | "0.0.0.0" | "::1"
    ) || host.starts_with("192.168.")
        || host.starts_with("10.")
        || host.starts_with("172.16.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn list() -> PeerList {
        PeerList::new(Arc::new(MemoryStorage::new()), false, false)
    }

    fn multi_port_list() -> PeerList {
        PeerList::new(Arc::new(MemoryStorage::new()), false, true)
    }

    #[test]
    fn clean_address_strips_mapped_v4_prefix() {
        assert_eq!(clean_address("::ffff:1.2.3.4:14600"), "1.2.3.4:14600");
    }

    #[test]
    fn clean_address_rewrites_private_literals() {
        assert_eq!(clean_address("127.0.0.1:14600"), "localhost:14600");
        assert_eq!(clean_address("192.168.1.5:14600"), "localhost:14600");
    }

    #[test]
    fn add_and_find_roundtrip() {
        let list = list();
        let id = list
            .add("203.0.113.5".into(), 14600, Some(15600), Some(14600), false, 1.0)
            .unwrap();
        let found = list.find_by_address("203.0.113.5", 14600).unwrap();
        assert_eq!(found, id);
    }

    #[test]
    fn second_add_of_same_host_updates_ports_and_raises_weight() {
        let list = list();
        let id = list
            .add("node-a.example".into(), 14600, Some(15600), Some(14600), false, 0.3)
            .unwrap();
        let id2 = list
            .add("node-a.example".into(), 15000, Some(16000), Some(15000), false, 0.7)
            .unwrap();
        assert_eq!(id, id2, "same host should dedup to one peer");

        let peer = list.get(id).unwrap();
        assert_eq!(peer.port, 15000);
        assert_eq!(peer.tcp_port, Some(16000));
        assert_eq!(peer.udp_port, Some(15000));
        assert_eq!(peer.weight, 0.7);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn lower_weight_on_second_add_does_not_lower_existing_weight() {
        let list = list();
        let id = list
            .add("node-a.example".into(), 14600, None, None, false, 0.7)
            .unwrap();
        list.add("node-a.example".into(), 14600, None, None, false, 0.3)
            .unwrap();
        assert_eq!(list.get(id).unwrap().weight, 0.7);
    }

    #[test]
    fn multi_port_keeps_same_host_distinct_ports_separate() {
        let list = multi_port_list();
        let a = list
            .add("node-a.example".into(), 14600, None, None, false, 1.0)
            .unwrap();
        let b = list
            .add("node-a.example".into(), 14601, None, None, false, 1.0)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn mark_connected_resets_tried() {
        let list = list();
        let id = list
            .add("203.0.113.5".into(), 14600, None, None, false, 1.0)
            .unwrap();
        list.mark_failed(id).unwrap();
        list.mark_failed(id).unwrap();
        assert_eq!(list.get(id).unwrap().tried, 2);
        list.mark_connected(id).unwrap();
        assert_eq!(list.get(id).unwrap().tried, 0);
        assert!(list.get(id).unwrap().connected);
    }

    #[test]
    fn get_weighted_never_returns_excluded_or_duplicates() {
        let list = list();
        let mut ids = Vec::new();
        for i in 0..10u16 {
            ids.push(
                list.add(format!("203.0.113.{i}"), 14600, None, None, false, 1.0)
                    .unwrap(),
            );
        }
        let exclude = ids[0];
        let sample = list.get_weighted(5, &[exclude]);
        assert_eq!(sample.len(), 5);
        let mut seen = std::collections::HashSet::new();
        for weighted in &sample {
            assert_ne!(weighted.peer.id, exclude);
            assert!(seen.insert(weighted.peer.id), "duplicate peer in weighted sample");
        }
    }

    #[test]
    fn get_weighted_caps_at_population_size() {
        let list = list();
        list.add("203.0.113.1".into(), 14600, None, None, false, 1.0)
            .unwrap();
        list.add("203.0.113.2".into(), 14600, None, None, false, 1.0)
            .unwrap();
        let sample = list.get_weighted(10, &[]);
        assert_eq!(sample.len(), 2);
    }

    #[test]
    fn get_weighted_zero_returns_all_peers() {
        let list = list();
        for i in 0..5u16 {
            list.add(format!("203.0.113.{i}"), 14600, None, None, false, 1.0)
                .unwrap();
        }
        let sample = list.get_weighted(0, &[]);
        assert_eq!(sample.len(), 5);
    }

    #[test]
    fn get_weighted_trusted_peers_carry_ratio_one() {
        let list = list();
        list.add("203.0.113.1".into(), 14600, None, None, true, 1.0)
            .unwrap();
        list.add("203.0.113.2".into(), 14600, None, None, false, 1.0)
            .unwrap();
        let sample = list.get_weighted(0, &[]);
        let trusted = sample.iter().find(|w| w.peer.is_trusted).unwrap();
        assert_eq!(trusted.ratio, 1.0);
    }

    #[test]
    fn load_seeds_defaults_once() {
        let storage = Arc::new(MemoryStorage::new());
        let seeds = vec![PeerSeed {
            ip: "203.0.113.9".into(),
            port: 14600,
            tcp_port: None,
            udp_port: None,
            is_trusted: true,
        }];

        let list = PeerList::new(storage.clone(), false, false);
        list.load(&seeds).unwrap();
        assert_eq!(list.len(), 1);

        let list2 = PeerList::new(storage, false, false);
        list2.load(&seeds).unwrap();
        assert_eq!(list2.len(), 1, "reload should not duplicate seeded peers");
    }

    #[test]
    fn is_trusted_reflects_seed_flag() {
        let list = list();
        list.add("203.0.113.9".into(), 14600, None, None, true, 1.0)
            .unwrap();
        assert!(list.is_trusted("203.0.113.9", 14600));
        assert!(!list.is_trusted("203.0.113.10", 14600));
    }
}
