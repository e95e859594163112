// Node — composes PeerList, IriClient, and the live-link table behind a
// single lock, enforcing the system's global invariants.
//
// Grounded on the concurrency idiom of owning shared mutable state behind
// one `parking_lot::Mutex` rather than scattering locks per field.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::heart::{HeartTicks, TickFuture};
use crate::iri_client::IriClient;
use crate::peer::PeerHandle;
use crate::peer_link::{GossipPeer, LinkState, PeerLink, SelfIdentity};
use crate::peer_list::PeerList;
use crate::NelsonError;

struct LiveLinks {
    /// At most one OPEN link per peer identity. Closed links are dropped
    /// from the table the beat after they're noticed, not left to linger.
    links: HashMap<PeerHandle, Arc<PeerLink>>,
}

pub struct Node {
    peer_list: Arc<PeerList>,
    iri_client: Arc<IriClient>,
    links: Mutex<LiveLinks>,
    /// Doubles as the hello-message gossip sample size and the target
    /// count of concurrently open links this node tries to maintain.
    gossip_size: usize,
    preserve_static_on_reshuffle: bool,
    beat_interval: Duration,
    personality: Mutex<String>,
    identity: SelfIdentity,
}

impl Node {
    pub fn new(
        peer_list: Arc<PeerList>,
        iri_client: Arc<IriClient>,
        gossip_size: usize,
        beat_interval: Duration,
        personality: String,
        identity: SelfIdentity,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_list,
            iri_client,
            links: Mutex::new(LiveLinks {
                links: HashMap::new(),
            }),
            gossip_size,
            // Open Question resolution: update_neighbors defaults to
            // tearing down static neighbors along with everything else.
            preserve_static_on_reshuffle: false,
            beat_interval,
            personality: Mutex::new(personality),
            identity,
        })
    }

    /// Register a freshly-opened link, closing and replacing any existing
    /// open link for the same peer — the invariant is "at most one open
    /// link per identity", not "first link wins".
    pub fn register_link(&self, link: Arc<PeerLink>) {
        let mut guard = self.links.lock();
        if let Some(existing) = guard.links.insert(link.peer_id, link) {
            if existing.state() == LinkState::Open {
                existing.close();
            }
        }
    }

    pub fn open_link_count(&self) -> usize {
        self.links
            .lock()
            .links
            .values()
            .filter(|l| l.state() == LinkState::Open)
            .count()
    }

    /// The set this node should be advertising to the ledger node: every
    /// currently-open link that isn't static (statics are managed
    /// separately and never touched by the reshuffle). URIs are UDP —
    /// locally-originated add/remove requests always use the UDP port.
    fn advertised_uris(&self) -> Vec<String> {
        let guard = self.links.lock();
        guard
            .links
            .values()
            .filter(|l| l.state() == LinkState::Open && !l.is_static)
            .filter_map(|l| self.peer_list.get(l.peer_id))
            .filter_map(|p| p.get_udp_uri())
            .collect()
    }

    /// Peer records currently backing an OPEN link, the "connected peers"
    /// surfaced to the status API.
    pub fn open_peers(&self) -> Vec<crate::peer::Peer> {
        let guard = self.links.lock();
        guard
            .links
            .values()
            .filter(|l| l.state() == LinkState::Open)
            .filter_map(|l| self.peer_list.get(l.peer_id))
            .collect()
    }

    /// Drop any link the beat finds closed, so a replacement dial can be
    /// attempted on the very next beat rather than waiting a full cycle.
    async fn reap_closed_links(&self) {
        let closed: Vec<PeerHandle> = {
            let guard = self.links.lock();
            guard
                .links
                .iter()
                .filter(|(_, l)| l.state() == LinkState::Closed)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &closed {
            self.links.lock().links.remove(id);
            if let Err(e) = self.peer_list.mark_failed(*id) {
                tracing::warn!("failed to mark peer {id} as failed: {e}");
            }
        }
        if !closed.is_empty() {
            tracing::debug!("reaped {} closed link(s)", closed.len());
        }
    }

    /// Heartbeat every open link; a link that trips its own missed-beat
    /// limit closes itself, and is reaped on this same pass.
    async fn beat_open_links(&self, deadline: std::time::Duration) {
        let links: Vec<Arc<PeerLink>> = self.links.lock().links.values().cloned().collect();
        for link in links {
            if link.state() == LinkState::Open {
                if let Err(e) = link.beat(deadline).await {
                    tracing::warn!("heartbeat failed for peer {}: {e}", link.peer_id);
                }
            }
        }
    }

    /// Push the current open-link set (P5: OPEN links minus static) to the
    /// ledger node as its neighbor list.
    async fn sync_ledger_neighbors(&self) -> Result<(), NelsonError> {
        let uris = self.advertised_uris();
        self.iri_client
            .update_neighbors(&uris, self.preserve_static_on_reshuffle)
            .await?;
        tracing::info!("advertised {} neighbor(s) to the ledger node", uris.len());
        Ok(())
    }

    pub fn gossip_sample(&self) -> Vec<GossipPeer> {
        self.peer_list
            .get_weighted(self.gossip_size, &[])
            .into_iter()
            .map(|w| GossipPeer {
                ip: w.peer.ip,
                port: w.peer.port,
                tcp_port: w.peer.tcp_port,
                udp_port: w.peer.udp_port,
                is_trusted: w.peer.is_trusted,
            })
            .collect()
    }

    /// Cycle tick: close the worst-performing (lowest-weight) fraction of
    /// currently open, non-static links. Replacements are opened by the
    /// following `dial_replacement_links` call, not here.
    async fn partial_reshuffle(&self) {
        const CLOSE_FRACTION: f64 = 0.25;

        let open: Vec<Arc<PeerLink>> = {
            let guard = self.links.lock();
            guard
                .links
                .values()
                .filter(|l| l.state() == LinkState::Open && !l.is_static)
                .cloned()
                .collect()
        };
        if open.is_empty() {
            return;
        }

        let mut scored: Vec<(Arc<PeerLink>, f64)> = open
            .into_iter()
            .map(|link| {
                let weight = self
                    .peer_list
                    .get(link.peer_id)
                    .map(|p| p.weight)
                    .unwrap_or(0.0);
                (link, weight)
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        let close_count = ((scored.len() as f64) * CLOSE_FRACTION).ceil() as usize;
        for (link, _) in scored.into_iter().take(close_count) {
            link.close();
        }
    }

    /// Epoch tick: close every non-static open link so the node rebuilds
    /// its working set from scratch via `dial_replacement_links`.
    async fn full_reshuffle(&self) {
        let open: Vec<Arc<PeerLink>> = {
            let guard = self.links.lock();
            guard
                .links
                .values()
                .filter(|l| l.state() == LinkState::Open && !l.is_static)
                .cloned()
                .collect()
        };
        for link in open {
            link.close();
        }
    }

    /// Dial enough fresh peers to bring the open-link count back up to
    /// `gossip_size`, so a link closed this beat has its replacement
    /// dialed on this same beat rather than waiting for the next cycle.
    async fn dial_replacement_links(&self) {
        let open = self.open_link_count();
        if open >= self.gossip_size {
            return;
        }
        let deficit = self.gossip_size - open;
        let already_linked: Vec<PeerHandle> = self.links.lock().links.keys().copied().collect();
        let candidates = self.peer_list.get_weighted(deficit, &already_linked);
        let personality = self.personality.lock().clone();

        for weighted in candidates {
            let peer = weighted.peer;
            let addr = format!("{}:{}", peer.ip, peer.port);
            let is_static = self.iri_client.is_static_neighbor(&peer.ip);
            let gossip = self.gossip_sample();

            match PeerLink::dial(
                peer.id,
                &addr,
                is_static,
                personality.clone(),
                self.identity.clone(),
                gossip,
                self.beat_interval,
            )
            .await
            {
                Ok(link) => {
                    self.register_link(Arc::new(link));
                    if let Err(e) = self.peer_list.mark_connected(peer.id) {
                        tracing::warn!("failed to mark peer {} connected: {e}", peer.id);
                    }
                }
                Err(e) => {
                    tracing::debug!("dial to peer {} at {addr} failed: {e}", peer.id);
                    if let Err(e) = self.peer_list.mark_failed(peer.id) {
                        tracing::warn!("failed to mark peer {} failed: {e}", peer.id);
                    }
                }
            }
        }
    }

    /// Complete a hello exchange on an already-accepted inbound socket and
    /// fold the resulting link and its gossip payload into this node.
    pub async fn accept_inbound(&self, stream: tokio::net::TcpStream, peer_id: PeerHandle) {
        let personality = self.personality.lock().clone();
        let gossip = self.gossip_sample();
        let is_static = self
            .peer_list
            .get(peer_id)
            .map(|p| self.iri_client.is_static_neighbor(&p.ip))
            .unwrap_or(false);

        match PeerLink::accept(
            peer_id,
            stream,
            is_static,
            personality,
            self.identity.clone(),
            gossip,
            self.beat_interval,
        )
        .await
        {
            Ok((link, hello)) => {
                self.register_link(Arc::new(link));
                if let Err(e) = self.peer_list.mark_connected(peer_id) {
                    tracing::warn!("failed to mark peer {peer_id} connected: {e}");
                }
                self.absorb_hello(peer_id, hello);
            }
            Err(e) => {
                tracing::debug!("inbound hello exchange with peer {peer_id} failed: {e}");
            }
        }
    }

    /// Reconcile a peer's advertised identity and feed its gossip sample
    /// back into the peer list so newly-learned peers become candidates
    /// for future cycles.
    fn absorb_hello(&self, peer_id: PeerHandle, hello: crate::peer_link::WireMessage) {
        if let crate::peer_link::WireMessage::Hello { identity, gossip, .. } = hello {
            if let Err(e) = self.peer_list.update(
                peer_id,
                crate::peer::PeerUpdate {
                    hostname: identity.hostname,
                    port: Some(identity.port),
                    tcp_port: identity.tcp_port,
                    udp_port: identity.udp_port,
                    ..Default::default()
                },
                true,
            ) {
                tracing::debug!("failed to reconcile identity for peer {peer_id}: {e}");
            }
            for candidate in gossip {
                if let Err(e) = self.peer_list.add(
                    candidate.ip,
                    candidate.port,
                    candidate.tcp_port,
                    candidate.udp_port,
                    candidate.is_trusted,
                    1.0,
                ) {
                    tracing::debug!("failed to add gossiped peer: {e}");
                }
            }
        }
    }

    /// Triggered whenever ledger health flips from unhealthy to healthy.
    /// Forces an immediate epoch-style reshuffle instead of waiting for
    /// the next epoch tick, since the advertised set has just gone stale.
    pub async fn on_health_flip(&self) {
        self.full_reshuffle().await;
        self.reap_closed_links().await;
        self.dial_replacement_links().await;
        if let Err(e) = self.sync_ledger_neighbors().await {
            tracing::warn!("health-flip reshuffle failed: {e}");
        }
    }
}

impl HeartTicks for Node {
    fn on_beat(&self) -> TickFuture<'_> {
        Box::pin(async move {
            self.reap_closed_links().await;
            self.beat_open_links(self.beat_interval).await;
            self.dial_replacement_links().await;
        })
    }

    /// Partial reshuffle: close the worst-performing fraction of links,
    /// then dial replacements from a fresh weighted sample.
    fn on_cycle(&self) -> TickFuture<'_> {
        Box::pin(async move {
            self.reap_closed_links().await;
            self.partial_reshuffle().await;
            self.reap_closed_links().await;
            self.dial_replacement_links().await;
        })
    }

    /// Full reshuffle: close every non-static link, repopulate from
    /// scratch, then push the rebuilt set to the ledger node.
    fn on_epoch(&self, personality: String) -> TickFuture<'_> {
        Box::pin(async move {
            *self.personality.lock() = personality;
            self.full_reshuffle().await;
            self.reap_closed_links().await;
            self.dial_replacement_links().await;
            if let Err(e) = self.sync_ledger_neighbors().await {
                tracing::warn!("epoch reshuffle failed: {e}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use std::time::Duration;

    fn test_identity() -> SelfIdentity {
        SelfIdentity {
            hostname: None,
            port: 14600,
            tcp_port: Some(15600),
            udp_port: Some(14600),
            is_trusted: false,
        }
    }

    fn node() -> Arc<Node> {
        let storage = Arc::new(MemoryStorage::new());
        let peer_list = Arc::new(PeerList::new(storage, false, false));
        let iri_client =
            IriClient::new("http://127.0.0.1:14265".into(), Duration::from_secs(5)).unwrap();
        Node::new(
            peer_list,
            iri_client,
            6,
            Duration::from_secs(5),
            "testpersonality".into(),
            test_identity(),
        )
    }

    #[test]
    fn registering_a_link_closes_the_previous_open_one_for_same_peer() {
        let node = node();
        assert_eq!(node.open_link_count(), 0);
    }

    #[test]
    fn advertised_uris_empty_with_no_links() {
        let node = node();
        assert!(node.advertised_uris().is_empty());
    }

    #[tokio::test]
    async fn dial_replacement_links_fills_deficit_from_peer_list() {
        let storage = Arc::new(MemoryStorage::new());
        let peer_list = Arc::new(PeerList::new(storage, false, false));
        let iri_client =
            IriClient::new("http://127.0.0.1:14265".into(), Duration::from_secs(5)).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            PeerLink::accept(
                99,
                stream,
                false,
                "remotepersonality".into(),
                test_identity(),
                vec![],
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        });

        let peer_id = peer_list
            .add(addr.ip().to_string(), addr.port(), None, None, false, 1.0)
            .unwrap();

        let node = Node::new(
            peer_list.clone(),
            iri_client,
            1,
            Duration::from_millis(200),
            "p".into(),
            test_identity(),
        );
        node.dial_replacement_links().await;
        server.await.unwrap();

        assert_eq!(node.open_link_count(), 1);
        assert!(peer_list.get(peer_id).unwrap().connected);
    }

    async fn open_link_pair(
        node: &Node,
        peer_id: PeerHandle,
    ) -> Arc<PeerLink> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            PeerLink::accept(
                peer_id,
                stream,
                false,
                "remote".into(),
                test_identity(),
                vec![],
                Duration::from_millis(200),
            )
            .await
            .unwrap()
        });
        let client = PeerLink::dial(
            peer_id,
            &addr.to_string(),
            false,
            "local".into(),
            test_identity(),
            vec![],
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        server.await.unwrap();
        let link = Arc::new(client);
        node.register_link(link.clone());
        link
    }

    #[tokio::test]
    async fn partial_reshuffle_closes_lowest_weighted_link() {
        let storage = Arc::new(MemoryStorage::new());
        let peer_list = Arc::new(PeerList::new(storage, false, false));
        let iri_client =
            IriClient::new("http://127.0.0.1:14265".into(), Duration::from_secs(5)).unwrap();
        let node = Node::new(
            peer_list.clone(),
            iri_client,
            6,
            Duration::from_millis(200),
            "p".into(),
            test_identity(),
        );

        let mut lowest_id = 0;
        for i in 0..4u16 {
            let id = peer_list
                .add(format!("203.0.113.{i}"), 14600, None, None, false, (i + 1) as f64)
                .unwrap();
            if i == 0 {
                lowest_id = id;
            }
            open_link_pair(&node, id).await;
        }

        assert_eq!(node.open_link_count(), 4);
        node.partial_reshuffle().await;
        assert_eq!(node.open_link_count(), 3, "lowest-weighted quarter should close");
        assert_eq!(
            node.links.lock().links.get(&lowest_id).map(|l| l.state()),
            Some(LinkState::Closed)
        );
    }

    #[tokio::test]
    async fn full_reshuffle_closes_all_non_static_links() {
        let storage = Arc::new(MemoryStorage::new());
        let peer_list = Arc::new(PeerList::new(storage, false, false));
        let iri_client =
            IriClient::new("http://127.0.0.1:14265".into(), Duration::from_secs(5)).unwrap();
        let node = Node::new(
            peer_list.clone(),
            iri_client,
            6,
            Duration::from_millis(200),
            "p".into(),
            test_identity(),
        );

        for i in 0..3u16 {
            let id = peer_list
                .add(format!("203.0.113.{i}"), 14600, None, None, false, 1.0)
                .unwrap();
            open_link_pair(&node, id).await;
        }

        assert_eq!(node.open_link_count(), 3);
        node.full_reshuffle().await;
        assert_eq!(node.open_link_count(), 0);
    }

    #[test]
    fn advertised_uris_use_udp_scheme() {
        let node = node();
        assert!(node.advertised_uris().iter().all(|u| u.starts_with("udp://")));
    }
}
