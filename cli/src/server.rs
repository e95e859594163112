// StatusServer — read-only warp HTTP surface: GET /, /peers, /peer-stats.
//
// Grounded on the landing-page server's warp filter composition style: a
// shared Arc<Ctx> threaded through `warp::any().map`, CORS wide open,
// `warp::reply::json` responses.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use nelson_core::heart::HeartSnapshot;
use nelson_core::{IriClient, NelsonConfig, Node, Peer, PeerList};
use serde::Serialize;
use warp::Filter;

pub struct StatusContext {
    pub peer_list: Arc<PeerList>,
    pub node: Arc<Node>,
    pub heart: Arc<nelson_core::Heart>,
    pub iri_client: Arc<IriClient>,
    pub config: NelsonConfig,
    pub start_time: Instant,
}

#[derive(Serialize)]
struct ConfigEcho {
    port: u16,
    tcp_port: Option<u16>,
    udp_port: Option<u16>,
    api_hostname: String,
    api_port: u16,
    master_mode: bool,
    multi_port: bool,
    gossip_size: usize,
}

impl From<&NelsonConfig> for ConfigEcho {
    fn from(c: &NelsonConfig) -> Self {
        Self {
            port: c.port,
            tcp_port: c.tcp_port,
            udp_port: c.udp_port,
            api_hostname: c.api_hostname.clone(),
            api_port: c.api_port,
            master_mode: c.master_mode,
            multi_port: c.multi_port,
            gossip_size: c.gossip_size,
        }
    }
}

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
    personality: String,
    uptime_seconds: u64,
    ready: bool,
    ledger_healthy: bool,
    total_peers: usize,
    connected_peers: Vec<PeerResponse>,
    config: ConfigEcho,
    heart: HeartSnapshot,
}

#[derive(Serialize)]
struct PeerResponse {
    id: u64,
    hostname: Option<String>,
    ip: String,
    port: u16,
    connected: bool,
    is_trusted: bool,
    tried: u32,
}

#[derive(Serialize, Default)]
struct BucketCounts {
    last_hour: usize,
    last_4h: usize,
    last_12h: usize,
    last_24h: usize,
    last_7d: usize,
}

#[derive(Serialize)]
struct PeerStatsResponse {
    total_known: usize,
    open_links: usize,
    first_seen: BucketCounts,
    last_active: BucketCounts,
}

impl From<Peer> for PeerResponse {
    fn from(p: Peer) -> Self {
        Self {
            id: p.id,
            hostname: p.hostname,
            ip: p.ip,
            port: p.port,
            connected: p.connected,
            is_trusted: p.is_trusted,
            tried: p.tried,
        }
    }
}

const HOUR: u64 = 3600;

fn count_within(peers: &[Peer], now: u64, window_secs: u64, ts: impl Fn(&Peer) -> Option<u64>) -> usize {
    peers
        .iter()
        .filter(|p| ts(p).map(|t| now.saturating_sub(t) <= window_secs).unwrap_or(false))
        .count()
}

fn bucket_counts(peers: &[Peer], now: u64, ts: impl Fn(&Peer) -> Option<u64> + Copy) -> BucketCounts {
    BucketCounts {
        last_hour: count_within(peers, now, HOUR, ts),
        last_4h: count_within(peers, now, 4 * HOUR, ts),
        last_12h: count_within(peers, now, 12 * HOUR, ts),
        last_24h: count_within(peers, now, 24 * HOUR, ts),
        last_7d: count_within(peers, now, 7 * 24 * HOUR, ts),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub async fn start(
    hostname: String,
    port: u16,
    ctx: Arc<StatusContext>,
) -> anyhow::Result<()> {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "OPTIONS"])
        .allow_headers(vec!["content-type"]);

    let ctx_filter = warp::any().map({
        let ctx = ctx.clone();
        move || ctx.clone()
    });

    let root_route = warp::path::end()
        .and(warp::get())
        .and(ctx_filter.clone())
        .map(|ctx: Arc<StatusContext>| {
            let ledger_healthy = ctx.iri_client.is_healthy();
            warp::reply::json(&RootResponse {
                name: "nelson",
                version: env!("CARGO_PKG_VERSION"),
                personality: ctx.heart.personality(),
                uptime_seconds: ctx.start_time.elapsed().as_secs(),
                ready: ledger_healthy,
                ledger_healthy,
                total_peers: ctx.peer_list.len(),
                connected_peers: ctx.node.open_peers().into_iter().map(PeerResponse::from).collect(),
                config: ConfigEcho::from(&ctx.config),
                heart: ctx.heart.snapshot(),
            })
        })
        .boxed();

    let peers_route = warp::path("peers")
        .and(warp::get())
        .and(ctx_filter.clone())
        .map(|ctx: Arc<StatusContext>| {
            let peers: Vec<PeerResponse> =
                ctx.peer_list.all().into_iter().map(PeerResponse::from).collect();
            warp::reply::json(&peers)
        })
        .boxed();

    let peer_stats_route = warp::path("peer-stats")
        .and(warp::get())
        .and(ctx_filter)
        .map(|ctx: Arc<StatusContext>| {
            let peers = ctx.peer_list.all();
            let now = now_secs();
            warp::reply::json(&PeerStatsResponse {
                total_known: peers.len(),
                open_links: ctx.node.open_link_count(),
                first_seen: bucket_counts(&peers, now, |p| Some(p.date_created)),
                last_active: bucket_counts(&peers, now, |p| p.date_last_connected),
            })
        })
        .boxed();

    let routes = root_route
        .or(peers_route)
        .or(peer_stats_route)
        .with(cors);

    let addr: std::net::IpAddr = hostname.parse().unwrap_or_else(|_| [0, 0, 0, 0].into());
    warp::serve(routes).run((addr, port)).await;
    Ok(())
}
