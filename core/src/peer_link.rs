// PeerLink — a single point-to-point socket to a neighbor, carrying hello
// and gossip exchange plus heartbeat liveness.
//
// Wire framing is length-prefixed bincode with a hard size cap, the same
// size-cap-then-reject discipline the message codec elsewhere in this
// pack uses (encode/reject-oversized rather than trust the peer).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::peer::PeerHandle;
use crate::NelsonError;

/// Caps a single encoded frame, including the length prefix. A gossip
/// sample of a few dozen peers comfortably fits; anything larger is
/// rejected rather than buffered.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPeer {
    pub ip: String,
    pub port: u16,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub is_trusted: bool,
}

/// A node's own advertised identity, carried in its outbound hello so the
/// receiving side can register it as a proper peer (not just the ephemeral
/// TCP source address the connection arrived from).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfIdentity {
    pub hostname: Option<String>,
    pub port: u16,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub is_trusted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Hello {
        personality: String,
        identity: SelfIdentity,
        gossip: Vec<GossipPeer>,
    },
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Dialing,
    Open,
    Closed,
}

pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, NelsonError> {
    let body = bincode::serialize(msg).map_err(|e| NelsonError::Link(e.to_string()))?;
    if body.len() + LENGTH_PREFIX_BYTES > MAX_FRAME_SIZE {
        return Err(NelsonError::Link("encoded frame exceeds size cap".into()));
    }
    let mut framed = Vec::with_capacity(body.len() + LENGTH_PREFIX_BYTES);
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

pub fn decode_frame(body: &[u8]) -> Result<WireMessage, NelsonError> {
    bincode::deserialize(body).map_err(|e| NelsonError::Link(e.to_string()))
}

async fn write_message(stream: &mut TcpStream, msg: &WireMessage) -> Result<(), NelsonError> {
    let framed = encode_frame(msg)?;
    stream
        .write_all(&framed)
        .await
        .map_err(|e| NelsonError::Link(e.to_string()))
}

async fn read_message(stream: &mut TcpStream, deadline: Duration) -> Result<WireMessage, NelsonError> {
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(deadline, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| NelsonError::Link("read timed out".into()))?
        .map_err(|e| NelsonError::Link(e.to_string()))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len + LENGTH_PREFIX_BYTES > MAX_FRAME_SIZE {
        return Err(NelsonError::Link("incoming frame exceeds size cap".into()));
    }

    let mut body = vec![0u8; len];
    tokio::time::timeout(deadline, stream.read_exact(&mut body))
        .await
        .map_err(|_| NelsonError::Link("read timed out".into()))?
        .map_err(|e| NelsonError::Link(e.to_string()))?;

    decode_frame(&body)
}

/// A single live link to a neighbor. Owned by `Node`'s live-link table;
/// `peer_id` is the handle into `PeerList` this link corresponds to.
pub struct PeerLink {
    pub peer_id: PeerHandle,
    pub is_static: bool,
    stream: tokio::sync::Mutex<TcpStream>,
    state: std::sync::atomic::AtomicU8,
    missed_heartbeats: AtomicU32,
}

const STATE_DIALING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

const MAX_MISSED_HEARTBEATS: u32 = 3;

impl PeerLink {
    /// Dial a neighbor, perform the hello exchange, and transition
    /// straight to `Open` on success.
    pub async fn dial(
        peer_id: PeerHandle,
        addr: &str,
        is_static: bool,
        personality: String,
        identity: SelfIdentity,
        gossip: Vec<GossipPeer>,
        beat_interval: Duration,
    ) -> Result<Self, NelsonError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NelsonError::Link(e.to_string()))?;

        write_message(
            &mut stream,
            &WireMessage::Hello {
                personality,
                identity,
                gossip,
            },
        )
        .await?;

        let _ = read_message(&mut stream, beat_interval * 3).await?;

        Ok(Self {
            peer_id,
            is_static,
            stream: tokio::sync::Mutex::new(stream),
            state: std::sync::atomic::AtomicU8::new(STATE_OPEN),
            missed_heartbeats: AtomicU32::new(0),
        })
    }

    /// Accept an inbound connection already past the TCP handshake,
    /// completing the hello exchange from the listening side.
    pub async fn accept(
        peer_id: PeerHandle,
        mut stream: TcpStream,
        is_static: bool,
        personality: String,
        identity: SelfIdentity,
        gossip: Vec<GossipPeer>,
        beat_interval: Duration,
    ) -> Result<(Self, WireMessage), NelsonError> {
        let hello = read_message(&mut stream, beat_interval * 3).await?;
        write_message(
            &mut stream,
            &WireMessage::Hello {
                personality,
                identity,
                gossip,
            },
        )
        .await?;

        Ok((
            Self {
                peer_id,
                is_static,
                stream: tokio::sync::Mutex::new(stream),
                state: std::sync::atomic::AtomicU8::new(STATE_OPEN),
                missed_heartbeats: AtomicU32::new(0),
            },
            hello,
        ))
    }

    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::Acquire) {
            STATE_DIALING => LinkState::Dialing,
            STATE_OPEN => LinkState::Open,
            _ => LinkState::Closed,
        }
    }

    pub fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Send a heartbeat and wait for the peer's reply, bumping or
    /// resetting the missed-heartbeat counter. Closes the link once three
    /// consecutive heartbeats have gone unanswered.
    pub async fn beat(&self, deadline: Duration) -> Result<(), NelsonError> {
        if self.state() != LinkState::Open {
            return Err(NelsonError::Link("link is not open".into()));
        }

        let mut stream = self.stream.lock().await;
        if write_message(&mut stream, &WireMessage::Heartbeat)
            .await
            .is_err()
            || read_message(&mut stream, deadline).await.is_err()
        {
            let missed = self.missed_heartbeats.fetch_add(1, Ordering::AcqRel) + 1;
            if missed >= MAX_MISSED_HEARTBEATS {
                self.close();
                return Err(NelsonError::Link(format!(
                    "link closed after {missed} missed heartbeats"
                )));
            }
            return Ok(());
        }

        self.missed_heartbeats.store(0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity(port: u16) -> SelfIdentity {
        SelfIdentity {
            hostname: None,
            port,
            tcp_port: Some(15600),
            udp_port: Some(14600),
            is_trusted: false,
        }
    }

    #[test]
    fn frame_roundtrip() {
        let msg = WireMessage::Hello {
            personality: "abcd1234".into(),
            identity: test_identity(14600),
            gossip: vec![GossipPeer {
                ip: "203.0.113.1".into(),
                port: 14600,
                tcp_port: Some(15600),
                udp_port: Some(14600),
                is_trusted: false,
            }],
        };
        let framed = encode_frame(&msg).unwrap();
        let len = u32::from_be_bytes(framed[0..4].try_into().unwrap()) as usize;
        let decoded = decode_frame(&framed[4..4 + len]).unwrap();
        match decoded {
            WireMessage::Hello { personality, gossip, .. } => {
                assert_eq!(personality, "abcd1234");
                assert_eq!(gossip.len(), 1);
            }
            _ => panic!("expected Hello"),
        }
    }

    #[test]
    fn oversized_frame_rejected() {
        let huge_gossip = (0..5000)
            .map(|i| GossipPeer {
                ip: format!("203.0.113.{}", i % 255),
                port: 14600,
                tcp_port: Some(15600),
                udp_port: Some(14600),
                is_trusted: false,
            })
            .collect();
        let msg = WireMessage::Hello {
            personality: "abcd1234".into(),
            identity: test_identity(14600),
            gossip: huge_gossip,
        };
        assert!(encode_frame(&msg).is_err());
    }

    #[tokio::test]
    async fn dial_and_accept_complete_hello_exchange() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            PeerLink::accept(
                2,
                stream,
                false,
                "serverpersonality".into(),
                test_identity(18600),
                vec![],
                Duration::from_millis(200),
            )
            .await
            .unwrap()
        });

        let client = PeerLink::dial(
            1,
            &addr.to_string(),
            false,
            "clientpersonality".into(),
            test_identity(14600),
            vec![GossipPeer {
                ip: "203.0.113.1".into(),
                port: 14600,
                tcp_port: Some(15600),
                udp_port: Some(14600),
                is_trusted: false,
            }],
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        let (server_link, hello) = server.await.unwrap();
        assert_eq!(client.state(), LinkState::Open);
        assert_eq!(server_link.state(), LinkState::Open);
        match hello {
            WireMessage::Hello { personality, gossip, identity } => {
                assert_eq!(personality, "clientpersonality");
                assert_eq!(gossip.len(), 1);
                assert_eq!(identity.port, 14600);
            }
            _ => panic!("expected Hello"),
        }
    }
}
