// Nelson core — peer discovery and neighbor management for an IRI node.
//
// "Does the node always have enough healthy, diverse neighbors to stay
//  attached to the tangle?"

pub mod config;
pub mod heart;
pub mod iri_client;
pub mod node;
pub mod peer;
pub mod peer_link;
pub mod peer_list;
pub mod store;

pub use config::NelsonConfig;
pub use heart::Heart;
pub use iri_client::IriClient;
pub use node::Node;
pub use peer::{Peer, PeerHandle};
pub use peer_link::{LinkState, PeerLink, SelfIdentity};
pub use peer_list::{PeerList, WeightedPeer};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NelsonError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("peer not found")]
    PeerNotFound,
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),
    #[error("ledger RPC error: {0}")]
    Iri(#[from] IriError),
    #[error("link error: {0}")]
    Link(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error, Clone)]
pub enum IriError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected response: {0}")]
    Response(String),
    #[error("request timed out")]
    Timeout,
}
