// Store module — pluggable persistence for PeerList records.

pub mod backend;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
