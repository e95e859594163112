use std::sync::Arc;

use nelson_core::peer_list::{PeerList, PeerSeed};
use nelson_core::store::SledStorage;

#[test]
fn peer_list_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_string_lossy().to_string();

    let storage = Arc::new(SledStorage::open(&path).unwrap());
    let list = PeerList::new(storage, false, false);
    let seeds = vec![PeerSeed {
        ip: "203.0.113.5".into(),
        port: 14600,
        tcp_port: Some(15600),
        udp_port: Some(14600),
        is_trusted: true,
    }];
    list.load(&seeds).unwrap();
    let handle = list.find_by_address("203.0.113.5", 14600).unwrap();
    list.mark_connected(handle).unwrap();
    drop(list);

    let storage = Arc::new(SledStorage::open(&path).unwrap());
    let reloaded = PeerList::new(storage, false, false);
    reloaded.load(&[]).unwrap();

    assert_eq!(reloaded.len(), 1);
    let handle = reloaded.find_by_address("203.0.113.5", 14600).unwrap();
    let peer = reloaded.get(handle).unwrap();
    assert!(peer.connected);
    assert!(peer.is_trusted());
    assert_eq!(peer.date_last_connected.is_some(), true);
}
