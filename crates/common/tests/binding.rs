//! Integration tests for the binding handshake, run over loopback iroh
//! endpoints: the replica listens on its phrase-derived rendezvous
//! identity and the master dials it directly, so no discovery is involved.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use iroh::{Endpoint, NodeAddr};
use tokio_util::sync::CancellationToken;

use ::common::crypto::VaultKeys;
use ::common::db::PeerRecord;
use ::common::peer::bind::{self, BindError, BindListener};

// The rendezvous endpoint binds unspecified addresses; rewrite them to
// loopback so the master can dial without discovery.
fn dialable_addr(listener: &BindListener) -> NodeAddr {
    let direct: Vec<SocketAddr> = listener
        .bound_sockets()
        .into_iter()
        .filter(|addr| addr.is_ipv4())
        .map(|addr| {
            if addr.ip().is_unspecified() {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
            } else {
                addr
            }
        })
        .collect();
    NodeAddr::new(listener.node_id()).with_direct_addresses(direct)
}

#[tokio::test]
async fn handshake_binds_replica_to_master() {
    let phrase = bind::generate_phrase();
    let replica_keys = VaultKeys::replica();
    let (master_keys, _mnemonic) = VaultKeys::create().unwrap();

    let listener = BindListener::bind(&phrase).await.unwrap();
    let target = dialable_addr(&listener);

    let cancel = CancellationToken::new();
    let replica_id = replica_keys.peer_id();
    let accept = tokio::spawn(listener.accept(replica_id, cancel));

    let master_endpoint = Endpoint::builder().bind().await.unwrap();
    let master_id = master_endpoint.node_id();
    let peer_list = vec![PeerRecord::new(master_id.to_string(), Vec::new())];

    let record = bind::bind_peer_at(
        &master_endpoint,
        target,
        &phrase,
        &master_keys,
        peer_list,
        vec!["192.0.2.1:13000".into()],
    )
    .await
    .unwrap();

    // The master learned the replica's durable identity, not the
    // rendezvous one.
    assert_eq!(record.peer_id, replica_id.to_string());

    // And the replica installed the master's trust material.
    let outcome = accept.await.unwrap().unwrap();
    assert_eq!(
        outcome.master_pub.to_bytes(),
        master_keys.master_pub_bytes().unwrap()
    );
    assert_eq!(outcome.master_peer.peer_id, master_id.to_string());
    assert_eq!(outcome.master_peer.addrs, vec!["192.0.2.1:13000"]);
    assert_eq!(outcome.peers.len(), 1);

    master_endpoint.close().await;
}

#[tokio::test]
async fn wrong_phrase_is_rejected_and_listener_keeps_waiting() {
    let phrase = bind::generate_phrase();
    let replica_keys = VaultKeys::replica();
    let (master_keys, _mnemonic) = VaultKeys::create().unwrap();

    let listener = BindListener::bind(&phrase).await.unwrap();
    let target = dialable_addr(&listener);

    let cancel = CancellationToken::new();
    let replica_id = replica_keys.peer_id();
    let accept = tokio::spawn(listener.accept(replica_id, cancel));

    let master_endpoint = Endpoint::builder().bind().await.unwrap();

    // An attacker who found the rendezvous but lacks the phrase fails the
    // mutual challenge and learns nothing.
    let result = bind::bind_peer_at(
        &master_endpoint,
        target.clone(),
        "wrong words every single time",
        &master_keys,
        Vec::new(),
        Vec::new(),
    )
    .await;
    assert!(matches!(
        result,
        Err(BindError::PhraseMismatch) | Err(BindError::Transport(_)) | Err(BindError::InvalidMessage(_))
    ));

    // The listener survives the failed attempt; the real phrase still
    // binds.
    let record = bind::bind_peer_at(
        &master_endpoint,
        target,
        &phrase,
        &master_keys,
        Vec::new(),
        Vec::new(),
    )
    .await
    .unwrap();
    assert_eq!(record.peer_id, replica_id.to_string());

    let outcome = accept.await.unwrap().unwrap();
    assert_eq!(
        outcome.master_pub.to_bytes(),
        master_keys.master_pub_bytes().unwrap()
    );

    master_endpoint.close().await;
}

#[tokio::test]
async fn cancelled_session_stops_waiting() {
    let phrase = bind::generate_phrase();
    let replica_keys = VaultKeys::replica();

    let listener = BindListener::bind(&phrase).await.unwrap();
    let cancel = CancellationToken::new();
    let accept = tokio::spawn(listener.accept(replica_keys.peer_id(), cancel.clone()));

    cancel.cancel();
    let result = accept.await.unwrap();
    assert!(matches!(result, Err(BindError::Cancelled)));
}
