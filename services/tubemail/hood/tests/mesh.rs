//! End-to-end tests: real hoods talking over loopback TLS.

mod common;

use bytes::Bytes;
use common::{expect_event, wait_for_neighbours, Pki, LOCALHOST, WAIT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tubemail_hood::{
    start, DiscoveryContext, DiscoverySink, HoodError, HoodEvent, NeighQuery, PortCandidates,
    StaticPeer, StopHandle,
};
use tubemail_session::TlsIdentity;

#[tokio::test]
async fn test_two_hoods_converge_and_exchange_messages() {
    let pki = Pki::new("mesh ca");
    let (alice, bob) = (pki.issue("alice"), pki.issue("bob"));

    let (alice_hood, mut alice_events) = start(alice.config().build().unwrap()).await.unwrap();
    let (bob_hood, mut bob_events) = start(
        bob.config()
            .discovery(StaticPeer::new("127.0.0.1", alice_hood.port()))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(alice_hood.fingerprint(), bob_hood.fingerprint());

    wait_for_neighbours(&alice_hood, 1).await;
    wait_for_neighbours(&bob_hood, 1).await;
    assert_eq!(alice_hood.neighbours()[0].id(), bob_hood.id());
    assert_eq!(bob_hood.neighbours()[0].id(), alice_hood.id());
    assert_eq!(
        alice_hood.neighbours()[0].info().common_name.as_deref(),
        Some("bob")
    );

    match expect_event(&mut alice_events, |e| matches!(e, HoodEvent::FoundNeigh(_))).await {
        HoodEvent::FoundNeigh(neigh) => assert_eq!(neigh.id(), bob_hood.id()),
        _ => unreachable!(),
    }

    // Broadcast reaches the single neighbour
    let sent = bob_hood.send(Bytes::from_static(b"hi alice")).await.unwrap();
    assert_eq!(sent, vec![alice_hood.id()]);
    match expect_event(&mut alice_events, |e| matches!(e, HoodEvent::Message { .. })).await {
        HoodEvent::Message { neigh, payload } => {
            assert_eq!(neigh.id(), bob_hood.id());
            assert_eq!(payload, Bytes::from_static(b"hi alice"));
        }
        _ => unreachable!(),
    }

    // Direct send through the neighbour handle
    let to_bob = alice_hood
        .get_neigh(&NeighQuery::by_id(bob_hood.id()))
        .unwrap();
    to_bob.send(Bytes::from_static(b"hi bob")).await.unwrap();
    match expect_event(&mut bob_events, |e| matches!(e, HoodEvent::Message { .. })).await {
        HoodEvent::Message { payload, .. } => assert_eq!(payload, Bytes::from_static(b"hi bob")),
        _ => unreachable!(),
    }

    // Still exactly one connection each way after the dust settled
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alice_hood.neighbours().len(), 1);
    assert_eq!(bob_hood.neighbours().len(), 1);

    bob_hood.leave().await;
    alice_hood.leave().await;
}

#[tokio::test]
async fn test_get_neigh_by_id_or_address() {
    let pki = Pki::new("mesh ca");
    let (alice, bob) = (pki.issue("alice"), pki.issue("bob"));

    let (alice_hood, _alice_events) = start(alice.config().build().unwrap()).await.unwrap();
    let (bob_hood, _bob_events) = start(
        bob.config()
            .discovery(StaticPeer::new("localhost", alice_hood.port()))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    wait_for_neighbours(&alice_hood, 1).await;

    let by_id = alice_hood.get_neigh(&NeighQuery::by_id(bob_hood.id())).unwrap();
    let by_addr = alice_hood
        .get_neigh(&NeighQuery::by_addr(LOCALHOST, bob_hood.port()))
        .unwrap();
    assert_eq!(by_id, by_addr);
    assert_eq!(by_id.listen_port(), bob_hood.port());

    assert!(alice_hood
        .get_neigh(&NeighQuery::by_id(alice_hood.id()))
        .is_none());
    assert!(alice_hood
        .get_neigh(&NeighQuery::by_addr(LOCALHOST, 1))
        .is_none());

    bob_hood.leave().await;
    alice_hood.leave().await;
}

#[tokio::test]
async fn test_gossip_connects_everyone() {
    let pki = Pki::new("mesh ca");
    let (alice, bob, carol) = (pki.issue("alice"), pki.issue("bob"), pki.issue("carol"));

    let (alice_hood, _a) = start(alice.config().build().unwrap()).await.unwrap();
    let towards_alice = || StaticPeer::new("127.0.0.1", alice_hood.port());
    let (bob_hood, _b) = start(bob.config().discovery(towards_alice()).build().unwrap())
        .await
        .unwrap();
    let (carol_hood, _c) = start(carol.config().discovery(towards_alice()).build().unwrap())
        .await
        .unwrap();

    // Bob and carol only know alice; they meet through her gossip
    for hood in [&alice_hood, &bob_hood, &carol_hood] {
        wait_for_neighbours(hood, 2).await;
    }
    assert!(bob_hood
        .get_neigh(&NeighQuery::by_id(carol_hood.id()))
        .is_some());
    assert!(carol_hood
        .get_neigh(&NeighQuery::by_id(bob_hood.id()))
        .is_some());

    let sent = alice_hood.send(Bytes::from_static(b"all")).await.unwrap();
    assert_eq!(sent.len(), 2);

    for hood in [&alice_hood, &bob_hood, &carol_hood] {
        hood.leave().await;
    }
}

#[tokio::test]
async fn test_send_without_neighbours_is_a_no_op() {
    let pki = Pki::new("mesh ca");
    let (hood, _events) = start(pki.issue("alone").config().build().unwrap())
        .await
        .unwrap();

    let sent = hood.send(Bytes::from_static(b"anyone?")).await.unwrap();
    assert!(sent.is_empty());

    hood.leave().await;
    assert!(hood.is_closed());
    assert!(matches!(
        hood.send(Bytes::from_static(b"late")).await,
        Err(HoodError::Closed)
    ));
    // Leaving twice is harmless
    hood.leave().await;
}

#[tokio::test]
async fn test_unauthorized_peers_never_become_neighbours() {
    let pki = Pki::new("mesh ca");
    let rogue_pki = Pki::new("rogue ca");
    let (hood, mut events) = start(pki.issue("alice").config().build().unwrap())
        .await
        .unwrap();

    let rogue = rogue_pki.issue("mallory");
    let identity = TlsIdentity::new(
        rogue.key_pem.as_bytes(),
        rogue.cert_pem.as_bytes(),
        rogue.ca_pem.as_bytes(),
    )
    .unwrap();
    let tcp = TcpStream::connect((LOCALHOST, hood.port())).await.unwrap();
    assert!(identity.connect(tcp).await.is_err());

    // A socket that never speaks TLS is still torn down on leave
    let _silent = TcpStream::connect((LOCALHOST, hood.port())).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(hood.neighbours().is_empty());

    timeout(Duration::from_secs(3), hood.leave())
        .await
        .expect("leave destroys sockets still in the TLS handshake");
    while let Some(event) = events.recv().await {
        assert!(!matches!(event, HoodEvent::FoundNeigh(_)));
    }
}

#[tokio::test]
async fn test_leave_tears_everything_down() {
    let pki = Pki::new("mesh ca");
    let (alice, bob) = (pki.issue("alice"), pki.issue("bob"));

    let stopped = Arc::new(AtomicBool::new(false));
    let flag = stopped.clone();
    let plugin = move |_ctx: DiscoveryContext, _sink: DiscoverySink| {
        StopHandle::new(move || async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        })
    };

    let (alice_hood, mut alice_events) = start(alice.config().discovery(plugin).build().unwrap())
        .await
        .unwrap();
    let (bob_hood, mut bob_events) = start(
        bob.config()
            .discovery(StaticPeer::new("127.0.0.1", alice_hood.port()))
            .reconnect_interval(Duration::ZERO)
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    wait_for_neighbours(&alice_hood, 1).await;
    let port = alice_hood.port();

    timeout(WAIT, alice_hood.leave()).await.unwrap();
    assert!(stopped.load(Ordering::SeqCst));
    assert!(alice_hood.neighbours().is_empty());
    assert!(TcpStream::connect((LOCALHOST, port)).await.is_err());

    // Our side reported the loss, then the stream ended
    expect_event(&mut alice_events, |e| matches!(e, HoodEvent::LostNeigh(_))).await;
    while let Some(event) = timeout(WAIT, alice_events.recv()).await.unwrap() {
        assert!(!matches!(event, HoodEvent::FoundNeigh(_)));
    }

    // The other side saw a graceful loss
    match expect_event(&mut bob_events, |e| matches!(e, HoodEvent::LostNeigh(_))).await {
        HoodEvent::LostNeigh(neigh) => assert_eq!(neigh.id(), alice_hood.id()),
        _ => unreachable!(),
    }
    wait_for_neighbours(&bob_hood, 0).await;
    bob_hood.leave().await;
}

#[tokio::test]
async fn test_lost_neighbour_is_redialled() {
    let pki = Pki::new("mesh ca");
    let (alice, bob) = (pki.issue("alice"), pki.issue("bob"));

    let (alice_hood, _a) = start(alice.config().build().unwrap()).await.unwrap();
    let port = alice_hood.port();
    let (bob_hood, _b) = start(
        bob.config()
            .discovery(StaticPeer::new("127.0.0.1", port))
            .reconnect_interval(Duration::from_millis(100))
            .reconnect_timeout(Duration::from_secs(20))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    wait_for_neighbours(&bob_hood, 1).await;

    // Alice comes back on the same port with a fresh identity
    alice_hood.leave().await;
    wait_for_neighbours(&bob_hood, 0).await;
    let (again, _a2) = start(
        alice
            .config()
            .port(PortCandidates::single(port))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    assert_ne!(again.id(), alice_hood.id());

    wait_for_neighbours(&bob_hood, 1).await;
    assert_eq!(bob_hood.neighbours()[0].id(), again.id());

    bob_hood.leave().await;
    again.leave().await;
}

#[tokio::test]
async fn test_taken_ports_are_skipped() {
    let pki = Pki::new("mesh ca");
    let peer = pki.issue("alice");

    let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let taken_port = taken.local_addr().unwrap().port();

    let (hood, _events) = start(
        peer.config()
            .port(PortCandidates::list(vec![taken_port, 0]))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    assert_ne!(hood.port(), taken_port);
    hood.leave().await;

    let err = start(peer.config().port(taken_port).build().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, HoodError::ListeningFailed));
    assert_eq!(err.to_string(), "listening failed");
}
