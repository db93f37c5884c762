//! Integration tests for the Backend public API.
//!
//! Several backends share one in-process network and replication engine, so
//! these tests exercise the full path: key derivation, rendezvous, token
//! issuance, the access actor and replication between peers.

use std::sync::Arc;
use std::time::Duration;

use capsync::memory::{MemoryEngine, MemoryNetwork, MemoryNode};
use capsync::{
    AccessError, AccessLevel, Backend, BackendEvent, BackendOptions, CAN_READ, CAN_WRITE,
    Capabilities, PeerId, PeerState, SecretKind, decode_token, encode_token, generate_secret,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Peer {
    backend: Backend,
    node: Arc<MemoryNode>,
    events: mpsc::Receiver<BackendEvent>,
}

impl Peer {
    fn id(&self) -> PeerId {
        PeerId::from(self.node.identity())
    }
}

async fn start_peer(
    network: &MemoryNetwork,
    engine: &MemoryEngine,
    read: &str,
    write: Option<&str>,
) -> Peer {
    let node = Arc::new(network.node());
    let mut options = BackendOptions::new("shared-doc", read);
    if let Some(write) = write {
        options = options.with_write_key(write);
    }
    let backend = Backend::new(options, node.clone(), node.clone(), Arc::new(engine.clone()));
    let events = backend.events().await.expect("events");
    backend.start().await.expect("start failed");
    Peer { backend, node, events }
}

/// Poll `peer`'s local view until `peer_id` holds `expected`.
async fn wait_for_capabilities(peer: &Peer, peer_id: &PeerId, expected: Option<Capabilities>) {
    let access = peer.backend.access().expect("not running");
    timeout(TEST_TIMEOUT, async {
        loop {
            if access.capabilities(peer_id.clone()).await.unwrap() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("capabilities never converged");
}

/// Receive events until `wanted` shows up.
async fn wait_for_event(events: &mut mpsc::Receiver<BackendEvent>, wanted: BackendEvent) {
    timeout(TEST_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if event == wanted {
                return;
            }
        }
        panic!("event stream closed before {:?}", wanted);
    })
    .await
    .expect("event never arrived");
}

#[tokio::test]
async fn grant_and_revoke_replicate_to_every_reader() {
    let network = MemoryNetwork::new();
    let engine = MemoryEngine::new();
    let read = generate_secret();
    let write = generate_secret();

    let a = start_peer(&network, &engine, &read, Some(&write)).await;
    let b = start_peer(&network, &engine, &read, None).await;
    let c = start_peer(&network, &engine, &read, None).await;
    let doc = engine.document("shared-doc");

    let admin = a.backend.access().unwrap();
    admin
        .grant(b.id(), Capabilities::new().with(CAN_WRITE, true))
        .await
        .unwrap();

    assert_eq!(doc.snapshot(&b.id()), Some(Capabilities::new().with(CAN_WRITE, true)));
    wait_for_capabilities(&b, &b.id(), Some(Capabilities::new().with(CAN_WRITE, true))).await;
    wait_for_capabilities(&c, &b.id(), Some(Capabilities::new().with(CAN_WRITE, true))).await;

    admin.revoke(b.id()).await.unwrap();

    assert_eq!(doc.snapshot(&b.id()), None);
    wait_for_capabilities(&b, &b.id(), None).await;
    wait_for_capabilities(&c, &b.id(), None).await;
    let state = c.backend.access().unwrap().state(b.id()).await.unwrap();
    assert_eq!(state, PeerState::Revoked);
}

#[tokio::test]
async fn read_only_peer_is_forbidden_and_map_untouched() {
    let network = MemoryNetwork::new();
    let engine = MemoryEngine::new();
    let read = generate_secret();

    let a = start_peer(&network, &engine, &read, Some(&generate_secret())).await;
    let c = start_peer(&network, &engine, &read, None).await;
    let doc = engine.document("shared-doc");

    a.backend
        .access()
        .unwrap()
        .grant("x", Capabilities::new().with(CAN_READ, true))
        .await
        .unwrap();
    let before = doc.stats();

    let reader = c.backend.access().unwrap();
    assert!(!reader.can_administer());
    let err = reader
        .grant("x", Capabilities::new().with(CAN_READ, false))
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<AccessError>(), Some(&AccessError::Forbidden));
    let err = reader.revoke("x").await.unwrap_err();
    assert_eq!(err.downcast_ref::<AccessError>(), Some(&AccessError::Forbidden));

    assert_eq!(doc.stats(), before);
    assert_eq!(doc.snapshot(&PeerId::from("x")), Some(Capabilities::new().with(CAN_READ, true)));
}

#[tokio::test]
async fn peers_sharing_a_read_key_discover_each_other() {
    let network = MemoryNetwork::new();
    let engine = MemoryEngine::new();
    let read = generate_secret();

    let mut a = start_peer(&network, &engine, &read, None).await;
    let b = start_peer(&network, &engine, &read, None).await;
    let stranger = start_peer(&network, &engine, &generate_secret(), None).await;

    wait_for_event(&mut a.events, BackendEvent::PeerConnected(b.node.identity())).await;

    let pad = a.backend.pad_identifier().unwrap();
    assert_eq!(b.backend.pad_identifier(), Some(pad));
    assert_ne!(stranger.backend.pad_identifier(), Some(pad));
    assert_eq!(network.registered(&pad.to_hex()).len(), 2);
    assert_eq!(network.connection_count(&a.node.identity(), &stranger.node.identity()), 0);
}

#[tokio::test]
async fn unreachable_peer_reports_dial_failure() {
    let network = MemoryNetwork::new();
    let engine = MemoryEngine::new();
    let read = generate_secret();

    let mut a = start_peer(&network, &engine, &read, None).await;
    let ghost = Arc::new(network.node());
    network.set_unreachable(ghost.identity());
    let b = Backend::new(
        BackendOptions::new("shared-doc", read.clone()),
        ghost.clone(),
        ghost.clone(),
        Arc::new(engine.clone()),
    );
    b.start().await.unwrap();

    let event = timeout(TEST_TIMEOUT, async {
        loop {
            match a.events.recv().await {
                Some(BackendEvent::DialFailed(err)) => return err,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("no dial failure reported");

    assert!(matches!(event, AccessError::DialFailure { ref peer, .. } if *peer == ghost.identity().to_hex()));
    assert!(a.backend.is_running());
}

#[tokio::test]
async fn malformed_write_key_is_fatal() {
    let network = MemoryNetwork::new();
    let node = Arc::new(network.node());
    let backend = Backend::new(
        BackendOptions::new("doc", generate_secret()).with_write_key("too-short"),
        node.clone(),
        node.clone(),
        Arc::new(MemoryEngine::new()),
    );

    let err = backend.start().await.unwrap_err();
    match err.downcast_ref::<AccessError>() {
        Some(AccessError::MalformedKey { kind, .. }) => assert_eq!(*kind, SecretKind::Write),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(backend.token().is_none());
    assert!(!backend.is_running());
}

#[tokio::test]
async fn tokens_verify_against_shared_keys() {
    let network = MemoryNetwork::new();
    let engine = MemoryEngine::new();
    let read = generate_secret();
    let write = generate_secret();

    let a = start_peer(&network, &engine, &read, Some(&write)).await;
    let b = start_peer(&network, &engine, &read, None).await;
    let a_keys = a.backend.keys().unwrap();
    let b_keys = b.backend.keys().unwrap();

    let wire = encode_token(&a.backend.token().unwrap()).unwrap();
    let token = decode_token(&wire).unwrap();

    assert_eq!(token.verify(&a_keys, &a.node.identity()), Ok(AccessLevel::Write));
    // b cannot check the write proof without holding write authority itself
    assert_eq!(token.verify(&b_keys, &a.node.identity()), Ok(AccessLevel::Read));
    assert!(token.verify(&b_keys, &b.node.identity()).is_err());

    let stranger = capsync::derive(&generate_secret(), None).unwrap();
    assert!(token.verify(&stranger, &a.node.identity()).is_err());
}

#[tokio::test]
async fn stopped_backend_ignores_remote_changes() {
    let network = MemoryNetwork::new();
    let engine = MemoryEngine::new();
    let read = generate_secret();

    let a = start_peer(&network, &engine, &read, Some(&generate_secret())).await;
    let mut b = start_peer(&network, &engine, &read, None).await;
    let reader = b.backend.access().unwrap();

    b.backend.stop().await;
    b.backend.stop().await;
    wait_for_event(&mut b.events, BackendEvent::Stopped).await;

    a.backend
        .access()
        .unwrap()
        .grant("late", Capabilities::new().with(CAN_READ, true))
        .await
        .unwrap();

    assert!(reader.state("late").await.is_err());
    assert_eq!(engine.document("shared-doc").observer_count(), 1);
    while let Ok(event) = b.events.try_recv() {
        assert_ne!(event, BackendEvent::Stopped, "stopped emitted twice");
    }
}

#[tokio::test]
async fn restarted_backend_rediscovers_its_peers() {
    let network = MemoryNetwork::new();
    let engine = MemoryEngine::new();
    let read = generate_secret();

    let mut a = start_peer(&network, &engine, &read, None).await;
    let b = start_peer(&network, &engine, &read, None).await;
    let pad = a.backend.pad_identifier().unwrap();
    wait_for_event(&mut a.events, BackendEvent::PeerConnected(b.node.identity())).await;

    a.backend.stop().await;
    wait_for_event(&mut a.events, BackendEvent::Stopped).await;
    assert_eq!(network.registered(&pad.to_hex()), vec![b.node.identity()]);

    a.backend.start().await.unwrap();
    wait_for_event(&mut a.events, BackendEvent::Started).await;
    wait_for_event(&mut a.events, BackendEvent::PeerConnected(b.node.identity())).await;

    assert_eq!(network.connection_count(&a.node.identity(), &b.node.identity()), 2);
    assert_eq!(network.registered(&pad.to_hex()).len(), 2);
}

#[tokio::test]
async fn concurrent_admins_converge_on_the_replicated_record() {
    let network = MemoryNetwork::new();
    let engine = MemoryEngine::new();
    let read = generate_secret();
    let write = generate_secret();

    let a = start_peer(&network, &engine, &read, Some(&write)).await;
    let b = start_peer(&network, &engine, &read, Some(&write)).await;
    let doc = engine.document("shared-doc");
    let target = PeerId::from("target");
    let (admin_a, admin_b) = (a.backend.access().unwrap(), b.backend.access().unwrap());

    let (ra, rb) = tokio::join!(
        admin_a.grant(target.clone(), Capabilities::new().with(CAN_READ, true).with(CAN_WRITE, true)),
        admin_b.grant(target.clone(), Capabilities::new().with(CAN_WRITE, false)),
    );
    ra.unwrap();
    rb.unwrap();

    let merged = doc.snapshot(&target);
    assert_eq!(merged.as_ref().and_then(|c| c.get(CAN_READ)), Some(true));
    assert!(merged.as_ref().and_then(|c| c.get(CAN_WRITE)).is_some());
    wait_for_capabilities(&a, &target, merged.clone()).await;
    wait_for_capabilities(&b, &target, merged).await;

    let (ra, rb) = tokio::join!(
        admin_a.revoke(target.clone()),
        admin_b.grant(target.clone(), Capabilities::new().with(CAN_READ, true)),
    );
    ra.unwrap();
    rb.unwrap();

    // either the revoke or the regrant lands last; both views follow the map
    let settled = doc.snapshot(&target);
    wait_for_capabilities(&a, &target, settled.clone()).await;
    wait_for_capabilities(&b, &target, settled).await;
}
