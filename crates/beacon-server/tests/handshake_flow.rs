//! End-to-end handshake and installation flows over in-process channels.

mod common;

use beacon_server::{accept_connection, ClientInstaller};
use beacon_store::Store;
use beacon_types::{ClientCategory, ErrorCode, EventKind, RoleSet, UserKind};
use beacon_wire::events::EventMessage;
use beacon_wire::session::SessionMessage;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn installer(store: &Arc<beacon_store::MemoryStore>) -> ClientInstaller {
    let dyn_store: Arc<dyn Store> = store.clone();
    ClientInstaller::new(dyn_store, delivery_config(Duration::from_secs(300)))
}

#[tokio::test(flavor = "multi_thread")]
async fn open_handshake_install_and_sync() {
    let store = test_store();
    let site = test_site();
    let installer = installer(&store);

    let (mut peer, client) = connect_registered(
        &store,
        &site,
        &installer,
        "abc123",
        [1].into_iter().collect(),
        channel_config(Duration::from_secs(10)),
    )
    .await;

    // Installation binds the durable client id and starts the digest
    // challenge on the event module.
    assert_eq!(client.client_id(), 900);
    assert_eq!(client.user_kind(), UserKind::Contact);
    assert!(client.is_online());
    assert_eq!(site.client_count(), 1);

    match peer.recv_event().await {
        EventMessage::Sync { digest } => {
            assert!(digest.is_some(), "registered sync carries a digest")
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn version_mismatch_is_rejected_before_dispatch() {
    let store = test_store();
    let dyn_store: Arc<dyn Store> = store.clone();
    let (tx, mut rx) = mpsc::channel(8);
    let (channel, _established) =
        accept_connection(dyn_store, tx, channel_config(Duration::from_secs(10)));

    // A frame with a bogus version byte never reaches the session module.
    channel.dispatch(&[99, beacon_wire::MODULE_SESSION, 0x01]);

    let raw = rx.recv().await.expect("error frame");
    let (header, body) = beacon_wire::FrameHeader::parse(&raw).unwrap();
    match SessionMessage::decode(header.op, body).unwrap() {
        SessionMessage::Error { code } => {
            assert_eq!(code, ErrorCode::IncompatibleProtocolVersion)
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    assert!(channel.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn stateless_guest_connects_without_credentials() {
    let store = test_store();
    let site = test_site();
    let installer = installer(&store);
    let dyn_store: Arc<dyn Store> = store.clone();

    let (tx, rx) = mpsc::channel(64);
    let (channel, established) =
        accept_connection(dyn_store, tx, channel_config(Duration::from_secs(10)));
    let mut peer = Peer {
        channel: channel.clone(),
        rx,
    };

    peer.send(
        SessionMessage::Open {
            category: ClientCategory::StatelessGuest,
            client_key: "guest-key".to_string(),
        }
        .encode(),
    );
    assert!(matches!(
        peer.recv_session().await,
        SessionMessage::OpenOk2
    ));

    let established = established.await.expect("guest handshake establishes");
    let client = installer
        .install(&site, &channel, established, RoleSet::new())
        .expect("guest install");

    assert_eq!(client.user_kind(), UserKind::StatelessGuest);
    assert!(client.client_id() >= 1 << 32, "guest ids are ephemeral");

    // The guest flavor asks for the peer's list instead of offering a
    // digest.
    match peer.recv_event().await {
        EventMessage::Sync { digest } => assert!(digest.is_none()),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_displaces_the_previous_session() {
    let store = test_store();
    let site = test_site();
    let installer = installer(&store);

    let (mut first_peer, first_client) = connect_registered(
        &store,
        &site,
        &installer,
        "abc123",
        [1].into_iter().collect(),
        channel_config(Duration::from_secs(10)),
    )
    .await;
    assert!(matches!(
        first_peer.recv_event().await,
        EventMessage::Sync { .. }
    ));

    let (_second_peer, second_client) = connect_registered(
        &store,
        &site,
        &installer,
        "abc123",
        [1].into_iter().collect(),
        channel_config(Duration::from_secs(10)),
    )
    .await;

    // Same durable id; only the new session stays resident.
    assert_eq!(first_client.client_id(), second_client.client_id());
    assert_eq!(site.client_count(), 1);

    // The displaced session is told to go away.
    match first_peer.recv_session().await {
        SessionMessage::Error { code } => assert_eq!(code, ErrorCode::ShuttingDown),
        other => panic!("unexpected frame: {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!first_client.is_online());
    assert!(second_client.is_online());
    let resident = site.client(second_client.client_id()).expect("resident client");
    assert!(Arc::ptr_eq(&resident, &second_client));
}

#[tokio::test(flavor = "multi_thread")]
async fn teardown_retires_the_client_and_its_subscriptions() {
    let store = test_store();
    let site = test_site();
    let installer = installer(&store);

    let (mut peer, client) = connect_registered(
        &store,
        &site,
        &installer,
        "abc123",
        [1].into_iter().collect(),
        channel_config(Duration::from_secs(10)),
    )
    .await;
    sync_accept(&mut peer).await;

    peer.send(
        EventMessage::AddSubscription {
            kind: EventKind::Queueing,
            name: "audit".to_string(),
        }
        .encode(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = client.events().expect("controller attached");
    assert!(events.has_subscription(EventKind::Queueing, "audit"));

    peer.channel.peer_closed();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(site.client_count(), 0);
    assert!(!client.is_online());
    assert!(!events.has_subscription(EventKind::Queueing, "audit"));
    // The persisted row survives for the next session.
    assert!(store.has_subscription(900, 9));
}
