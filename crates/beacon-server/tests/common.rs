//! Shared harness for the end-to-end protocol tests: an in-process peer
//! that speaks the framed protocol against a wired channel.
#![allow(dead_code)]

use beacon_server::{accept_connection, Client, ClientInstaller, Site};
use beacon_session::handshake::password_proof;
use beacon_session::{Channel, ChannelConfig};
use beacon_store::{AccountCredentials, MemoryStore, Store};
use beacon_types::{
    ClientCategory, EventDescriptor, EventKind, RoleSet, SiteKind, UserKind,
};
use beacon_events::DeliveryConfig;
use beacon_wire::events::EventMessage;
use beacon_wire::session::SessionMessage;
use beacon_wire::FrameHeader;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SALTED_PASSWORD: &[u8] = b"salted-secret";

/// Store with two registered accounts on site 1.
pub fn test_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_account(
        "abc123",
        AccountCredentials {
            site_id: 1,
            user_id: 900,
            user_kind: UserKind::Contact,
            site_kind: SiteKind::MultiService,
            salt: vec![5, 6, 7, 8],
            salted_password: SALTED_PASSWORD.to_vec(),
        },
    );
    store.insert_account(
        "def456",
        AccountCredentials {
            site_id: 1,
            user_id: 901,
            user_kind: UserKind::Contact,
            site_kind: SiteKind::MultiService,
            salt: vec![9, 9, 9, 9],
            salted_password: SALTED_PASSWORD.to_vec(),
        },
    );
    store
}

/// Site 1 with the catalog the tests exercise. The "vip" event is gated
/// on role 9; everything else is open.
pub fn test_site() -> Arc<Site> {
    let site = Site::new(1, SiteKind::MultiService, 30);
    site.declare_event(EventDescriptor {
        event_id: 12,
        kind: EventKind::Replacing,
        name: "status".to_string(),
        audience: RoleSet::new(),
    });
    site.declare_event(EventDescriptor {
        event_id: 9,
        kind: EventKind::Queueing,
        name: "audit".to_string(),
        audience: RoleSet::new(),
    });
    site.declare_event(EventDescriptor {
        event_id: 20,
        kind: EventKind::Private,
        name: "direct".to_string(),
        audience: RoleSet::new(),
    });
    site.declare_event(EventDescriptor {
        event_id: 30,
        kind: EventKind::Replacing,
        name: "vip".to_string(),
        audience: [9].into_iter().collect(),
    });
    site
}

/// Channel timings for tests: default protocol windows, with the liveness
/// sweep optionally tightened to drive redelivery in real time.
pub fn channel_config(sweep: Duration) -> ChannelConfig {
    ChannelConfig {
        sweep_interval: sweep,
        ..ChannelConfig::default()
    }
}

pub fn delivery_config(redelivery_window: Duration) -> DeliveryConfig {
    DeliveryConfig { redelivery_window }
}

/// The client side of one wired connection.
pub struct Peer {
    pub channel: Arc<Channel>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

impl Peer {
    pub fn send(&self, frame: Vec<u8>) {
        self.channel.dispatch(&frame);
    }

    async fn recv_raw(&mut self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    pub async fn recv_session(&mut self) -> SessionMessage {
        let raw = self.recv_raw().await;
        let (header, body) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.module, beacon_wire::MODULE_SESSION);
        SessionMessage::decode(header.op, body).unwrap()
    }

    pub async fn recv_event(&mut self) -> EventMessage {
        let raw = self.recv_raw().await;
        let (header, body) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.module, beacon_wire::MODULE_EVENTS);
        EventMessage::decode(header.op, body).unwrap()
    }

    /// Asserts that nothing arrives for `ms` milliseconds.
    pub async fn expect_quiet(&mut self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        assert!(
            self.rx.try_recv().is_err(),
            "expected no traffic on the channel"
        );
    }
}

/// Runs the full challenge-response handshake for `client_key` and
/// installs the session on `site`. Returns the peer and the resident
/// client.
pub async fn connect_registered(
    store: &Arc<MemoryStore>,
    site: &Arc<Site>,
    installer: &ClientInstaller,
    client_key: &str,
    roles: RoleSet,
    config: ChannelConfig,
) -> (Peer, Arc<Client>) {
    let dyn_store: Arc<dyn Store> = store.clone();
    let (tx, rx) = mpsc::channel(64);
    let (channel, established) = accept_connection(dyn_store, tx, config);
    let mut peer = Peer {
        channel: channel.clone(),
        rx,
    };

    peer.send(
        SessionMessage::Open {
            category: ClientCategory::MultiService,
            client_key: client_key.to_string(),
        }
        .encode(),
    );
    let key1 = match peer.recv_session().await {
        SessionMessage::SaltAndKey1 { key1, .. } => key1,
        other => panic!("unexpected handshake reply: {other:?}"),
    };
    let key2 = vec![0x5a; 12];
    let hash = password_proof(SALTED_PASSWORD, &key1, &key2);
    peer.send(SessionMessage::HashAndKey2 { hash, key2 }.encode());
    match peer.recv_session().await {
        SessionMessage::OpenOk { .. } => {}
        other => panic!("unexpected handshake reply: {other:?}"),
    }

    let established = established.await.expect("handshake should establish");
    let client = installer
        .install(site, &channel, established, roles)
        .expect("installation should succeed");
    (peer, client)
}

/// Accepts the server's digest challenge as-is.
pub async fn sync_accept(peer: &mut Peer) {
    match peer.recv_event().await {
        EventMessage::Sync { .. } => {}
        other => panic!("expected sync challenge, got {other:?}"),
    }
    peer.send(EventMessage::SyncOk.encode());
    // Let the controller flip to synchronized before the test proceeds.
    tokio::time::sleep(Duration::from_millis(30)).await;
}
