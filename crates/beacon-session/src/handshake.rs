//! Challenge-response channel handshake.
//!
//! The session module owns the channel until the handshake completes:
//!
//! ```text
//! Client                                        Server
//!   |  -- OPEN(category, clientKey) ------------> |   Phase1
//!   |  <-- SALT_AND_KEY1(salt, key1) ------------ |   -> Phase2
//!   |  -- HASH_AND_KEY2(hash, key2) ------------> |
//!   |  <-- OPEN_OK(channelId) / RESTORE_OK ------ |   -> Completed
//! ```
//!
//! Stateless-guest categories skip authentication: `OPEN` is answered with
//! `OPEN_OK2` and the channel goes straight to steady-state dispatch.
//! `RESTORE` differs from `OPEN` only by carrying a previously issued
//! channel id, which the success path reuses instead of minting a new one.
//!
//! The password proof is `HMAC-SHA256(salted_password, key1 ‖ key2)`,
//! compared in constant time. The ephemeral handshake data (salt, salted
//! password, server nonce) lives only between the two phases and is
//! discarded on success or failure.

use beacon_store::{AccountCredentials, Store};
use beacon_types::{ClientCategory, ErrorCode};
use beacon_wire::session::SessionMessage;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::channel::{Channel, ModuleHandler};

/// Length of the server nonce sent in `SALT_AND_KEY1`.
pub const SERVER_KEY_LEN: usize = 20;

/// Outcome of a completed handshake, handed to the client installer.
#[derive(Debug)]
pub struct Established {
    pub category: ClientCategory,
    /// The client key presented in `OPEN`/`RESTORE`; absent for stateless
    /// guests.
    pub client_key: Option<String>,
    /// Resolved identity data; absent for stateless guests.
    pub credentials: Option<AccountCredentials>,
    /// The channel id minted or restored; stateless guests have none.
    pub channel_id: Option<Uuid>,
    pub restored: bool,
}

/// Ephemeral handshake state between `SALT_AND_KEY1` and the proof.
struct AuthData {
    credentials: AccountCredentials,
    category: ClientCategory,
    client_key: String,
    key1: [u8; SERVER_KEY_LEN],
    restore_channel: Option<Uuid>,
}

enum Phase {
    Phase1,
    /// `OPEN`/`RESTORE` accepted, credentials lookup in flight.
    Resolving,
    Phase2(Box<AuthData>),
    Completed,
    Failed,
}

/// The session protocol module: handshake state machine per channel.
pub struct SessionModule {
    store: Arc<dyn Store>,
    phase: Mutex<Phase>,
    established_tx: Mutex<Option<oneshot::Sender<Established>>>,
}

impl SessionModule {
    /// Creates the module and the receiver the installer awaits.
    pub fn new(store: Arc<dyn Store>) -> (Arc<Self>, oneshot::Receiver<Established>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                store,
                phase: Mutex::new(Phase::Phase1),
                established_tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn signal(&self, established: Established) {
        if let Some(tx) = self.established_tx.lock().unwrap().take() {
            // The installer may have gone away; nothing to do then.
            let _ = tx.send(established);
        }
    }

    fn handle_open(
        self: Arc<Self>,
        channel: Arc<Channel>,
        category: ClientCategory,
        client_key: String,
        restore_channel: Option<Uuid>,
    ) {
        {
            let mut phase = self.phase.lock().unwrap();
            match *phase {
                Phase::Phase1 => *phase = Phase::Resolving,
                _ => {
                    tracing::debug!("open outside phase 1");
                    channel.close_hard();
                    return;
                }
            }
        }

        if category.is_stateless() {
            if restore_channel.is_some() {
                // Stateless guests hold no channel id to restore.
                *self.phase.lock().unwrap() = Phase::Failed;
                channel.close_graceful(ErrorCode::InvalidClientCategory);
                return;
            }
            *self.phase.lock().unwrap() = Phase::Completed;
            channel.send(SessionMessage::OpenOk2.encode());
            channel.mark_active();
            tracing::info!("stateless guest channel established");
            self.signal(Established {
                category,
                client_key: Some(client_key),
                credentials: None,
                channel_id: None,
                restored: false,
            });
            return;
        }

        tokio::spawn(async move {
            let store = self.store.clone();
            let key = client_key.clone();
            let looked_up =
                tokio::task::spawn_blocking(move || store.credentials_by_key(&key)).await;

            // The channel may have timed out or died while we were in the
            // store; don't touch it further if so.
            if channel.is_closed() {
                *self.phase.lock().unwrap() = Phase::Failed;
                return;
            }

            let credentials = match looked_up {
                Ok(Ok(Some(credentials))) => credentials,
                Ok(Ok(None)) => {
                    tracing::info!(client_key = %client_key, "unknown client key");
                    *self.phase.lock().unwrap() = Phase::Failed;
                    channel.close_graceful(ErrorCode::UnknownClientKey);
                    return;
                }
                Ok(Err(e)) => {
                    tracing::error!("credentials lookup failed: {}", e);
                    *self.phase.lock().unwrap() = Phase::Failed;
                    channel.close_graceful(e.error_code());
                    return;
                }
                Err(e) => {
                    tracing::error!("credentials lookup task failed: {}", e);
                    *self.phase.lock().unwrap() = Phase::Failed;
                    channel.close_graceful(ErrorCode::DbmsError);
                    return;
                }
            };

            if category.expected_site_kind() != Some(credentials.site_kind) {
                tracing::info!(
                    client_key = %client_key,
                    category = ?category,
                    site_kind = ?credentials.site_kind,
                    "client category does not match site kind"
                );
                *self.phase.lock().unwrap() = Phase::Failed;
                channel.close_graceful(ErrorCode::InvalidClientCategory);
                return;
            }

            let mut key1 = [0u8; SERVER_KEY_LEN];
            rand::rngs::OsRng.fill_bytes(&mut key1);

            let reply = SessionMessage::SaltAndKey1 {
                salt: credentials.salt.clone(),
                key1: key1.to_vec(),
            };

            *self.phase.lock().unwrap() = Phase::Phase2(Box::new(AuthData {
                credentials,
                category,
                client_key,
                key1,
                restore_channel,
            }));
            channel.send(reply.encode());
        });
    }

    fn handle_proof(&self, channel: &Arc<Channel>, hash: Vec<u8>, key2: Vec<u8>) {
        let auth = {
            let mut phase = self.phase.lock().unwrap();
            match std::mem::replace(&mut *phase, Phase::Failed) {
                Phase::Phase2(auth) => auth,
                // A second proof in the same phase, or a proof before the
                // salt/key exchange: the state machine already moved on.
                other => {
                    *phase = other;
                    tracing::debug!("password proof outside phase 2");
                    channel.close_hard();
                    return;
                }
            }
        };

        if !verify_password_proof(&auth.credentials.salted_password, &auth.key1, &key2, &hash) {
            tracing::info!(client_key = %auth.client_key, "password proof mismatch");
            channel.close_graceful(ErrorCode::PasswordNotMatched);
            return;
        }

        let restored = auth.restore_channel.is_some();
        let channel_id = auth.restore_channel.unwrap_or_else(Uuid::new_v4);
        channel.set_channel_id(channel_id);

        let reply = if restored {
            SessionMessage::RestoreOk
        } else {
            SessionMessage::OpenOk { channel_id }
        };
        channel.send(reply.encode());
        channel.mark_active();

        *self.phase.lock().unwrap() = Phase::Completed;
        tracing::info!(
            client_key = %auth.client_key,
            restored,
            "channel established"
        );

        self.signal(Established {
            category: auth.category,
            client_key: Some(auth.client_key),
            credentials: Some(auth.credentials),
            channel_id: Some(channel_id),
            restored,
        });
    }
}

impl ModuleHandler for SessionModule {
    fn on_frame(self: Arc<Self>, channel: &Arc<Channel>, op: u8, body: Vec<u8>) {
        let message = match SessionMessage::decode(op, &body) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "malformed session frame");
                channel.close_hard();
                return;
            }
        };

        match message {
            SessionMessage::Open {
                category,
                client_key,
            } => self.handle_open(channel.clone(), category, client_key, None),
            SessionMessage::Restore {
                category,
                client_key,
                channel_id,
            } => self.handle_open(channel.clone(), category, client_key, Some(channel_id)),
            SessionMessage::HashAndKey2 { hash, key2 } => {
                self.handle_proof(channel, hash, key2)
            }
            // Server-to-client operations arriving inbound are out of
            // contract.
            _ => {
                tracing::debug!("unexpected session operation from peer");
                channel.close_hard();
            }
        }
    }
}

/// Computes the expected password proof for a challenge pair.
///
/// Clients compute the same value from their salted password and the two
/// exchanged keys; the server compares in constant time.
pub fn password_proof(salted_password: &[u8], key1: &[u8], key2: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(salted_password).expect("HMAC accepts any key length");
    mac.update(key1);
    mac.update(key2);
    mac.finalize().into_bytes().to_vec()
}

fn verify_password_proof(salted_password: &[u8], key1: &[u8], key2: &[u8], hash: &[u8]) -> bool {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(salted_password).expect("HMAC accepts any key length");
    mac.update(key1);
    mac.update(key2);
    mac.verify_slice(hash).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use beacon_store::MemoryStore;
    use beacon_types::{SiteKind, UserKind};
    use beacon_wire::FrameHeader;
    use tokio::sync::mpsc;

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_account(
            "abc123",
            AccountCredentials {
                site_id: 1,
                user_id: 10,
                user_kind: UserKind::Contact,
                site_kind: SiteKind::MultiService,
                salt: vec![5, 6, 7, 8],
                salted_password: b"salted-secret".to_vec(),
            },
        );
        store
    }

    struct Harness {
        channel: Arc<Channel>,
        rx: mpsc::Receiver<Vec<u8>>,
        established: oneshot::Receiver<Established>,
    }

    fn harness(store: Arc<MemoryStore>) -> Harness {
        let (tx, rx) = mpsc::channel(16);
        let channel = Channel::new(tx, ChannelConfig::default());
        let (module, established) = SessionModule::new(store);
        channel
            .bind_module(beacon_wire::MODULE_SESSION, module)
            .unwrap();
        Harness {
            channel,
            rx,
            established,
        }
    }

    async fn recv_session(rx: &mut mpsc::Receiver<Vec<u8>>) -> SessionMessage {
        let raw = rx.recv().await.expect("frame");
        let (header, body) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.module, beacon_wire::MODULE_SESSION);
        SessionMessage::decode(header.op, body).unwrap()
    }

    #[tokio::test]
    async fn full_handshake_establishes_the_channel() {
        let mut h = harness(seeded_store());

        h.channel.dispatch(
            &SessionMessage::Open {
                category: ClientCategory::MultiService,
                client_key: "abc123".to_string(),
            }
            .encode(),
        );

        let (salt, key1) = match recv_session(&mut h.rx).await {
            SessionMessage::SaltAndKey1 { salt, key1 } => (salt, key1),
            other => panic!("unexpected reply: {other:?}"),
        };
        assert_eq!(salt, vec![5, 6, 7, 8]);
        assert_eq!(key1.len(), SERVER_KEY_LEN);

        let key2 = vec![0xc1; 16];
        let hash = password_proof(b"salted-secret", &key1, &key2);
        h.channel
            .dispatch(&SessionMessage::HashAndKey2 { hash, key2 }.encode());

        let channel_id = match recv_session(&mut h.rx).await {
            SessionMessage::OpenOk { channel_id } => channel_id,
            other => panic!("unexpected reply: {other:?}"),
        };

        let established = h.established.await.expect("established signal");
        assert_eq!(established.channel_id, Some(channel_id));
        assert!(!established.restored);
        assert_eq!(established.category, ClientCategory::MultiService);
        assert_eq!(h.channel.state(), crate::channel::ChannelState::Active);
        assert_eq!(h.channel.channel_id(), Some(channel_id));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_with_a_typed_error() {
        let mut h = harness(seeded_store());

        h.channel.dispatch(
            &SessionMessage::Open {
                category: ClientCategory::MultiService,
                client_key: "abc123".to_string(),
            }
            .encode(),
        );
        let key1 = match recv_session(&mut h.rx).await {
            SessionMessage::SaltAndKey1 { key1, .. } => key1,
            other => panic!("unexpected reply: {other:?}"),
        };

        let key2 = vec![0xc1; 16];
        let hash = password_proof(b"wrong-secret", &key1, &key2);
        h.channel
            .dispatch(&SessionMessage::HashAndKey2 { hash, key2 }.encode());

        match recv_session(&mut h.rx).await {
            SessionMessage::Error { code } => assert_eq!(code, ErrorCode::PasswordNotMatched),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(h.established.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_proof_in_the_same_phase_is_rejected() {
        let mut h = harness(seeded_store());

        h.channel.dispatch(
            &SessionMessage::Open {
                category: ClientCategory::MultiService,
                client_key: "abc123".to_string(),
            }
            .encode(),
        );
        let key1 = match recv_session(&mut h.rx).await {
            SessionMessage::SaltAndKey1 { key1, .. } => key1,
            other => panic!("unexpected reply: {other:?}"),
        };

        let key2 = vec![0xc1; 16];
        let hash = password_proof(b"salted-secret", &key1, &key2);
        h.channel.dispatch(
            &SessionMessage::HashAndKey2 {
                hash: hash.clone(),
                key2: key2.clone(),
            }
            .encode(),
        );
        assert!(matches!(
            recv_session(&mut h.rx).await,
            SessionMessage::OpenOk { .. }
        ));

        // Replaying the proof finds the machine in a terminal state.
        h.channel
            .dispatch(&SessionMessage::HashAndKey2 { hash, key2 }.encode());
        assert!(h.channel.is_closed());
    }

    #[tokio::test]
    async fn category_mismatch_is_rejected() {
        let mut h = harness(seeded_store());

        h.channel.dispatch(
            &SessionMessage::Open {
                category: ClientCategory::SingleService,
                client_key: "abc123".to_string(),
            }
            .encode(),
        );

        match recv_session(&mut h.rx).await {
            SessionMessage::Error { code } => {
                assert_eq!(code, ErrorCode::InvalidClientCategory)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_client_key_is_rejected() {
        let mut h = harness(seeded_store());

        h.channel.dispatch(
            &SessionMessage::Open {
                category: ClientCategory::MultiService,
                client_key: "nobody".to_string(),
            }
            .encode(),
        );

        match recv_session(&mut h.rx).await {
            SessionMessage::Error { code } => assert_eq!(code, ErrorCode::UnknownClientKey),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stateless_guest_skips_authentication() {
        let mut h = harness(seeded_store());

        h.channel.dispatch(
            &SessionMessage::Open {
                category: ClientCategory::StatelessGuest,
                client_key: "guest-key".to_string(),
            }
            .encode(),
        );

        assert!(matches!(
            recv_session(&mut h.rx).await,
            SessionMessage::OpenOk2
        ));
        let established = h.established.await.expect("established signal");
        assert_eq!(established.channel_id, None);
        assert!(established.credentials.is_none());
        assert_eq!(h.channel.state(), crate::channel::ChannelState::Active);
    }

    #[tokio::test]
    async fn restore_reuses_the_carried_channel_id() {
        let mut h = harness(seeded_store());
        let prior = Uuid::new_v4();

        h.channel.dispatch(
            &SessionMessage::Restore {
                category: ClientCategory::MultiService,
                client_key: "abc123".to_string(),
                channel_id: prior,
            }
            .encode(),
        );
        let key1 = match recv_session(&mut h.rx).await {
            SessionMessage::SaltAndKey1 { key1, .. } => key1,
            other => panic!("unexpected reply: {other:?}"),
        };

        let key2 = vec![0x2a; 8];
        let hash = password_proof(b"salted-secret", &key1, &key2);
        h.channel
            .dispatch(&SessionMessage::HashAndKey2 { hash, key2 }.encode());

        assert!(matches!(
            recv_session(&mut h.rx).await,
            SessionMessage::RestoreOk
        ));
        let established = h.established.await.expect("established signal");
        assert!(established.restored);
        assert_eq!(established.channel_id, Some(prior));
        assert_eq!(h.channel.channel_id(), Some(prior));
    }

    #[tokio::test]
    async fn proof_before_open_tears_down() {
        let h = harness(seeded_store());

        h.channel.dispatch(
            &SessionMessage::HashAndKey2 {
                hash: vec![0; 32],
                key2: vec![0; 8],
            }
            .encode(),
        );
        assert!(h.channel.is_closed());
    }

    #[tokio::test]
    async fn store_outage_is_session_fatal() {
        let store = seeded_store();
        store.set_unavailable(true);
        let mut h = harness(store);

        h.channel.dispatch(
            &SessionMessage::Open {
                category: ClientCategory::MultiService,
                client_key: "abc123".to_string(),
            }
            .encode(),
        );

        match recv_session(&mut h.rx).await {
            SessionMessage::Error { code } => assert_eq!(code, ErrorCode::DbmsError),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn proof_is_deterministic_and_key_sensitive() {
        let a = password_proof(b"pw", &[1, 2], &[3, 4]);
        let b = password_proof(b"pw", &[1, 2], &[3, 4]);
        let c = password_proof(b"pw", &[1, 2], &[3, 5]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(verify_password_proof(b"pw", &[1, 2], &[3, 4], &a));
        assert!(!verify_password_proof(b"pw", &[1, 2], &[3, 4], &c));
    }
}
