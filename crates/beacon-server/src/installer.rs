//! Post-handshake client installation.
//!
//! `accept_connection` wires a fresh channel for an accepted transport;
//! the `ClientInstaller` then turns an established handshake into a
//! resident [`Client`]: allocate the client id, insert into the site's
//! client table, attach the event controller to the channel's event
//! module, and start subscription synchronization. The front door that
//! resolves a client key to its site is outside this crate; callers hand
//! the resolved site in.

use beacon_events::{
    AudienceContext, ControllerFlavor, ControllerParams, DeliveryConfig, EventController,
    TickClock,
};
use beacon_session::{Channel, ChannelConfig, Established, LivenessModule, SessionError,
    SessionModule};
use beacon_store::Store;
use beacon_types::{RoleSet, UserKind};
use beacon_wire::{MODULE_EVENTS, MODULE_LIVENESS, MODULE_SESSION};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::client::Client;
use crate::site::Site;

/// Errors raised while installing an established session.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("channel wiring failed: {0}")]
    Channel(#[from] SessionError),

    #[error("channel closed before installation")]
    ChannelClosed,
}

/// Creates the channel for one accepted connection with the session and
/// liveness modules bound. The returned receiver resolves when the
/// handshake establishes the session.
pub fn accept_connection(
    store: Arc<dyn Store>,
    outbound: mpsc::Sender<Vec<u8>>,
    config: ChannelConfig,
) -> (Arc<Channel>, oneshot::Receiver<Established>) {
    let channel = Channel::new(outbound, config);
    let (session, established) = SessionModule::new(store);
    // The slot table is empty on a fresh channel; these cannot collide.
    channel
        .bind_module(MODULE_SESSION, session)
        .expect("fresh channel has an empty session slot");
    channel
        .bind_module(MODULE_LIVENESS, Arc::new(LivenessModule))
        .expect("fresh channel has an empty liveness slot");
    (channel, established)
}

/// Thin orchestrator that binds established sessions to site state.
pub struct ClientInstaller {
    store: Arc<dyn Store>,
    delivery: DeliveryConfig,
}

impl ClientInstaller {
    pub fn new(store: Arc<dyn Store>, delivery: DeliveryConfig) -> Self {
        Self { store, delivery }
    }

    /// Attaches an established session to `site`.
    ///
    /// The returned client is already resident in the site's client table
    /// and its event controller is synchronizing. When the channel closes,
    /// the client is taken offline and removed from the table.
    pub fn install(
        &self,
        site: &Arc<Site>,
        channel: &Arc<Channel>,
        established: Established,
        roles: RoleSet,
    ) -> Result<Arc<Client>, InstallError> {
        if channel.is_closed() {
            return Err(InstallError::ChannelClosed);
        }

        let (user_id, user_kind) = match &established.credentials {
            Some(credentials) => (credentials.user_id, credentials.user_kind),
            None => (0, UserKind::StatelessGuest),
        };
        let flavor = if user_kind.is_stateless() {
            ControllerFlavor::StatelessGuest
        } else {
            ControllerFlavor::Registered
        };

        // Registered sessions keep the durable id their subscription rows
        // are keyed under; stateless guests get an ephemeral one.
        let client_id = match flavor {
            ControllerFlavor::Registered => user_id,
            ControllerFlavor::StatelessGuest => site.allocate_guest_id(),
        };
        let client = Client::new(client_id, user_id, user_kind, site.id(), channel.clone());

        let controller = EventController::new(ControllerParams {
            flavor,
            ctx: AudienceContext {
                site_id: site.id(),
                client_id,
                user_id,
                user_kind,
            },
            roles,
            store: self.store.clone(),
            authority: site.clone(),
            channel: channel.clone(),
            clock: TickClock::new(site.tick_period_secs(), site.current_tick()),
            config: self.delivery,
        });
        client.attach_events(controller.clone());
        channel.bind_module(MODULE_EVENTS, controller.clone())?;

        if let Some(displaced) = site.insert_client(client.clone()) {
            tracing::info!(
                site_id = site.id(),
                client_id,
                "replaced existing session for client"
            );
            displaced.set_online(false);
            displaced
                .channel()
                .close_graceful(beacon_types::ErrorCode::ShuttingDown);
        }

        tracing::info!(
            site_id = site.id(),
            client_id,
            user_id,
            user_kind = ?user_kind,
            restored = established.restored,
            "client installed"
        );

        // The controller registers its own teardown; the site additionally
        // retires the client record when the channel completes.
        {
            let site = site.clone();
            let client = client.clone();
            let mut closed = channel.closed();
            tokio::spawn(async move {
                while !*closed.borrow() {
                    if closed.changed().await.is_err() {
                        break;
                    }
                }
                client.set_online(false);
                if site.retire_client(&client) {
                    tracing::info!(site_id = site.id(), client_id, "client removed");
                }
            });
        }

        controller.attach();
        Ok(client)
    }
}
