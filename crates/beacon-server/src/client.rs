//! One authenticated (possibly guest) session bound to a site.

use beacon_events::EventController;
use beacon_session::Channel;
use beacon_types::{ClientId, SiteId, UserId, UserKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// A client session. Owned exclusively by its site's client table; created
/// by the installer on successful handshake and removed when the channel
/// reports completion.
pub struct Client {
    client_id: ClientId,
    user_id: UserId,
    user_kind: UserKind,
    site_id: SiteId,
    online: AtomicBool,
    channel: Arc<Channel>,
    /// Attached lazily by the installer once the controller exists.
    events: OnceLock<Arc<EventController>>,
}

impl Client {
    pub fn new(
        client_id: ClientId,
        user_id: UserId,
        user_kind: UserKind,
        site_id: SiteId,
        channel: Arc<Channel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            user_id,
            user_kind,
            site_id,
            online: AtomicBool::new(true),
            channel,
            events: OnceLock::new(),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn user_kind(&self) -> UserKind {
        self.user_kind
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// The event controller serving this session, once attached.
    pub fn events(&self) -> Option<&Arc<EventController>> {
        self.events.get()
    }

    pub(crate) fn attach_events(&self, controller: Arc<EventController>) {
        // A session gets exactly one controller for its lifetime.
        let _ = self.events.set(controller);
    }
}
