//! The site-level event authority interface consumed by the delivery
//! engine.

use beacon_types::{ClientId, EventDescriptor, EventId, EventInstance, EventKind, InstanceId,
    RoleSet};

/// Identifies one subscription when asking the authority for its next
/// undelivered instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRef {
    pub client_id: ClientId,
    pub event_id: EventId,
    pub kind: EventKind,
    /// The dedup cursor: only instances strictly newer qualify.
    pub after: Option<InstanceId>,
}

/// What the delivery engine needs from the site: catalog lookups,
/// role-based authorization, next-event queries, and the shared mutex that
/// serializes subscription-list materialization against concurrent raises.
pub trait EventAuthority: Send + Sync {
    /// Resolves a declared event by kind and name.
    fn resolve(&self, kind: EventKind, name: &str) -> Option<EventDescriptor>;

    /// Whether a client holding `roles` may subscribe to the event.
    /// Only consulted for Replacing and Queueing subscriptions; Private
    /// authorization is fixed at creation and scoped to the client id.
    fn authorize(&self, descriptor: &EventDescriptor, roles: &RoleSet) -> bool;

    /// The next undelivered instance for the subscription, or `None`.
    /// Never returns an instance id less than or equal to `after`.
    fn next_event(&self, sub: &SubscriptionRef) -> Option<EventInstance>;

    /// Shared mutex coordinating concurrent raises with list
    /// materialization.
    fn raise_lock(&self) -> &std::sync::Mutex<()>;
}
