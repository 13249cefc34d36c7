//! Shared types, error codes, and constants for the Beacon platform.
//!
//! This crate provides the foundational types used across all Beacon crates:
//! identifier aliases, the event/user/site kind enums, protocol error codes,
//! role sets, and the immutable event-instance record.
//!
//! No crate in the workspace depends on anything *except* `beacon-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Numeric identifier of a site (a logical tenant).
pub type SiteId = u64;
/// Numeric identifier of a client session within a site.
pub type ClientId = u64;
/// Numeric identifier of a user account.
pub type UserId = u64;
/// Numeric identifier of a declared event within a site's catalog.
pub type EventId = u32;
/// Monotonic identifier of one occurrence of an event.
pub type InstanceId = u64;
/// Numeric identifier of the producing service.
pub type ServiceId = u32;

/// Delivery semantics of an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    /// Latest-value semantics; a new occurrence supersedes any undelivered
    /// prior one, including an explicit "null" reset.
    Replacing = 1,
    /// Ordered, at-least-once sequence with a bounded server-side queue.
    Queueing = 2,
    /// Targeted at one specific client id rather than a role-authorized
    /// audience.
    Private = 3,
}

impl EventKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Attempts to convert a numeric code to an `EventKind`.
    ///
    /// Returns `None` if the code does not correspond to a known kind.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Replacing),
            2 => Some(Self::Queueing),
            3 => Some(Self::Private),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Replacing => "REPLACING",
            Self::Queueing => "QUEUEING",
            Self::Private => "PRIVATE",
        }
    }
}

/// Kind of an authenticated (or guest) user session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UserKind {
    /// The owning account of the site.
    Owner = 1,
    /// A private (staff) account.
    Private = 2,
    /// A registered contact account.
    Contact = 3,
    /// A registered guest account.
    Guest = 4,
    /// An unauthenticated guest with no server-held subscription state.
    StatelessGuest = 5,
}

impl UserKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Owner),
            2 => Some(Self::Private),
            3 => Some(Self::Contact),
            4 => Some(Self::Guest),
            5 => Some(Self::StatelessGuest),
            _ => None,
        }
    }

    /// Whether sessions of this kind carry no persisted subscription state.
    pub fn is_stateless(self) -> bool {
        matches!(self, Self::StatelessGuest)
    }
}

/// Client category declared in the channel-open request.
///
/// Stateful categories must match the kind of the site the client key
/// resolves to; the stateless-guest category skips authentication entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ClientCategory {
    /// A client of a single-service site.
    SingleService = 1,
    /// A client of a multi-service site.
    MultiService = 2,
    /// An unauthenticated stateless guest.
    StatelessGuest = 3,
}

impl ClientCategory {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::SingleService),
            2 => Some(Self::MultiService),
            3 => Some(Self::StatelessGuest),
            _ => None,
        }
    }

    pub fn is_stateless(self) -> bool {
        matches!(self, Self::StatelessGuest)
    }

    /// The site kind a stateful category must resolve to.
    pub fn expected_site_kind(self) -> Option<SiteKind> {
        match self {
            Self::SingleService => Some(SiteKind::SingleService),
            Self::MultiService => Some(SiteKind::MultiService),
            Self::StatelessGuest => None,
        }
    }
}

/// Address family of the transport under a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressFamily {
    #[default]
    Unspecified,
    V4,
    V6,
}

/// Kind of a site, determining which client categories it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SiteKind {
    SingleService = 1,
    MultiService = 2,
}

impl SiteKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::SingleService),
            2 => Some(Self::MultiService),
            _ => None,
        }
    }
}

/// Typed protocol error codes carried in outbound `ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Connection-entry protocol version did not match.
    IncompatibleProtocolVersion = 1,
    /// Malformed, out-of-phase, or otherwise undecodable frame.
    FormatError = 2,
    /// Declared client category does not match the resolved site kind.
    InvalidClientCategory = 3,
    /// The client key did not resolve to a known account.
    UnknownClientKey = 4,
    /// Challenge-response password proof did not match.
    PasswordNotMatched = 5,
    /// Backing-store failure; the session is closed and the peer is
    /// expected to reconnect.
    DbmsError = 6,
    /// Store-side configuration failure; session-fatal.
    ConfigError = 7,
    /// The server is shutting the channel down.
    ShuttingDown = 8,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::IncompatibleProtocolVersion),
            2 => Some(Self::FormatError),
            3 => Some(Self::InvalidClientCategory),
            4 => Some(Self::UnknownClientKey),
            5 => Some(Self::PasswordNotMatched),
            6 => Some(Self::DbmsError),
            7 => Some(Self::ConfigError),
            8 => Some(Self::ShuttingDown),
            _ => None,
        }
    }
}

/// The set of role ids granted to a client session.
///
/// Replacing and Queueing subscriptions are authorized against this set;
/// it changes at runtime when the authority updates a client's roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet(BTreeSet<u32>);

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: u32) -> bool {
        self.0.insert(role)
    }

    pub fn remove(&mut self, role: u32) -> bool {
        self.0.remove(&role)
    }

    pub fn contains(&self, role: u32) -> bool {
        self.0.contains(&role)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when this set shares at least one role with `audience`.
    pub fn intersects(&self, audience: &RoleSet) -> bool {
        self.0.iter().any(|r| audience.0.contains(r))
    }
}

impl FromIterator<u32> for RoleSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A declared event in a site's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Numeric id of the event stream.
    pub event_id: EventId,
    /// Delivery semantics.
    pub kind: EventKind,
    /// Declared name, unique per kind within the site.
    pub name: String,
    /// Roles permitted to subscribe (Replacing/Queueing only; Private
    /// events are scoped to a single client id instead).
    pub audience: RoleSet,
}

/// One occurrence of an event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInstance {
    /// Monotonic per-event instance id.
    pub instance_id: InstanceId,
    /// The event stream this instance belongs to.
    pub event_id: EventId,
    /// The service that produced the instance.
    pub service_id: ServiceId,
    /// Tick-clock value at creation.
    pub created_tick: u64,
    /// Wall-clock creation time, unix seconds.
    pub created_at: i64,
    /// Whether the instance carries an argument payload at all.
    pub has_arguments: bool,
    /// Cached argument payload. Absent when the cache entry was evicted;
    /// a delivery then falls back to a store fetch by instance id.
    pub arguments: Option<Vec<u8>>,
    /// Replacing events only: an explicit empty/reset occurrence that
    /// carries no argument field on the wire.
    pub is_null: bool,
}

impl EventInstance {
    /// Whether delivery must fetch the argument payload from the store.
    pub fn needs_argument_fetch(&self) -> bool {
        self.has_arguments && self.arguments.is_none()
    }
}

/// One entry of a client-supplied subscription list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub kind: EventKind,
    pub name: String,
    /// Stateless-guest lists may carry a last-delivered cursor per entry so
    /// a reconnecting guest does not re-receive already-seen instances.
    pub last_delivered: Option<InstanceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_codes_round_trip() {
        for kind in [EventKind::Replacing, EventKind::Queueing, EventKind::Private] {
            assert_eq!(EventKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(EventKind::from_u8(0), None);
        assert_eq!(EventKind::from_u8(4), None);
    }

    #[test]
    fn category_site_kind_mapping() {
        assert_eq!(
            ClientCategory::SingleService.expected_site_kind(),
            Some(SiteKind::SingleService)
        );
        assert_eq!(
            ClientCategory::MultiService.expected_site_kind(),
            Some(SiteKind::MultiService)
        );
        assert_eq!(ClientCategory::StatelessGuest.expected_site_kind(), None);
        assert!(ClientCategory::StatelessGuest.is_stateless());
        assert!(!ClientCategory::MultiService.is_stateless());
    }

    #[test]
    fn role_set_intersection() {
        let granted: RoleSet = [1, 5, 9].into_iter().collect();
        let audience: RoleSet = [5].into_iter().collect();
        assert!(granted.intersects(&audience));

        let disjoint: RoleSet = [2, 3].into_iter().collect();
        assert!(!granted.intersects(&disjoint));
        assert!(!granted.intersects(&RoleSet::new()));
    }

    #[test]
    fn instance_argument_fetch_flag() {
        let mut inst = EventInstance {
            instance_id: 7,
            event_id: 1,
            service_id: 2,
            created_tick: 10,
            created_at: 1_700_000_000,
            has_arguments: true,
            arguments: None,
            is_null: false,
        };
        assert!(inst.needs_argument_fetch());

        inst.arguments = Some(vec![1, 2, 3]);
        assert!(!inst.needs_argument_fetch());

        inst.has_arguments = false;
        inst.arguments = None;
        assert!(!inst.needs_argument_fetch());
    }

    #[test]
    fn error_codes_round_trip() {
        for code in [
            ErrorCode::IncompatibleProtocolVersion,
            ErrorCode::FormatError,
            ErrorCode::InvalidClientCategory,
            ErrorCode::UnknownClientKey,
            ErrorCode::PasswordNotMatched,
            ErrorCode::DbmsError,
            ErrorCode::ConfigError,
            ErrorCode::ShuttingDown,
        ] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(0), None);
        assert_eq!(ErrorCode::from_u16(999), None);
    }
}
