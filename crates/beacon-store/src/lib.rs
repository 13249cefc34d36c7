//! Persistence layer for the Beacon platform.
//!
//! The core consumes durable state through the narrow [`Store`] trait:
//! account credentials for the handshake, per-client subscription rows with
//! their delivery cursors, event-instance argument payloads, and
//! acknowledgment bookkeeping. Two implementations ship with the workspace:
//!
//! - [`SqliteStore`] — the production store: SQLite in WAL mode behind an
//!   `r2d2` pool, with embedded versioned migrations.
//! - [`MemoryStore`] — an in-process store for tests and scripted scenarios.
//!
//! All trait methods are synchronous; callers on the async runtime wrap
//! them in `tokio::task::spawn_blocking` so no store round-trip ever runs
//! inside a held lock or blocks the worker threads.

mod memory;
mod migrations;
mod pool;
mod sqlite;

pub use memory::MemoryStore;
pub use migrations::run_migrations;
pub use pool::{create_pool, DbPool, DbRuntimeSettings};
pub use sqlite::SqliteStore;

use beacon_types::{
    ClientId, ErrorCode, EventId, EventKind, InstanceId, SiteId, SiteKind, UserId, UserKind,
};
use thiserror::Error;

/// Errors surfaced by store implementations.
///
/// The core never retries a failed store call inline: the owning session is
/// closed with the matching protocol error code and the peer reconnects.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A transient backing-store failure (connection, I/O, SQL).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store is misconfigured (missing schema, bad path).
    #[error("store configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// The protocol error code a session reports when closed by this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Unavailable(_) => ErrorCode::DbmsError,
            Self::Config(_) => ErrorCode::ConfigError,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Identity data resolved from a client key during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCredentials {
    pub site_id: SiteId,
    pub user_id: UserId,
    pub user_kind: UserKind,
    pub site_kind: SiteKind,
    /// Account salt, echoed to the peer in `SALT_AND_KEY1`.
    pub salt: Vec<u8>,
    /// Salted password hash; the HMAC key of the challenge-response proof.
    pub salted_password: Vec<u8>,
}

/// One persisted subscription row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRow {
    pub event_id: EventId,
    pub kind: EventKind,
    pub name: String,
    /// Dedup/ack cursor: the newest instance id the client has acknowledged.
    pub delivered_instance_id: Option<InstanceId>,
}

/// Data for a subscription being persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub event_id: EventId,
    pub kind: EventKind,
    pub name: String,
}

/// Outcome of an `add_subscription` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// A row for (client id, event id) already exists.
    Conflict,
}

/// The narrow procedural API the core consumes from the backing store.
pub trait Store: Send + Sync {
    /// Resolves a client key to account identity data, or `None` when the
    /// key is unknown.
    fn credentials_by_key(&self, client_key: &str)
        -> Result<Option<AccountCredentials>, StoreError>;

    /// Loads the persisted subscription set of a client.
    fn subscriptions(&self, client_id: ClientId) -> Result<Vec<SubscriptionRow>, StoreError>;

    /// Persists one subscription; reports a conflict if the client already
    /// holds a row for the event.
    fn add_subscription(
        &self,
        site_id: SiteId,
        client_id: ClientId,
        sub: &NewSubscription,
    ) -> Result<AddOutcome, StoreError>;

    /// Deletes one subscription row. Deleting an absent row is not an error.
    fn remove_subscription(&self, client_id: ClientId, event_id: EventId)
        -> Result<(), StoreError>;

    /// Fetches the argument payload of an event instance. `None` means the
    /// payload has expired or rotated out — callers treat that as an
    /// implicit acknowledgment, not a failure.
    fn arguments(&self, instance_id: InstanceId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Records that `instance_id` has been delivered to and acknowledged by
    /// the client, advancing the subscription's dedup cursor. Idempotent.
    fn save_acknowledgment(
        &self,
        client_id: ClientId,
        event_id: EventId,
        instance_id: InstanceId,
    ) -> Result<(), StoreError>;
}
