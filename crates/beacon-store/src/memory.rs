//! In-memory store for tests and scripted scenarios.

use beacon_types::{ClientId, EventId, InstanceId, SiteId};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::{AccountCredentials, AddOutcome, NewSubscription, Store, StoreError, SubscriptionRow};

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, AccountCredentials>,
    subscriptions: HashMap<(ClientId, EventId), SubscriptionRow>,
    arguments: HashMap<InstanceId, Vec<u8>>,
    acknowledgments: HashMap<(ClientId, EventId), InstanceId>,
    unavailable: bool,
}

/// A `Store` holding everything in process memory.
///
/// Besides the trait methods it exposes seeding helpers for accounts,
/// subscription rows, and argument payloads, plus an outage switch that
/// makes every call fail with a transient error.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, client_key: &str, creds: AccountCredentials) {
        let mut inner = self.inner.lock().unwrap();
        inner.accounts.insert(client_key.to_string(), creds);
    }

    /// Seeds a persisted subscription row, as if written by a prior session.
    pub fn seed_subscription(&self, client_id: ClientId, row: SubscriptionRow) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscriptions.insert((client_id, row.event_id), row);
    }

    pub fn insert_arguments(&self, instance_id: InstanceId, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.arguments.insert(instance_id, payload);
    }

    /// Drops a cached payload, simulating expiry/rotation.
    pub fn purge_arguments(&self, instance_id: InstanceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.arguments.remove(&instance_id);
    }

    /// When set, every store call fails with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.unavailable = unavailable;
    }

    /// The acknowledged instance for (client, event), if any.
    pub fn acknowledged_instance(
        &self,
        client_id: ClientId,
        event_id: EventId,
    ) -> Option<InstanceId> {
        let inner = self.inner.lock().unwrap();
        inner.acknowledgments.get(&(client_id, event_id)).copied()
    }

    /// Whether a subscription row exists for (client, event).
    pub fn has_subscription(&self, client_id: ClientId, event_id: EventId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.subscriptions.contains_key(&(client_id, event_id))
    }

    fn check_available(inner: &Inner) -> Result<(), StoreError> {
        if inner.unavailable {
            Err(StoreError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Store for MemoryStore {
    fn credentials_by_key(
        &self,
        client_key: &str,
    ) -> Result<Option<AccountCredentials>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        Ok(inner.accounts.get(client_key).cloned())
    }

    fn subscriptions(&self, client_id: ClientId) -> Result<Vec<SubscriptionRow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        let mut rows: Vec<SubscriptionRow> = inner
            .subscriptions
            .iter()
            .filter(|((client, _), _)| *client == client_id)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by_key(|row| row.event_id);
        Ok(rows)
    }

    fn add_subscription(
        &self,
        _site_id: SiteId,
        client_id: ClientId,
        sub: &NewSubscription,
    ) -> Result<AddOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        let key = (client_id, sub.event_id);
        if inner.subscriptions.contains_key(&key) {
            return Ok(AddOutcome::Conflict);
        }
        inner.subscriptions.insert(
            key,
            SubscriptionRow {
                event_id: sub.event_id,
                kind: sub.kind,
                name: sub.name.clone(),
                delivered_instance_id: None,
            },
        );
        Ok(AddOutcome::Added)
    }

    fn remove_subscription(
        &self,
        client_id: ClientId,
        event_id: EventId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        inner.subscriptions.remove(&(client_id, event_id));
        Ok(())
    }

    fn arguments(&self, instance_id: InstanceId) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        Ok(inner.arguments.get(&instance_id).cloned())
    }

    fn save_acknowledgment(
        &self,
        client_id: ClientId,
        event_id: EventId,
        instance_id: InstanceId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        inner
            .acknowledgments
            .insert((client_id, event_id), instance_id);
        if let Some(row) = inner.subscriptions.get_mut(&(client_id, event_id)) {
            row.delivered_instance_id = Some(instance_id);
        }
        Ok(())
    }
}
