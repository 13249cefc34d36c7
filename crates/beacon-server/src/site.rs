//! Site state: the declared event catalog, the client table, the
//! in-memory event ledger, and the event-authority implementation the
//! delivery engines consume.

use beacon_events::{EventAuthority, SubscriptionRef};
use beacon_types::{
    ClientId, EventDescriptor, EventId, EventInstance, EventKind, InstanceId, RoleSet, ServiceId,
    SiteId, SiteKind,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::client::Client;

/// Bound of the per-event occurrence queue held for Queueing and Private
/// events. The oldest occurrence is dropped when the queue is full.
const EVENT_QUEUE_CAP: usize = 256;

/// Stateless guests get ephemeral client ids from this range, well clear
/// of the durable ids registered clients inherit from their account.
const GUEST_CLIENT_ID_BASE: u64 = 1 << 32;

struct LogEntry {
    instance: EventInstance,
    /// Private events carry the one client they are addressed to.
    target: Option<ClientId>,
}

#[derive(Default)]
struct EventLog {
    next_instance: InstanceId,
    entries: VecDeque<LogEntry>,
}

/// One logical tenant: catalog, clients, and undelivered occurrences.
///
/// All locks are `std::sync` and held only for brief map access. The raise
/// mutex serializes raises against subscription-list materialization in
/// the attached controllers.
pub struct Site {
    id: SiteId,
    kind: SiteKind,
    catalog: RwLock<HashMap<(EventKind, String), EventDescriptor>>,
    clients: Mutex<HashMap<ClientId, Arc<Client>>>,
    ledger: Mutex<HashMap<EventId, EventLog>>,
    raise_lock: Mutex<()>,
    next_guest_id: AtomicU64,
    tick: AtomicU64,
    tick_period_secs: u64,
}

impl Site {
    pub fn new(id: SiteId, kind: SiteKind, tick_period_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            catalog: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            ledger: Mutex::new(HashMap::new()),
            raise_lock: Mutex::new(()),
            next_guest_id: AtomicU64::new(GUEST_CLIENT_ID_BASE),
            tick: AtomicU64::new(0),
            tick_period_secs,
        })
    }

    pub fn id(&self) -> SiteId {
        self.id
    }

    pub fn kind(&self) -> SiteKind {
        self.kind
    }

    pub fn tick_period_secs(&self) -> u64 {
        self.tick_period_secs
    }

    /// The coarse logical clock, advanced by the owning scheduler.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn advance_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Declares an event in the site's catalog.
    pub fn declare_event(&self, descriptor: EventDescriptor) {
        let mut catalog = self.catalog.write().unwrap();
        catalog.insert((descriptor.kind, descriptor.name.clone()), descriptor);
    }

    /// Ephemeral id for a stateless-guest session. Registered clients keep
    /// the durable id their subscription rows are keyed under.
    pub fn allocate_guest_id(&self) -> ClientId {
        self.next_guest_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a client, returning a previous session under the same id if
    /// one was displaced.
    pub fn insert_client(&self, client: Arc<Client>) -> Option<Arc<Client>> {
        let mut clients = self.clients.lock().unwrap();
        clients.insert(client.client_id(), client)
    }

    pub fn remove_client(&self, client_id: ClientId) -> Option<Arc<Client>> {
        let mut clients = self.clients.lock().unwrap();
        clients.remove(&client_id)
    }

    /// Removes a client only if the table still holds this exact session;
    /// a reconnect may already have displaced it.
    pub fn retire_client(&self, client: &Arc<Client>) -> bool {
        let mut clients = self.clients.lock().unwrap();
        match clients.get(&client.client_id()) {
            Some(current) if Arc::ptr_eq(current, client) => {
                clients.remove(&client.client_id());
                true
            }
            _ => false,
        }
    }

    pub fn client(&self, client_id: ClientId) -> Option<Arc<Client>> {
        self.clients.lock().unwrap().get(&client_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    // ── Raising occurrences ────────────────────────────────────────────

    /// Records a new occurrence of a Replacing or Queueing event and
    /// notifies attached controllers. Returns `None` when the event is not
    /// declared.
    pub fn raise(
        &self,
        kind: EventKind,
        name: &str,
        service_id: ServiceId,
        arguments: Option<Vec<u8>>,
    ) -> Option<InstanceId> {
        self.record(kind, name, service_id, arguments, false, None)
    }

    /// Records an explicit Replacing reset occurrence (no argument field
    /// on the wire).
    pub fn raise_null(&self, name: &str, service_id: ServiceId) -> Option<InstanceId> {
        self.record(EventKind::Replacing, name, service_id, None, true, None)
    }

    /// Records a Private occurrence addressed to one client.
    pub fn raise_private(
        &self,
        name: &str,
        target: ClientId,
        service_id: ServiceId,
        arguments: Option<Vec<u8>>,
    ) -> Option<InstanceId> {
        self.record(
            EventKind::Private,
            name,
            service_id,
            arguments,
            false,
            Some(target),
        )
    }

    fn record(
        &self,
        kind: EventKind,
        name: &str,
        service_id: ServiceId,
        arguments: Option<Vec<u8>>,
        is_null: bool,
        target: Option<ClientId>,
    ) -> Option<InstanceId> {
        let descriptor = self.resolve(kind, name)?;
        let event_id = descriptor.event_id;

        let instance_id = {
            let _raise = self.raise_lock.lock().unwrap();
            let mut ledger = self.ledger.lock().unwrap();
            let log = ledger.entry(event_id).or_default();
            log.next_instance += 1;
            let instance_id = log.next_instance;
            let instance = EventInstance {
                instance_id,
                event_id,
                service_id,
                created_tick: self.current_tick(),
                created_at: chrono::Utc::now().timestamp(),
                has_arguments: arguments.is_some(),
                arguments,
                is_null,
            };
            match kind {
                // Latest-value semantics: a new occurrence supersedes any
                // undelivered prior one.
                EventKind::Replacing => {
                    log.entries.clear();
                    log.entries.push_back(LogEntry { instance, target });
                }
                _ => {
                    if log.entries.len() >= EVENT_QUEUE_CAP {
                        tracing::warn!(event_id, "event queue full, dropping oldest occurrence");
                        log.entries.pop_front();
                    }
                    log.entries.push_back(LogEntry { instance, target });
                }
            }
            instance_id
        };

        tracing::debug!(event_id, instance_id, kind = ?kind, "event raised");
        self.notify(kind, event_id, target);
        Some(instance_id)
    }

    /// Pushes the raise to attached controllers. Controllers that are not
    /// synchronized, not authorized, or mid-delivery drop the push and
    /// pick the occurrence up on their next fetch.
    fn notify(&self, kind: EventKind, event_id: EventId, target: Option<ClientId>) {
        let clients: Vec<Arc<Client>> = {
            let clients = self.clients.lock().unwrap();
            match target {
                Some(target) => clients.get(&target).cloned().into_iter().collect(),
                None => clients.values().cloned().collect(),
            }
        };
        for client in clients {
            if let Some(events) = client.events() {
                events.on_event_raised(kind, event_id);
            }
        }
    }

    /// Drops cached argument payloads from the ledger (the instances keep
    /// their has-arguments flag), simulating cache rotation. Deliveries
    /// then fall back to the persistent store.
    pub fn evict_cached_arguments(&self, event_id: EventId) {
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(log) = ledger.get_mut(&event_id) {
            for entry in log.entries.iter_mut() {
                entry.instance.arguments = None;
            }
        }
    }
}

impl EventAuthority for Site {
    fn resolve(&self, kind: EventKind, name: &str) -> Option<EventDescriptor> {
        self.catalog
            .read()
            .unwrap()
            .get(&(kind, name.to_string()))
            .cloned()
    }

    fn authorize(&self, descriptor: &EventDescriptor, roles: &RoleSet) -> bool {
        // An empty audience means the event is open to every role.
        descriptor.audience.is_empty() || roles.intersects(&descriptor.audience)
    }

    fn next_event(&self, sub: &SubscriptionRef) -> Option<EventInstance> {
        let ledger = self.ledger.lock().unwrap();
        let log = ledger.get(&sub.event_id)?;
        let mut candidates = log.entries.iter().filter(|entry| {
            sub.after
                .is_none_or(|after| entry.instance.instance_id > after)
                && match sub.kind {
                    EventKind::Private => entry.target == Some(sub.client_id),
                    _ => true,
                }
        });
        match sub.kind {
            EventKind::Replacing => candidates.last().map(|entry| entry.instance.clone()),
            _ => candidates.next().map(|entry| entry.instance.clone()),
        }
    }

    fn raise_lock(&self) -> &Mutex<()> {
        &self.raise_lock
    }
}
