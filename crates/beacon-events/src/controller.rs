//! The per-client event controller: subscription registry, delivery
//! engine, acknowledgment reconciliation, and the redelivery monitor.
//!
//! # Locking
//!
//! A single controller-level `std::sync::Mutex` guards every
//! read-modify-write of subscription membership, in-flight state, and the
//! in-flight counter. It is held only for brief map/field access, never
//! across an `.await`. Store and authority round-trips run in
//! `spawn_blocking` between lock acquisitions, and every re-entry
//! re-validates the subscription (presence + epoch) before mutating,
//! because the subscription may have been torn down while the I/O was in
//! flight.
//!
//! # Delivery
//!
//! All trigger sites — sync completion, acknowledgment, authorization
//! change, event-raised push, and subscription add — funnel into one
//! delivery routine ([`EventController::run_delivery`]). The `fetching`
//! flag plus the in-flight slot enforce that a subscription never has more
//! than one delivery sequence active, and the per-record epoch lets stale
//! continuations detect a concurrent remove/re-add and abandon themselves.

use beacon_session::channel::Channel;
use beacon_store::{AddOutcome, NewSubscription, Store, StoreError};
use beacon_types::{
    ClientId, EventId, EventInstance, EventKind, InstanceId, RoleSet, SiteId, SubscriptionSpec,
    UserId, UserKind,
};
use beacon_session::channel::ModuleHandler;
use beacon_wire::events::{EventDelivery, EventMessage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::authority::{EventAuthority, SubscriptionRef};
use crate::clock::TickClock;
use crate::digest::subscription_digest;

/// Delivery tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// How long a delivered instance may stay unacknowledged before the
    /// monitor resends it under a fresh transaction uid.
    pub redelivery_window: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            redelivery_window: Duration::from_secs(300),
        }
    }
}

/// The two controller flavors sharing the delivery core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerFlavor {
    /// Subscriptions persist in the store and reconcile through the digest
    /// challenge.
    Registered,
    /// No server-held state; the peer supplies its list each connection.
    /// Private events are not available to this flavor.
    StatelessGuest,
}

/// Identity of the session the controller serves.
#[derive(Debug, Clone)]
pub struct AudienceContext {
    pub site_id: SiteId,
    pub client_id: ClientId,
    pub user_id: UserId,
    pub user_kind: UserKind,
}

/// Construction parameters for [`EventController`].
pub struct ControllerParams {
    pub flavor: ControllerFlavor,
    pub ctx: AudienceContext,
    pub roles: RoleSet,
    pub store: Arc<dyn Store>,
    pub authority: Arc<dyn EventAuthority>,
    pub channel: Arc<Channel>,
    pub clock: TickClock,
    pub config: DeliveryConfig,
}

struct InFlight {
    instance: EventInstance,
    tx_uid: Uuid,
    expires_at: Instant,
}

struct Subscription {
    event_id: EventId,
    kind: EventKind,
    name: String,
    authorized: bool,
    /// A delivery sequence (fetch → maybe argument recovery → send) is
    /// active for this record.
    fetching: bool,
    /// Guards against continuations outliving a remove/re-add of the same
    /// event id.
    epoch: u64,
    in_flight: Option<InFlight>,
    delivered: Option<InstanceId>,
}

#[derive(Default)]
struct ControllerState {
    synchronized: bool,
    subs: HashMap<EventId, Subscription>,
    by_name: HashMap<(EventKind, String), EventId>,
    in_flight_total: usize,
    epoch_counter: u64,
}

impl ControllerState {
    fn next_epoch(&mut self) -> u64 {
        self.epoch_counter += 1;
        self.epoch_counter
    }

    /// Removes a record from both indexes; the caller decides what happens
    /// to the store row.
    fn remove_record(&mut self, event_id: EventId) -> Option<Subscription> {
        let sub = self.subs.remove(&event_id)?;
        self.by_name.remove(&(sub.kind, sub.name.clone()));
        if sub.in_flight.is_some() {
            self.in_flight_total -= 1;
        }
        Some(sub)
    }
}

/// The event module of one established channel.
pub struct EventController {
    flavor: ControllerFlavor,
    ctx: AudienceContext,
    roles: Mutex<RoleSet>,
    store: Arc<dyn Store>,
    authority: Arc<dyn EventAuthority>,
    channel: Arc<Channel>,
    clock: TickClock,
    config: DeliveryConfig,
    state: Mutex<ControllerState>,
    /// Back-reference for spawning delivery tasks from `&self` contexts
    /// without keeping the controller alive from its own closures.
    weak_self: Weak<EventController>,
}

impl EventController {
    pub fn new(params: ControllerParams) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<EventController>| Self {
            flavor: params.flavor,
            ctx: params.ctx,
            roles: Mutex::new(params.roles),
            store: params.store,
            authority: params.authority,
            channel: params.channel,
            clock: params.clock,
            config: params.config,
            state: Mutex::new(ControllerState::default()),
            weak_self: weak.clone(),
        })
    }

    /// Hooks the controller into its channel: the redelivery monitor rides
    /// the channel's liveness sweep, teardown follows channel closure, and
    /// the flavor-specific synchronization starts.
    pub fn attach(&self) {
        let weak = self.weak_self.clone();
        self.channel.register_monitor(Box::new(move || {
            if let Some(controller) = weak.upgrade() {
                controller.monitor();
            }
        }));

        let weak = self.weak_self.clone();
        let mut closed = self.channel.closed();
        tokio::spawn(async move {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            if let Some(controller) = weak.upgrade() {
                controller.shutdown();
            }
        });

        match self.flavor {
            ControllerFlavor::Registered => {
                if let Some(controller) = self.weak_self.upgrade() {
                    tokio::spawn(controller.bootstrap_registered());
                }
            }
            ControllerFlavor::StatelessGuest => {
                self.channel.send(EventMessage::Sync { digest: None }.encode());
            }
        }
    }

    // ── Introspection (used by the installer and tests) ────────────────

    pub fn flavor(&self) -> ControllerFlavor {
        self.flavor
    }

    pub fn in_flight_total(&self) -> usize {
        self.state.lock().unwrap().in_flight_total
    }

    pub fn is_synchronized(&self) -> bool {
        self.state.lock().unwrap().synchronized
    }

    pub fn has_subscription(&self, kind: EventKind, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .by_name
            .contains_key(&(kind, name.to_string()))
    }

    pub fn delivered_cursor(&self, event_id: EventId) -> Option<InstanceId> {
        self.state
            .lock()
            .unwrap()
            .subs
            .get(&event_id)
            .and_then(|sub| sub.delivered)
    }

    // ── Bootstrap & synchronization ────────────────────────────────────

    async fn bootstrap_registered(self: Arc<Self>) {
        let client_id = self.ctx.client_id;
        let rows = match self.store_call(move |s| s.subscriptions(client_id)).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(client_id, "loading persisted subscriptions failed: {}", e);
                self.channel.close_graceful(e.error_code());
                return;
            }
        };
        if self.channel.is_closed() {
            return;
        }

        // Authorization consults the authority outside any lock.
        let prepared: Vec<_> = rows
            .into_iter()
            .map(|row| {
                let authorized = self.initial_authorization(row.kind, &row.name);
                (row, authorized)
            })
            .collect();

        let digest = {
            // Serialize list materialization against concurrent raises.
            let _materialize = self.authority.raise_lock().lock().unwrap();
            let mut state = self.state.lock().unwrap();
            for (row, authorized) in prepared {
                let epoch = state.next_epoch();
                state
                    .by_name
                    .insert((row.kind, row.name.clone()), row.event_id);
                state.subs.insert(
                    row.event_id,
                    Subscription {
                        event_id: row.event_id,
                        kind: row.kind,
                        name: row.name,
                        authorized,
                        fetching: false,
                        epoch,
                        in_flight: None,
                        delivered: row.delivered_instance_id,
                    },
                );
            }
            let pairs: Vec<(EventKind, String)> = state
                .subs
                .values()
                .map(|sub| (sub.kind, sub.name.clone()))
                .collect();
            subscription_digest(&pairs)
        };

        self.channel
            .send(EventMessage::Sync {
                digest: Some(digest),
            }
            .encode());
    }

    fn handle_sync_ok(&self) {
        let started = {
            let mut state = self.state.lock().unwrap();
            if state.synchronized {
                tracing::debug!("duplicate sync acceptance ignored");
                return;
            }
            state.synchronized = true;
            Self::begin_all_idle(&mut state)
        };
        for (event_id, epoch) in started {
            self.spawn_delivery(event_id, epoch);
        }
    }

    /// Starts a delivery for every authorized, idle subscription.
    fn begin_all_idle(state: &mut ControllerState) -> Vec<(EventId, u64)> {
        let mut started = Vec::new();
        for sub in state.subs.values_mut() {
            if sub.authorized && !sub.fetching && sub.in_flight.is_none() {
                sub.fetching = true;
                started.push((sub.event_id, sub.epoch));
            }
        }
        started
    }

    async fn apply_subscription_list(self: Arc<Self>, entries: Vec<SubscriptionSpec>) {
        // Registered flavor: the list is a full replacement of the
        // persisted set. Anything persisted but absent gets deleted.
        if self.flavor == ControllerFlavor::Registered {
            let incoming: HashSet<(EventKind, String)> = entries
                .iter()
                .map(|entry| (entry.kind, entry.name.clone()))
                .collect();
            let stale: Vec<EventId> = {
                let state = self.state.lock().unwrap();
                state
                    .subs
                    .values()
                    .filter(|sub| !incoming.contains(&(sub.kind, sub.name.clone())))
                    .map(|sub| sub.event_id)
                    .collect()
            };
            for event_id in stale {
                {
                    let mut state = self.state.lock().unwrap();
                    state.remove_record(event_id);
                }
                let client_id = self.ctx.client_id;
                if let Err(e) = self
                    .store_call(move |s| s.remove_subscription(client_id, event_id))
                    .await
                {
                    tracing::error!(event_id, "deleting stale subscription failed: {}", e);
                    self.channel.close_graceful(e.error_code());
                    return;
                }
            }
        }

        for entry in entries {
            if self.channel.is_closed() {
                return;
            }
            self.admit_subscription(&entry, entry.last_delivered, false)
                .await;
        }

        let started = {
            // Serialize the synchronization point against concurrent
            // raises: anything raised before this commit is picked up by
            // the initial fetches below, anything after arrives as a push.
            let _materialize = self.authority.raise_lock().lock().unwrap();
            let mut state = self.state.lock().unwrap();
            state.synchronized = true;
            Self::begin_all_idle(&mut state)
        };
        for (event_id, epoch) in started {
            self.spawn_delivery(event_id, epoch);
        }
    }

    /// Validates, persists (registered flavor), and registers one
    /// subscription. `report_duplicates` controls whether an entry already
    /// held in memory is answered with `ILLEGAL_SUBSCRIPTION` (runtime
    /// adds) or silently kept (list reconciliation).
    async fn admit_subscription(
        &self,
        entry: &SubscriptionSpec,
        cursor: Option<InstanceId>,
        report_duplicates: bool,
    ) {
        let illegal = |name: &str| {
            self.channel.send(
                EventMessage::IllegalSubscription {
                    name: name.to_string(),
                }
                .encode(),
            );
        };

        {
            let state = self.state.lock().unwrap();
            if state
                .by_name
                .contains_key(&(entry.kind, entry.name.clone()))
            {
                if report_duplicates {
                    tracing::debug!(name = %entry.name, "duplicate subscription rejected");
                    illegal(&entry.name);
                }
                return;
            }
        }

        // Private events are scoped to a registered client id; a stateless
        // guest has none to scope to.
        if self.flavor == ControllerFlavor::StatelessGuest && entry.kind == EventKind::Private {
            tracing::debug!(name = %entry.name, "private subscription refused for guest");
            illegal(&entry.name);
            return;
        }

        let Some(descriptor) = self.authority.resolve(entry.kind, &entry.name) else {
            tracing::debug!(name = %entry.name, kind = ?entry.kind, "subscription to undeclared event");
            illegal(&entry.name);
            return;
        };

        if self.flavor == ControllerFlavor::Registered {
            let site_id = self.ctx.site_id;
            let client_id = self.ctx.client_id;
            let new_sub = NewSubscription {
                event_id: descriptor.event_id,
                kind: entry.kind,
                name: entry.name.clone(),
            };
            match self
                .store_call(move |s| s.add_subscription(site_id, client_id, &new_sub))
                .await
            {
                Ok(AddOutcome::Added) => {}
                Ok(AddOutcome::Conflict) => {
                    tracing::debug!(name = %entry.name, "subscription row already exists");
                    illegal(&entry.name);
                    return;
                }
                Err(e) => {
                    tracing::error!(name = %entry.name, "persisting subscription failed: {}", e);
                    self.channel.close_graceful(e.error_code());
                    return;
                }
            }
        }

        let authorized = match entry.kind {
            // Fixed at creation: the catalog lookup above is the check.
            EventKind::Private => true,
            _ => {
                let roles = self.roles.lock().unwrap().clone();
                self.authority.authorize(&descriptor, &roles)
            }
        };

        let started = {
            let mut state = self.state.lock().unwrap();
            // Re-check under the lock; a concurrent add may have won.
            if state
                .by_name
                .contains_key(&(entry.kind, entry.name.clone()))
            {
                return;
            }
            let epoch = state.next_epoch();
            let begin = authorized && state.synchronized;
            state
                .by_name
                .insert((entry.kind, entry.name.clone()), descriptor.event_id);
            state.subs.insert(
                descriptor.event_id,
                Subscription {
                    event_id: descriptor.event_id,
                    kind: entry.kind,
                    name: entry.name.clone(),
                    authorized,
                    fetching: begin,
                    epoch,
                    in_flight: None,
                    delivered: cursor,
                },
            );
            begin.then_some((descriptor.event_id, epoch))
        };
        if let Some((event_id, epoch)) = started {
            self.spawn_delivery(event_id, epoch);
        }
    }

    fn handle_remove(&self, kind: EventKind, name: String) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            match state.by_name.get(&(kind, name.clone())).copied() {
                Some(event_id) => {
                    state.remove_record(event_id);
                    Some(event_id)
                }
                None => None,
            }
        };
        let Some(event_id) = removed else {
            tracing::debug!(name = %name, "removal of unknown subscription ignored");
            return;
        };
        tracing::debug!(name = %name, event_id, "subscription removed");

        if self.flavor == ControllerFlavor::Registered {
            let store = self.store.clone();
            let client_id = self.ctx.client_id;
            tokio::spawn(async move {
                let result = tokio::task::spawn_blocking(move || {
                    store.remove_subscription(client_id, event_id)
                })
                .await;
                if let Ok(Err(e)) = result {
                    tracing::warn!(event_id, "deleting subscription row failed: {}", e);
                }
            });
        }
    }

    // ── Acknowledgment & rejection ─────────────────────────────────────

    async fn handle_ack(self: Arc<Self>, kind: EventKind, event_id: EventId, tx_uid: Uuid) {
        let (instance_id, epoch) = {
            let state = self.state.lock().unwrap();
            let Some(sub) = state.subs.get(&event_id) else {
                tracing::debug!(event_id, "ack for unknown subscription ignored");
                return;
            };
            if sub.kind != kind {
                tracing::debug!(event_id, "ack kind mismatch ignored");
                return;
            }
            let Some(in_flight) = &sub.in_flight else {
                tracing::debug!(event_id, "ack with nothing in flight ignored");
                return;
            };
            if in_flight.tx_uid != tx_uid {
                tracing::debug!(event_id, "stale ack ignored");
                return;
            }
            (in_flight.instance.instance_id, sub.epoch)
        };

        if self.flavor == ControllerFlavor::Registered {
            let client_id = self.ctx.client_id;
            if let Err(e) = self
                .store_call(move |s| s.save_acknowledgment(client_id, event_id, instance_id))
                .await
            {
                tracing::error!(event_id, instance_id, "persisting acknowledgment failed: {}", e);
                // Abort this continuation: clear the slot, do not advance
                // the cursor, do not reschedule. The next monitor sweep or
                // authorization change retries.
                let mut guard = self.state.lock().unwrap();
                let state = &mut *guard;
                if let Some(sub) = state.subs.get_mut(&event_id) {
                    if sub.epoch == epoch
                        && sub
                            .in_flight
                            .as_ref()
                            .is_some_and(|f| f.tx_uid == tx_uid)
                    {
                        sub.in_flight = None;
                        state.in_flight_total -= 1;
                    }
                }
                return;
            }
        }

        let next = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let Some(sub) = state.subs.get_mut(&event_id) else {
                return;
            };
            if sub.epoch != epoch {
                return;
            }
            match &sub.in_flight {
                Some(in_flight) if in_flight.tx_uid == tx_uid => {}
                // A redelivery superseded this uid while the ack was being
                // persisted; the late ack no longer clears anything.
                _ => {
                    tracing::debug!(event_id, "delivery superseded during ack persist");
                    return;
                }
            }
            sub.in_flight = None;
            sub.delivered = Some(instance_id);
            let begin = sub.authorized && !sub.fetching;
            if begin {
                sub.fetching = true;
            }
            let epoch = sub.epoch;
            state.in_flight_total -= 1;
            begin.then_some(epoch)
        };
        if let Some(epoch) = next {
            self.spawn_delivery(event_id, epoch);
        }
    }

    fn handle_reject(&self, kind: EventKind, event_id: EventId, tx_uid: Uuid) {
        let matched = {
            let mut state = self.state.lock().unwrap();
            let matches = state.subs.get(&event_id).is_some_and(|sub| {
                sub.kind == kind
                    && sub
                        .in_flight
                        .as_ref()
                        .is_some_and(|in_flight| in_flight.tx_uid == tx_uid)
            });
            if matches {
                state.remove_record(event_id);
            }
            matches
        };
        if !matched {
            tracing::debug!(event_id, "rejection without matching delivery ignored");
            return;
        }
        tracing::info!(event_id, "client rejected delivery, subscription removed");

        // A rejection is a terminal client-initiated unsubscribe; the row
        // goes away but no acknowledgment is recorded.
        if self.flavor == ControllerFlavor::Registered {
            let store = self.store.clone();
            let client_id = self.ctx.client_id;
            tokio::spawn(async move {
                let result = tokio::task::spawn_blocking(move || {
                    store.remove_subscription(client_id, event_id)
                })
                .await;
                if let Ok(Err(e)) = result {
                    tracing::warn!(event_id, "deleting rejected subscription failed: {}", e);
                }
            });
        }
    }

    // ── Redelivery & external triggers ─────────────────────────────────

    /// Redelivery sweep, invoked from the owning channel's liveness check:
    /// every expired in-flight delivery is resent under a fresh transaction
    /// uid. The superseded uid becomes permanently stale.
    pub fn monitor(&self) {
        let now = Instant::now();
        let resends = {
            let mut state = self.state.lock().unwrap();
            let mut resends = Vec::new();
            for sub in state.subs.values_mut() {
                if let Some(in_flight) = &mut sub.in_flight {
                    if now >= in_flight.expires_at {
                        in_flight.tx_uid = Uuid::new_v4();
                        in_flight.expires_at = now + self.config.redelivery_window;
                        resends.push((
                            sub.kind,
                            sub.name.clone(),
                            sub.event_id,
                            in_flight.instance.clone(),
                            in_flight.tx_uid,
                        ));
                    }
                }
            }
            resends
        };
        for (kind, name, event_id, instance, tx_uid) in resends {
            tracing::debug!(
                event_id,
                instance_id = instance.instance_id,
                "redelivering unacknowledged instance"
            );
            self.channel
                .send(self.delivery_frame(kind, &name, &instance, tx_uid));
        }
    }

    /// Push from the event authority: a new instance was raised. Only
    /// accepted when the controller has synchronized, the subscription is
    /// authorized, and nothing is in flight — otherwise dropped, and the
    /// poll-driven fetch picks the instance up later.
    pub fn on_event_raised(&self, kind: EventKind, event_id: EventId) {
        if self.flavor == ControllerFlavor::StatelessGuest && kind == EventKind::Private {
            tracing::debug!(event_id, "private push dropped for guest controller");
            return;
        }
        let started = {
            let mut state = self.state.lock().unwrap();
            if !state.synchronized {
                tracing::debug!(event_id, "push before synchronization dropped");
                return;
            }
            let Some(sub) = state.subs.get_mut(&event_id) else {
                return;
            };
            if sub.kind != kind || !sub.authorized || sub.fetching || sub.in_flight.is_some() {
                return;
            }
            sub.fetching = true;
            (event_id, sub.epoch)
        };
        self.spawn_delivery(started.0, started.1);
    }

    /// The client's role set changed: re-authorize every Replacing and
    /// Queueing subscription. Private authorization is fixed at creation.
    pub fn on_authority_updated(&self, roles: RoleSet) {
        *self.roles.lock().unwrap() = roles;

        let candidates: Vec<(EventId, EventKind, String)> = {
            let state = self.state.lock().unwrap();
            state
                .subs
                .values()
                .filter(|sub| sub.kind != EventKind::Private)
                .map(|sub| (sub.event_id, sub.kind, sub.name.clone()))
                .collect()
        };

        let decisions: Vec<(EventId, bool)> = candidates
            .into_iter()
            .map(|(event_id, kind, name)| (event_id, self.initial_authorization(kind, &name)))
            .collect();

        let started = {
            let mut state = self.state.lock().unwrap();
            let mut started = Vec::new();
            let synchronized = state.synchronized;
            for (event_id, authorized) in decisions {
                let Some(sub) = state.subs.get_mut(&event_id) else {
                    continue;
                };
                if sub.authorized != authorized {
                    tracing::info!(event_id, authorized, "subscription authorization changed");
                }
                sub.authorized = authorized;
                if authorized
                    && synchronized
                    && !sub.fetching
                    && sub.in_flight.is_none()
                {
                    sub.fetching = true;
                    started.push((event_id, sub.epoch));
                }
            }
            started
        };
        for (event_id, epoch) in started {
            self.spawn_delivery(event_id, epoch);
        }
    }

    /// Channel teardown: every record is dropped, which any in-flight
    /// continuation observes as removal on its next lock re-entry.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        let count = state.subs.len();
        state.subs.clear();
        state.by_name.clear();
        state.in_flight_total = 0;
        state.synchronized = false;
        tracing::debug!(count, "event controller shut down");
    }

    // ── Delivery core ──────────────────────────────────────────────────

    fn spawn_delivery(&self, event_id: EventId, epoch: u64) {
        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(controller.run_delivery(event_id, epoch));
    }

    /// The single delivery routine shared by every trigger site.
    ///
    /// Entered with the subscription's `fetching` flag held. Loops only
    /// when an instance resolves to an implicit acknowledgment (evicted
    /// payload); otherwise one pass either sends one frame or stops.
    async fn run_delivery(self: Arc<Self>, event_id: EventId, epoch: u64) {
        loop {
            if self.channel.is_closed() {
                self.end_fetch(event_id, epoch);
                return;
            }

            let (kind, name, after) = {
                let mut state = self.state.lock().unwrap();
                let Some(sub) = state.subs.get_mut(&event_id) else {
                    return;
                };
                if sub.epoch != epoch {
                    return;
                }
                if !sub.authorized || sub.in_flight.is_some() {
                    sub.fetching = false;
                    return;
                }
                (sub.kind, sub.name.clone(), sub.delivered)
            };

            let sub_ref = SubscriptionRef {
                client_id: self.ctx.client_id,
                event_id,
                kind,
                after,
            };
            let authority = self.authority.clone();
            let next =
                match tokio::task::spawn_blocking(move || authority.next_event(&sub_ref)).await {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!(event_id, "next-event lookup task failed: {}", e);
                        self.end_fetch(event_id, epoch);
                        return;
                    }
                };
            let Some(mut instance) = next else {
                self.end_fetch(event_id, epoch);
                return;
            };

            // The authority contract forbids this; never trust it enough
            // to re-deliver behind the cursor.
            if after.is_some_and(|cursor| instance.instance_id <= cursor) {
                tracing::warn!(
                    event_id,
                    instance_id = instance.instance_id,
                    "authority returned an instance at or behind the cursor"
                );
                self.end_fetch(event_id, epoch);
                return;
            }

            if instance.needs_argument_fetch() {
                let instance_id = instance.instance_id;
                match self.store_call(move |s| s.arguments(instance_id)).await {
                    Ok(Some(payload)) => instance.arguments = Some(payload),
                    Ok(None) => {
                        // Payload expired out of the store. Acknowledge on
                        // the client's behalf and continue with whatever
                        // comes next; the peer never sees this instance.
                        tracing::debug!(
                            event_id,
                            instance_id,
                            "argument payload evicted, implicit acknowledgment"
                        );
                        if self.flavor == ControllerFlavor::Registered {
                            let client_id = self.ctx.client_id;
                            if let Err(e) = self
                                .store_call(move |s| {
                                    s.save_acknowledgment(client_id, event_id, instance_id)
                                })
                                .await
                            {
                                tracing::error!(
                                    event_id,
                                    "implicit acknowledgment failed: {}",
                                    e
                                );
                                self.end_fetch(event_id, epoch);
                                return;
                            }
                        }
                        let mut state = self.state.lock().unwrap();
                        let Some(sub) = state.subs.get_mut(&event_id) else {
                            return;
                        };
                        if sub.epoch != epoch {
                            return;
                        }
                        sub.delivered = Some(instance_id);
                        if !sub.authorized {
                            sub.fetching = false;
                            return;
                        }
                        drop(state);
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(event_id, "argument fetch failed: {}", e);
                        self.end_fetch(event_id, epoch);
                        return;
                    }
                }
            }

            let tx_uid = Uuid::new_v4();
            let frame = self.delivery_frame(kind, &name, &instance, tx_uid);
            {
                let mut guard = self.state.lock().unwrap();
                let state = &mut *guard;
                let Some(sub) = state.subs.get_mut(&event_id) else {
                    return;
                };
                if sub.epoch != epoch {
                    return;
                }
                if !sub.authorized || sub.in_flight.is_some() {
                    sub.fetching = false;
                    return;
                }
                sub.fetching = false;
                sub.in_flight = Some(InFlight {
                    instance,
                    tx_uid,
                    expires_at: Instant::now() + self.config.redelivery_window,
                });
                state.in_flight_total += 1;
            }
            self.channel.send(frame);
            return;
        }
    }

    /// Clears the `fetching` flag if the record still belongs to this
    /// continuation.
    fn end_fetch(&self, event_id: EventId, epoch: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(sub) = state.subs.get_mut(&event_id) {
            if sub.epoch == epoch {
                sub.fetching = false;
            }
        }
    }

    fn delivery_frame(
        &self,
        kind: EventKind,
        name: &str,
        instance: &EventInstance,
        tx_uid: Uuid,
    ) -> Vec<u8> {
        let age_secs = self
            .clock
            .age_secs(instance.created_tick, chrono::Utc::now().timestamp());
        let delivery = EventDelivery {
            name: name.to_string(),
            event_id: instance.event_id,
            tx_uid,
            instance_id: instance.instance_id,
            service_id: instance.service_id,
            age_secs,
            created_at: instance.created_at,
            arguments: instance.arguments.clone(),
        };
        let message = if kind == EventKind::Replacing && instance.is_null {
            EventMessage::ReplacingNull { delivery }
        } else {
            EventMessage::Event { kind, delivery }
        };
        message.encode()
    }

    fn initial_authorization(&self, kind: EventKind, name: &str) -> bool {
        let Some(descriptor) = self.authority.resolve(kind, name) else {
            tracing::warn!(name = %name, "subscribed event no longer declared");
            return false;
        };
        match kind {
            EventKind::Private => true,
            _ => {
                let roles = self.roles.lock().unwrap().clone();
                self.authority.authorize(&descriptor, &roles)
            }
        }
    }

    async fn store_call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || f(store.as_ref())).await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Unavailable(format!(
                "store task failed: {e}"
            ))),
        }
    }
}

impl ModuleHandler for EventController {
    fn on_frame(self: Arc<Self>, channel: &Arc<Channel>, op: u8, body: Vec<u8>) {
        let message = match EventMessage::decode(op, &body) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "malformed event frame");
                channel.close_hard();
                return;
            }
        };

        match message {
            EventMessage::SyncOk => self.handle_sync_ok(),
            EventMessage::Subscriptions { entries } => {
                let controller = self.clone();
                tokio::spawn(controller.apply_subscription_list(entries));
            }
            EventMessage::AddSubscription { kind, name } => {
                let controller = self.clone();
                tokio::spawn(async move {
                    let entry = SubscriptionSpec {
                        kind,
                        name,
                        last_delivered: None,
                    };
                    controller.admit_subscription(&entry, None, true).await;
                });
            }
            EventMessage::RemoveSubscription { kind, name } => self.handle_remove(kind, name),
            EventMessage::Ack {
                kind,
                event_id,
                tx_uid,
            } => {
                let controller = self.clone();
                tokio::spawn(controller.handle_ack(kind, event_id, tx_uid));
            }
            EventMessage::Rejected {
                kind,
                event_id,
                tx_uid,
            } => self.handle_reject(kind, event_id, tx_uid),
            // Server-to-client operations arriving inbound are out of
            // contract.
            _ => {
                tracing::debug!("unexpected event operation from peer");
                channel.close_hard();
            }
        }
    }
}
