//! Event subscription registry and delivery engine.
//!
//! One [`EventController`](controller::EventController) serves the event
//! module of an established channel. It tracks the client's subscriptions
//! across the three event kinds, authorizes them against the site's event
//! authority, and runs the delivery loop: fetch the next undelivered
//! instance, recover evicted argument payloads from the store (or treat a
//! missing payload as an implicit acknowledgment), send the event frame
//! with a fresh transaction uid, and hold exactly one instance in flight
//! per subscription until it is acknowledged, rejected, or redelivered by
//! the periodic monitor sweep.
//!
//! Two controller flavors share the delivery core: the registered flavor
//! persists subscriptions and reconciles them against the peer through a
//! digest challenge; the stateless-guest flavor holds no server-side state
//! and re-learns its list on every connection.

pub mod authority;
pub mod clock;
pub mod controller;
pub mod digest;

pub use authority::{EventAuthority, SubscriptionRef};
pub use clock::TickClock;
pub use controller::{
    AudienceContext, ControllerFlavor, DeliveryConfig, EventController, ControllerParams,
};
pub use digest::subscription_digest;
