//! The per-connection channel: module multiplexing, liveness tracking,
//! and the two-speed shutdown paths.

use beacon_types::{AddressFamily, ErrorCode};
use beacon_wire::session::SessionMessage;
use beacon_wire::{FrameHeader, MAX_HANDSHAKE_FRAME_LEN, MODULE_LIVENESS, MODULE_SESSION,
    MODULE_SLOTS, PROTOCOL_VERSION};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::SessionError;
use crate::timer::{self, TimerHandle};

/// Timing and queue tunables for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// The handshake must complete within this window or the channel is
    /// forced closed.
    pub handshake_timeout: Duration,

    /// After a graceful shutdown frame, the peer gets this long to close
    /// its side first.
    pub shutdown_grace: Duration,

    /// Liveness window; refreshed by every inbound frame.
    pub ping_window: Duration,

    /// Cadence of the liveness/monitor sweep.
    pub sweep_interval: Duration,

    /// Depth of the bounded outbound frame queue.
    pub outbound_queue: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(20),
            ping_window: Duration::from_secs(395),
            sweep_interval: Duration::from_secs(10),
            outbound_queue: 256,
        }
    }
}

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created; the session module owns all traffic.
    Handshaking,
    /// Handshake complete; steady-state dispatch.
    Active,
    /// Graceful shutdown sent; waiting for the peer to close.
    Completing,
    /// Terminal.
    Closed,
}

/// A protocol module bound into the channel's slot table.
///
/// `on_frame` must not block: implementations spawn their own tasks for
/// store round-trips and other async work, re-checking channel state after
/// every suspension point.
pub trait ModuleHandler: Send + Sync {
    fn on_frame(self: Arc<Self>, channel: &Arc<Channel>, op: u8, body: Vec<u8>);
}

type ModuleTable = [Option<Arc<dyn ModuleHandler>>; MODULE_SLOTS];

/// Transport-independent session abstraction for one accepted connection.
///
/// All locks here are `std::sync` and held only for brief map/field access,
/// never across an `.await` point.
pub struct Channel {
    config: ChannelConfig,
    version: u8,
    family: Mutex<AddressFamily>,
    outbound: mpsc::Sender<Vec<u8>>,
    state: Mutex<ChannelState>,
    channel_id: Mutex<Option<uuid::Uuid>>,
    expires_at: Mutex<Instant>,
    modules: RwLock<ModuleTable>,
    handshake_timer: Mutex<Option<TimerHandle>>,
    grace_timer: Mutex<Option<TimerHandle>>,
    monitors: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    closed_tx: watch::Sender<bool>,
    /// Back-reference for handing `Arc<Channel>` to module handlers and
    /// timer closures without keeping the channel alive from them.
    weak_self: Weak<Channel>,
}

impl Channel {
    /// Creates a channel in the handshaking state and starts its handshake
    /// timeout and liveness sweep.
    pub fn new(outbound: mpsc::Sender<Vec<u8>>, config: ChannelConfig) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        let channel = Arc::new_cyclic(|weak: &Weak<Channel>| Self {
            config,
            version: PROTOCOL_VERSION,
            family: Mutex::new(AddressFamily::Unspecified),
            outbound,
            state: Mutex::new(ChannelState::Handshaking),
            channel_id: Mutex::new(None),
            expires_at: Mutex::new(Instant::now() + config.ping_window),
            modules: RwLock::new(std::array::from_fn(|_| None)),
            handshake_timer: Mutex::new(None),
            grace_timer: Mutex::new(None),
            monitors: Mutex::new(Vec::new()),
            closed_tx,
            weak_self: weak.clone(),
        });

        let weak = Arc::downgrade(&channel);
        let handle = timer::schedule(config.handshake_timeout, move || {
            if let Some(channel) = weak.upgrade() {
                if channel.state() == ChannelState::Handshaking {
                    tracing::warn!("handshake did not complete in time, closing channel");
                    channel.close_hard();
                }
            }
        });
        *channel.handshake_timer.lock().unwrap() = Some(handle);

        Self::spawn_sweep(&channel);
        channel
    }

    /// Periodic sweep: forces expired channels closed and runs registered
    /// monitors (redelivery checks) while the channel lives.
    fn spawn_sweep(channel: &Arc<Self>) {
        let weak: Weak<Channel> = Arc::downgrade(channel);
        let period = channel.config.sweep_interval;
        tokio::spawn(async move {
            let start = Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(channel) = weak.upgrade() else { break };
                if channel.state() == ChannelState::Closed {
                    break;
                }
                if channel.is_expired() {
                    tracing::info!("liveness window elapsed, closing channel");
                    channel.close_hard();
                    break;
                }
                let monitors = channel.monitors.lock().unwrap();
                for monitor in monitors.iter() {
                    monitor();
                }
            }
        });
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The protocol version negotiated at connection entry.
    pub fn protocol_version(&self) -> u8 {
        self.version
    }

    /// Address family of the underlying transport, recorded by whoever
    /// accepted the connection.
    pub fn address_family(&self) -> AddressFamily {
        *self.family.lock().unwrap()
    }

    pub fn set_address_family(&self, family: AddressFamily) {
        *self.family.lock().unwrap() = family;
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    /// The established channel id, once minted or restored.
    pub fn channel_id(&self) -> Option<uuid::Uuid> {
        *self.channel_id.lock().unwrap()
    }

    pub fn set_channel_id(&self, id: uuid::Uuid) {
        *self.channel_id.lock().unwrap() = Some(id);
    }

    /// Binds a handler into the module table.
    pub fn bind_module(
        &self,
        module_id: u8,
        handler: Arc<dyn ModuleHandler>,
    ) -> Result<(), SessionError> {
        let slot = module_id as usize;
        if slot >= MODULE_SLOTS {
            return Err(SessionError::InvalidModule(module_id));
        }
        let mut modules = self.modules.write().unwrap();
        if modules[slot].is_some() {
            return Err(SessionError::ModuleOccupied(module_id));
        }
        modules[slot] = Some(handler);
        Ok(())
    }

    /// Registers a callback run on every liveness sweep while the channel
    /// is open. The event module hooks its redelivery check here.
    pub fn register_monitor(&self, monitor: Box<dyn Fn() + Send + Sync>) {
        self.monitors.lock().unwrap().push(monitor);
    }

    /// Refreshes the expiration window.
    pub fn touch(&self) {
        *self.expires_at.lock().unwrap() = Instant::now() + self.config.ping_window;
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= *self.expires_at.lock().unwrap()
    }

    /// Routes one inbound frame to its module.
    ///
    /// Version mismatch is answered with a typed error before any module
    /// dispatch; framing violations tear the channel down without notice.
    pub fn dispatch(&self, frame: &[u8]) {
        if self.state() == ChannelState::Closed {
            return;
        }

        let (header, body) = match FrameHeader::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable frame, closing channel");
                self.close_hard();
                return;
            }
        };

        if header.version != self.version {
            tracing::debug!(
                version = header.version,
                "incompatible protocol version at connection entry"
            );
            self.send(
                SessionMessage::Error {
                    code: ErrorCode::IncompatibleProtocolVersion,
                }
                .encode(),
            );
            self.close_hard();
            return;
        }

        // Every inbound frame counts as liveness, not just pings.
        self.touch();

        if self.state() == ChannelState::Handshaking {
            if frame.len() > MAX_HANDSHAKE_FRAME_LEN {
                tracing::debug!(size = frame.len(), "oversized pre-auth frame");
                self.close_hard();
                return;
            }
            // Only the session and liveness modules speak before the
            // handshake completes.
            if header.module != MODULE_SESSION && header.module != MODULE_LIVENESS {
                tracing::debug!(module = header.module, "module used before handshake");
                self.close_hard();
                return;
            }
        }

        let handler = {
            let modules = self.modules.read().unwrap();
            modules
                .get(header.module as usize)
                .and_then(|slot| slot.clone())
        };

        match handler {
            Some(handler) => {
                let Some(this) = self.weak_self.upgrade() else {
                    return;
                };
                handler.on_frame(&this, header.op, body.to_vec());
            }
            None => {
                tracing::debug!(module = header.module, "frame for unbound module");
                self.close_hard();
            }
        }
    }

    /// Queues one frame on the outbound side. Sends are fire-and-forget:
    /// a full queue means the consumer is too slow and the frame is
    /// dropped (redelivery covers event frames).
    pub fn send(&self, frame: Vec<u8>) {
        if self.state() == ChannelState::Closed {
            return;
        }
        if let Err(e) = self.outbound.try_send(frame) {
            tracing::warn!("dropping outbound frame for slow consumer: {}", e);
        }
    }

    /// Marks the handshake complete and cancels its timeout.
    pub fn mark_active(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ChannelState::Handshaking {
            *state = ChannelState::Active;
        }
        drop(state);
        if let Some(handle) = self.handshake_timer.lock().unwrap().take() {
            handle.cancel();
        }
    }

    /// Graceful shutdown: notify the peer with a typed error frame, then
    /// give it the grace window to close first before forcing closure.
    pub fn close_graceful(&self, code: ErrorCode) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ChannelState::Closed | ChannelState::Completing => return,
                _ => *state = ChannelState::Completing,
            }
        }

        tracing::info!(code = ?code, "closing channel gracefully");
        self.send(SessionMessage::Error { code }.encode());

        let weak = self.weak_self.clone();
        let handle = timer::schedule(self.config.shutdown_grace, move || {
            if let Some(channel) = weak.upgrade() {
                tracing::debug!("peer did not close within grace period");
                channel.close_hard();
            }
        });
        *self.grace_timer.lock().unwrap() = Some(handle);
    }

    /// Hard shutdown: immediate, no notification.
    pub fn close_hard(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        if let Some(handle) = self.handshake_timer.lock().unwrap().take() {
            handle.cancel();
        }
        if let Some(handle) = self.grace_timer.lock().unwrap().take() {
            handle.cancel();
        }
        let _ = self.closed_tx.send(true);
        tracing::debug!("channel closed");
    }

    /// The transport reports the peer closed its side.
    pub fn peer_closed(&self) {
        self.close_hard();
    }

    /// Observers (the installer, tests) watch this for teardown.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }
}
