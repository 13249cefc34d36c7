//! Per-connection session layer: the channel abstraction, the
//! authenticated handshake state machine, and the liveness sub-protocol.
//!
//! A [`Channel`](channel::Channel) multiplexes up to 16 protocol modules by
//! module id over one framed transport. It is created in the handshaking
//! state with the session and liveness modules bound; once the handshake
//! completes, the installer attaches the event module and the channel runs
//! in steady state until it expires, the peer disconnects, or the server
//! shuts it down.
//!
//! The socket-buffer layer below is out of scope: the channel consumes an
//! ordered, backpressure-aware outbound queue and is fed whole inbound
//! frames by whatever owns the socket.

pub mod channel;
pub mod handshake;
pub mod liveness;
pub mod timer;

mod error;

pub use channel::{Channel, ChannelConfig, ChannelState, ModuleHandler};
pub use error::SessionError;
pub use handshake::{Established, SessionModule};
pub use liveness::LivenessModule;
