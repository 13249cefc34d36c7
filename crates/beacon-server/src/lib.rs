//! Beacon server library: site state, the site registry, client sessions,
//! and the post-handshake installer.
//!
//! The pieces compose as follows: an accepted connection gets a channel
//! with the session and liveness modules bound
//! ([`installer::accept_connection`]); once the handshake establishes the
//! session, the [`installer::ClientInstaller`] resolves it into a
//! [`client::Client`] bound to a [`site::Site`] acquired from the
//! [`registry::SiteRegistry`], and attaches the event controller that
//! serves the channel's event module from then on.
//!
//! Listening sockets, the framing layer, and process bootstrap live
//! outside this crate; embedders feed channels with whole frames and own
//! the outbound queues.

pub mod client;
pub mod config;
pub mod installer;
pub mod registry;
pub mod site;

pub use client::Client;
pub use config::{load_config, Config};
pub use installer::{accept_connection, ClientInstaller, InstallError};
pub use registry::{SiteHandle, SiteRegistry};
pub use site::Site;
