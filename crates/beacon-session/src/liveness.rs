//! Built-in liveness module: answers pings, accepts keep-alives.
//!
//! The expiration refresh itself happens in the channel dispatcher for
//! every inbound frame; this module only supplies the ping/pong exchange.

use beacon_wire::liveness::LivenessMessage;
use std::sync::Arc;

use crate::channel::{Channel, ModuleHandler};

pub struct LivenessModule;

impl ModuleHandler for LivenessModule {
    fn on_frame(self: Arc<Self>, channel: &Arc<Channel>, op: u8, body: Vec<u8>) {
        match LivenessMessage::decode(op, &body) {
            Ok(LivenessMessage::Ping) => channel.send(LivenessMessage::Pong.encode()),
            Ok(LivenessMessage::Pong) | Ok(LivenessMessage::KeepAlive) => {}
            Err(e) => {
                tracing::debug!(error = %e, "malformed liveness frame");
                channel.close_hard();
            }
        }
    }
}
