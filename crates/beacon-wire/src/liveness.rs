//! Liveness sub-protocol messages.
//!
//! The channel answers pings and accepts keep-alives; its expiration window
//! is refreshed by *every* inbound frame, not only these.

use crate::error::WireError;
use crate::{frame, MODULE_LIVENESS};

pub const OP_PING: u8 = 0x01;
pub const OP_PONG: u8 = 0x02;
pub const OP_KEEP_ALIVE: u8 = 0x03;

/// A message on the liveness module. All operations carry no fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessMessage {
    Ping,
    Pong,
    KeepAlive,
}

impl LivenessMessage {
    pub fn encode(&self) -> Vec<u8> {
        let op = match self {
            Self::Ping => OP_PING,
            Self::Pong => OP_PONG,
            Self::KeepAlive => OP_KEEP_ALIVE,
        };
        frame(MODULE_LIVENESS, op, Vec::new())
    }

    pub fn decode(op: u8, body: &[u8]) -> Result<Self, WireError> {
        if !body.is_empty() {
            return Err(WireError::TrailingBytes {
                remaining: body.len(),
            });
        }
        match op {
            OP_PING => Ok(Self::Ping),
            OP_PONG => Ok(Self::Pong),
            OP_KEEP_ALIVE => Ok(Self::KeepAlive),
            _ => Err(WireError::UnknownOp {
                module: MODULE_LIVENESS,
                op,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameHeader;

    #[test]
    fn ping_round_trip() {
        let raw = LivenessMessage::Ping.encode();
        let (header, body) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(
            LivenessMessage::decode(header.op, body),
            Ok(LivenessMessage::Ping)
        );
    }

    #[test]
    fn payload_on_keep_alive_is_rejected() {
        assert_eq!(
            LivenessMessage::decode(OP_KEEP_ALIVE, &[0]),
            Err(WireError::TrailingBytes { remaining: 1 })
        );
    }
}
