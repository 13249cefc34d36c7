//! Framed binary protocol for the Beacon platform.
//!
//! Every application message is one frame:
//!
//! ```text
//! [protocol-version:1][module-id:1][operation-tag:1][tagged fields ...]
//! ```
//!
//! Module ids route the frame through the channel's 16-slot module table;
//! the operation tag selects the message within the module. Field encoding
//! is a flat tagged sequence (see [`codec`]).
//!
//! This crate defines the session, liveness, and event module messages with
//! their `encode`/`decode` pairs, plus the frame-level limits. It performs
//! no I/O: the length-prefixed socket layer below delivers whole frames.

pub mod codec;
pub mod error;
pub mod events;
pub mod liveness;
pub mod session;

pub use codec::{FieldReader, FieldWriter};
pub use error::WireError;

/// Protocol version negotiated at connection entry.
pub const PROTOCOL_VERSION: u8 = 1;

/// Number of module slots a channel multiplexes.
pub const MODULE_SLOTS: usize = 16;

/// Module id of the session (handshake) module.
pub const MODULE_SESSION: u8 = 1;
/// Module id of the liveness sub-protocol module.
pub const MODULE_LIVENESS: u8 = 2;
/// Module id of the event subscription/delivery module.
pub const MODULE_EVENTS: u8 = 3;

/// Hard ceiling for any frame.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Tighter ceiling for frames accepted before authentication completes.
/// A malicious peer must not be able to push large payloads through the
/// unauthenticated handshake phase.
pub const MAX_HANDSHAKE_FRAME_LEN: usize = 4 * 1024;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub module: u8,
    pub op: u8,
}

impl FrameHeader {
    /// Splits a raw frame into its header and body.
    pub fn parse(frame: &[u8]) -> Result<(FrameHeader, &[u8]), WireError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_LEN,
            });
        }
        if frame.len() < 3 {
            return Err(WireError::MissingHeader);
        }
        Ok((
            FrameHeader {
                version: frame[0],
                module: frame[1],
                op: frame[2],
            },
            &frame[3..],
        ))
    }
}

/// Builds a complete frame from a module id, operation tag, and field body.
pub fn frame(module: u8, op: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + body.len());
    out.push(PROTOCOL_VERSION);
    out.push(module);
    out.push(op);
    out.extend_from_slice(&body);
    out
}
