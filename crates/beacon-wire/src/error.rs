//! Wire-level decode errors.
//!
//! Every variant maps to the protocol/format class of the error taxonomy:
//! the channel tears the connection down without a graceful error frame.

use thiserror::Error;

/// Errors produced while decoding a frame or its tagged fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The frame ended before the expected field was complete.
    #[error("truncated frame at offset {offset}")]
    Truncated { offset: usize },

    /// A field carried a different tag than the schema expects.
    #[error("unexpected field tag {found} (expected {expected})")]
    UnexpectedTag { expected: u8, found: u8 },

    /// The frame exceeds the permitted size for its context.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// The operation tag is not defined for the module.
    #[error("unknown operation {op} for module {module}")]
    UnknownOp { module: u8, op: u8 },

    /// A length-prefixed field exceeds its bound.
    #[error("field length {len} exceeds limit of {max}")]
    FieldTooLarge { len: usize, max: usize },

    /// A textual field was not valid UTF-8 or not printable.
    #[error("invalid text field")]
    InvalidText,

    /// A numeric field held a value outside its domain.
    #[error("invalid value for field tag {tag}")]
    InvalidValue { tag: u8 },

    /// Bytes remained after the last schema field was read.
    #[error("{remaining} trailing bytes after message")]
    TrailingBytes { remaining: usize },

    /// The frame is too short to carry the three-byte header.
    #[error("frame shorter than header")]
    MissingHeader,
}
