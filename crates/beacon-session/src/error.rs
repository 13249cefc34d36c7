//! Session-layer errors.

use thiserror::Error;

/// Errors raised while wiring or driving a channel.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The module id is outside the channel's slot table.
    #[error("module id {0} outside the slot table")]
    InvalidModule(u8),

    /// The module slot is already bound to a handler.
    #[error("module id {0} already bound")]
    ModuleOccupied(u8),
}
