//! Bridge error types.
//!
//! Comprehensive error handling for the pubsub bridge kernel, covering the
//! error kinds the bridge is expected to handle locally (§7 of the design):
//! invalid frames, dataloss, session timeout, backpressure, and fatal
//! fabric-offer errors.

use std::io;
use thiserror::Error;

/// Main error type for bridge kernel operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// IO error surfaced from the fabric or local-bus collaborator.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Frame failed `is_valid`: length shorter than the declared header/body
    /// size, or an unknown `msg_type`.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Session-level fragment reassembly could not be completed.
    #[error("fragment reassembly failed for session {session_id}: {reason}")]
    FragmentReassembly { session_id: u32, reason: String },

    /// The bridge's own send/route channel is gone.
    #[error("channel send error")]
    ChannelSend,

    /// The bridge's own receive channel is gone.
    #[error("channel receive error")]
    ChannelRecv,

    /// Fabric reported the message is too large to ever fit, even after
    /// fragmentation.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Fabric offer returned a fatal, non-recoverable error (closed/error).
    #[error("fabric closed: {0}")]
    FabricClosed(String),

    /// An allocation failed while building an outbound frame.
    #[error("allocation failure: {0}")]
    AllocFailure(String),

    /// Shutdown exceeded the configured conductor-pump retry budget.
    #[error("shutdown timed out after {pumps} pumps")]
    ShutdownTimeout { pumps: u32 },
}

/// Result type alias for bridge kernel operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Build an [`BridgeError::InvalidFrame`] with a formatted reason.
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// Build a [`BridgeError::FragmentReassembly`] error.
    pub fn fragment_reassembly(session_id: u32, reason: impl Into<String>) -> Self {
        Self::FragmentReassembly {
            session_id,
            reason: reason.into(),
        }
    }

    /// Whether the caller should retry the operation that produced this
    /// error (per §7, only I/O errors of a transient kind are retried;
    /// everything else is handled once and dropped).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Whether this error means the peer/fabric connection itself is gone.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::FabricClosed(_) | Self::ShutdownTimeout { .. })
    }
}
