//! Error taxonomy for the VM protocol.
//!
//! Every public operation fails with exactly one of these kinds; raw
//! transport or OS errors never leak through unmapped. Translation from
//! lower-level failures happens in the `From` impls below, so call sites
//! stay `?`-only.

use std::io;

use crate::protocol::DecodeError;

/// Result type for VM operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors surfaced by sessions and execution handles.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Malformed wire data. Fatal to the session; the caller must
    /// recreate it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker process could not be spawned or failed unexpectedly.
    /// Fatal; the caller must recreate the session.
    #[error("worker process error: {0}")]
    Process(String),

    /// The worker process exited (or the session was closed) while a
    /// call was in flight.
    #[error("worker process exited")]
    ProcessExited,

    /// The executed script itself threw. Recoverable; the session stays
    /// healthy.
    #[error("script error: {message}")]
    Script {
        message: String,
        /// Remote stack trace, when the worker provided one.
        stack: Option<String>,
    },

    /// An operation was used out of sequence (closed session, destroyed
    /// handle).
    #[error("invalid state: {0}")]
    State(String),

    /// The worker failed to confirm initialization of a session or
    /// execution handle.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// A permission set was rejected before any process I/O.
    #[error("invalid permission set: {0}")]
    Validation(String),

    /// An execution handle requested permissions beyond its session's.
    #[error("permission escalation: {0}")]
    PermissionEscalation(String),
}

impl From<DecodeError> for VmError {
    fn from(err: DecodeError) -> Self {
        VmError::Protocol(err.to_string())
    }
}

impl From<io::Error> for VmError {
    fn from(err: io::Error) -> Self {
        VmError::Process(err.to_string())
    }
}

impl VmError {
    /// True for failures that doom the whole session (the caller must
    /// start a new one); false for per-call or configuration errors.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VmError::Protocol(_) | VmError::Process(_) | VmError::ProcessExited
        )
    }
}
