//! Error handling module
//!
//! Centralized error types for the aggregate runtime.

use crate::registry::HandlerError;
use crate::store::StoreError;

/// Runtime-wide Result type
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by aggregate operations
///
/// Sequence conflicts never appear here: the commit path recovers them
/// internally by re-hydrating and retrying the command.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No handler registered for a command or event type tag
    #[error("No handler registered for type: {0}")]
    InvalidHandler(String),

    /// Command is malformed or addressed to the wrong aggregate
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A user handler failed; the aggregate's state is unchanged
    #[error("Handler fault ({kind}): {trace}")]
    HandlerFault { kind: String, trace: String },

    /// The wall clock produced an unusable reading
    #[error("Clock failure: {0}")]
    ClockFailure(String),

    /// The actor for this aggregate is no longer running
    #[error("Aggregate actor terminated: {0}")]
    Terminated(String),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RuntimeError {
    /// Stable error code for logs and API surfaces
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::InvalidHandler(_) => "invalid_handler",
            RuntimeError::InvalidCommand(_) => "invalid_command",
            RuntimeError::HandlerFault { .. } => "handler_fault",
            RuntimeError::ClockFailure(_) => "clock_failure",
            RuntimeError::Terminated(_) => "actor_terminated",
            RuntimeError::Store(_) => "store_error",
        }
    }

    /// Diagnostic trace carried by handler faults
    pub fn trace(&self) -> Option<&str> {
        match self {
            RuntimeError::HandlerFault { trace, .. } => Some(trace),
            _ => None,
        }
    }

    /// Check if this error was raised by user handler code
    pub fn is_handler_fault(&self) -> bool {
        matches!(self, RuntimeError::HandlerFault { .. })
    }
}

impl From<HandlerError> for RuntimeError {
    fn from(error: HandlerError) -> Self {
        RuntimeError::HandlerFault {
            kind: error.kind,
            trace: error.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = RuntimeError::InvalidHandler("account.unknown".to_string());
        assert_eq!(err.kind(), "invalid_handler");
        assert!(err.trace().is_none());

        let err = RuntimeError::from(HandlerError::new("overdraft", "balance too low"));
        assert_eq!(err.kind(), "handler_fault");
        assert_eq!(err.trace(), Some("balance too low"));
        assert!(err.is_handler_fault());
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err = RuntimeError::from(StoreError::Unavailable("connection refused".to_string()));
        assert_eq!(err.kind(), "store_error");
        assert!(err.to_string().contains("connection refused"));
    }
}
