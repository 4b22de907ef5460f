//! Error types shared across the orchestrator.
//!
//! Provides [`OrchestratorError`] as the top-level error type and
//! [`ChannelError`] for channel-specific failures. Both are
//! non-exhaustive to allow future extension without breaking downstream
//! crates.

use thiserror::Error;

/// Top-level error type for the orchestrator core.
///
/// Variants are grouped into recoverable (retry, timeout) and fatal
/// (config, invariant) categories so callers can decide whether retrying
/// is worthwhile. Per the propagation policy, the agent loop never lets
/// one of these escape a task boundary -- connector and state-hook
/// failures are captured and converted into workflow-manager state
/// instead of bubbling up as a panic or an unhandled `Err`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// A service call failed (HTTP error, network failure, broker nack).
    #[error("service call failed: {message}")]
    ServiceCall {
        /// Human-readable description of the failure.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Human-readable name of the operation that timed out.
        operation: String,
    },

    /// The declarative configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// A symbolic name (state hook, formatter, connector) did not resolve
    /// against the startup registry.
    #[error("unresolved name: {kind} {name:?}")]
    UnresolvedName {
        /// Which registry was consulted (e.g. `"state_hook"`).
        kind: &'static str,
        /// The name that failed to resolve.
        name: String,
    },

    /// A workflow-manager operation was attempted on a `dialog_id` that has
    /// no active record (e.g. a late response after flush). Per the
    /// failure semantics this is logged and ignored by callers, not
    /// treated as fatal.
    #[error("no active workflow for dialog {dialog_id}")]
    UnknownDialog {
        /// The dialog id that had no active workflow record.
        dialog_id: String,
    },

    /// A workflow record already exists for this dialog.
    #[error("workflow already in flight for dialog {dialog_id}")]
    WorkflowInFlight {
        /// The dialog id with an existing workflow record.
        dialog_id: String,
    },

    /// Underlying transport (broker / HTTP) error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A channel-layer error bubbled up.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Channel-specific error type.
///
/// Used by channel implementations (stdio, webhook, and any future
/// platform integration) to report failures connecting, authenticating,
/// or exchanging messages, independent of the orchestrator core.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChannelError {
    /// Failed to establish a connection to the channel backend.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Sending a message failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The channel is not currently connected.
    #[error("not connected")]
    NotConnected,

    /// The requested channel was not found.
    #[error("channel not found: {0}")]
    NotFound(String),

    /// Catch-all for errors that do not fit other variants.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the orchestrator crates.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_error_display() {
        let err = OrchestratorError::Timeout {
            operation: "skill_x".into(),
        };
        assert_eq!(err.to_string(), "operation timed out: skill_x");
    }

    #[test]
    fn unresolved_name_display() {
        let err = OrchestratorError::UnresolvedName {
            kind: "state_hook",
            name: "bogus_hook".into(),
        };
        assert_eq!(err.to_string(), "unresolved name: state_hook \"bogus_hook\"");
    }

    #[test]
    fn channel_error_converts() {
        let err: OrchestratorError = ChannelError::NotConnected.into();
        assert_eq!(err.to_string(), "channel error: not connected");
    }

    #[test]
    fn unknown_dialog_display() {
        let err = OrchestratorError::UnknownDialog {
            dialog_id: "abc".into(),
        };
        assert_eq!(err.to_string(), "no active workflow for dialog abc");
    }
}
