//! Error types for the Tollgate engine.
//!
//! Operational billing failures are never errors here: they travel as
//! [`Status`](crate::Status) codes on responses. The types below cover misuse
//! of the API (bad configuration, a stopped engine) and broken invariants.

use std::time::Duration;

use thiserror::Error;

use crate::request::RequestId;

/// Errors raised by the engine and its configuration layer.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Two configured providers share the same name.
    #[error("provider '{name}' is configured more than once")]
    DuplicateProvider { name: String },

    /// A provider identifier has no constructor in the provider table.
    #[error("no provider registered under '{id}'")]
    UnknownProvider { id: String },

    /// A configuration was built without any provider.
    #[error("configuration has no providers")]
    NoProviders,

    /// The worker is gone; commands can no longer be delivered.
    #[error("billing engine is stopped")]
    EngineStopped,

    /// A completion signal arrived for a request that is not the pending one.
    ///
    /// This means the single-flight invariant was broken and the worker stops.
    #[error("completion for request {handled} while {pending:?} is pending")]
    UnexpectedCompletion {
        handled: RequestId,
        pending: Option<RequestId>,
    },

    /// Engine settings could not be parsed.
    #[error("invalid engine settings: {0}")]
    InvalidSettings(#[from] serde_json::Error),
}

impl TollgateError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TollgateError::DuplicateProvider { .. } => "duplicate_provider",
            TollgateError::UnknownProvider { .. } => "unknown_provider",
            TollgateError::NoProviders => "no_providers",
            TollgateError::EngineStopped => "engine_stopped",
            TollgateError::UnexpectedCompletion { .. } => "unexpected_completion",
            TollgateError::InvalidSettings(_) => "invalid_settings",
        }
    }
}

/// Why a [`SyncedReference`](crate::SyncedReference) produced no value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    /// Nothing was set before the deadline.
    #[error("no value within {0:?}")]
    Timeout(Duration),

    /// The reference was cancelled before a value was set.
    #[error("handoff cancelled")]
    Cancelled,
}

impl HandoffError {
    pub fn as_label(&self) -> &'static str {
        match self {
            HandoffError::Timeout(_) => "handoff_timeout",
            HandoffError::Cancelled => "handoff_cancelled",
        }
    }
}

/// A launch callback could not start the foreground flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// Nothing on the device handles the requested action.
    #[error("no handler for action '{action}'")]
    NoHandler { action: String },

    /// The UI surface went away before the flow could start.
    #[error("ui surface is gone")]
    SurfaceGone,

    #[error("launch failed: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(TollgateError::NoProviders.as_label(), "no_providers");
        assert_eq!(
            TollgateError::DuplicateProvider { name: "a".into() }.as_label(),
            "duplicate_provider"
        );
        assert_eq!(HandoffError::Cancelled.as_label(), "handoff_cancelled");
    }

    #[test]
    fn unexpected_completion_mentions_both_ids() {
        let handled = RequestId::new();
        let err = TollgateError::UnexpectedCompletion {
            handled,
            pending: None,
        };
        let msg = err.to_string();
        assert!(msg.contains(&handled.to_string()));
        assert!(msg.contains("None"));
    }
}
