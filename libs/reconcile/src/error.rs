//! Error taxonomy for reconciliation.

use std::time::Duration;

use stratus_id::{EntityId, OwnerId};
use thiserror::Error;

use crate::api::EntityType;
use crate::diff::ActionKind;

/// Result type for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Closed classification of control-plane errors.
///
/// Callers use this to pick the retry directive for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Another asynchronous operation is in flight, or the target is mid-transition.
    Transient,

    /// The target does not exist.
    NotFound,

    /// Anything else: validation, quota, permission, malformed request.
    Fatal,
}

/// Errors reported by the remote control-plane client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The control plane is busy with another operation on this account or target.
    #[error("resource busy: {0}")]
    Busy(String),

    /// The target entity does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The control plane rejected the request.
    #[error("request rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    /// The request never reached the control plane, or the response was unreadable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request could not be built locally.
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl ApiError {
    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Busy(_) => ErrorClass::Transient,
            ApiError::NotFound(_) => ErrorClass::NotFound,
            ApiError::Rejected { .. } | ApiError::Transport(_) | ApiError::Malformed(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Returns true if the control plane reported the target as busy.
    pub fn is_busy(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A deadline elapsed while retrying or waiting.
    #[error("timed out waiting for {operation} after {timeout:?} ({attempts} attempts)")]
    Timeout {
        operation: String,
        timeout: Duration,
        attempts: u32,
    },

    /// The control plane reported that an entity entered a failed state.
    #[error("{entity_type} '{id}' failed: {reason}")]
    Failed {
        entity_type: EntityType,
        id: EntityId,
        reason: String,
    },

    /// The requested change can never succeed as specified.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The desired collection is invalid.
    #[error("invalid desired state: {0}")]
    InvalidDesiredState(String),

    /// The owner disappeared in the middle of a pass.
    #[error("owner '{0}' was deleted during reconciliation")]
    OwnerDeleted(OwnerId),

    /// The control plane rejected a call.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The process is shutting down.
    #[error("cancelled while {0}")]
    Cancelled(String),

    /// An action in a pass failed; wraps the underlying cause.
    #[error(
        "{kind} {target} on owner '{owner}' failed ({completed} of {total} actions completed): {source}"
    )]
    Action {
        owner: OwnerId,
        kind: ActionKind,
        target: String,
        completed: usize,
        total: usize,
        #[source]
        source: Box<ReconcileError>,
    },
}

impl ReconcileError {
    /// Returns true if this error (or the cause it wraps) is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            ReconcileError::Timeout { .. } => true,
            ReconcileError::Action { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Returns true if this error (or the cause it wraps) is a precondition violation.
    pub fn is_precondition(&self) -> bool {
        match self {
            ReconcileError::Precondition(_) => true,
            ReconcileError::Action { source, .. } => source.is_precondition(),
            _ => false,
        }
    }

    /// Returns true if this error (or the cause it wraps) came from shutdown.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ReconcileError::Cancelled(_) => true,
            ReconcileError::Action { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// The innermost cause, unwrapping action annotations.
    pub fn root_cause(&self) -> &ReconcileError {
        match self {
            ReconcileError::Action { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ApiError::Busy("another operation in progress".into()), ErrorClass::Transient)]
    #[case(ApiError::NotFound("disk-1".into()), ErrorClass::NotFound)]
    #[case(ApiError::Rejected { code: "QUOTA_EXCEEDED".into(), message: "no".into() }, ErrorClass::Fatal)]
    #[case(ApiError::Transport("connection reset".into()), ErrorClass::Fatal)]
    #[case(ApiError::Malformed("bad size".into()), ErrorClass::Fatal)]
    fn test_api_error_classification(#[case] error: ApiError, #[case] expected: ErrorClass) {
        assert_eq!(error.class(), expected);
    }

    #[test]
    fn test_timeout_message_names_operation() {
        let err = ReconcileError::Timeout {
            operation: "add disk 1 on server 'srv-1'".into(),
            timeout: Duration::from_secs(30),
            attempts: 6,
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for add disk 1 on server 'srv-1' after 30s (6 attempts)"
        );
    }

    #[test]
    fn test_action_error_unwraps_to_root_cause() {
        let err = ReconcileError::Action {
            owner: OwnerId::parse("srv-1").unwrap(),
            kind: ActionKind::Change,
            target: "disk 0".into(),
            completed: 2,
            total: 3,
            source: Box::new(ReconcileError::Precondition("cannot shrink".into())),
        };

        assert!(err.is_precondition());
        assert!(!err.is_timeout());
        assert!(matches!(err.root_cause(), ReconcileError::Precondition(_)));
        assert!(err.to_string().contains("2 of 3 actions completed"));
    }
}
