//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID contains whitespace.
    #[error("ID must not contain whitespace: '{0}'")]
    Whitespace(String),

    /// The ID exceeds the maximum length accepted by the control plane.
    #[error("ID too long: {actual} characters (maximum {max})")]
    TooLong { max: usize, actual: usize },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
