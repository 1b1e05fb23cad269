//! Error types for identity parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The name is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name exceeds the maximum length.
    #[error("name too long: {actual} characters (maximum {max})")]
    TooLong { actual: usize, max: usize },

    /// The name contains a character outside `[A-Za-z0-9._-]`.
    #[error("invalid character {found:?} in name {name:?}")]
    InvalidChar { name: String, found: char },

    /// The id is missing the required prefix.
    #[error("id missing prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The id is missing the underscore separator.
    #[error("id missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the id is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates an invalid name (as opposed to
    /// an invalid prefixed id).
    pub fn is_name_error(&self) -> bool {
        matches!(
            self,
            IdError::Empty | IdError::TooLong { .. } | IdError::InvalidChar { .. }
        )
    }
}
