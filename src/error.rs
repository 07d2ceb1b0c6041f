//! Error types for cache operations
//!
//! Errors fall into a small number of kinds: configuration mistakes made while
//! building categories and deposits, insert/update mismatches, value
//! (de)serialization failures, lifecycle errors, and wrapped backend failures.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Malformed category or deposit (wildcards where disallowed, conflicting types)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Two accessors in one deposit produce the same property
    #[error("Configuration error: duplicate accessor for property '{name}'")]
    DuplicateAccessor { name: String },

    /// Argument outside of the accepted domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Deposit `is_new` flag contradicts the existing rows
    #[error("Mismatch error: {0}")]
    Mismatch(String),

    /// A property value or matcher operand could not be (de)serialized
    #[error("Serialization error for property '{property}': {reason}")]
    Serialization { property: String, reason: String },

    /// Backend unavailable during initialization
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// `initialize` was called more than once
    #[error("Cache has already been initialized")]
    AlreadyInitialized,

    /// An operation was issued before `initialize`
    #[error("Cache has not been initialized")]
    NotInitialized,

    /// An operation was issued after `close`
    #[error("Cache is closed")]
    Closed,

    /// Backend failure, with the category/group context it happened in
    #[error("Storage error ({context}): {reason}")]
    Storage { context: String, reason: String },

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl CacheError {
    /// True for the configuration kind (including duplicate accessors)
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            CacheError::Configuration(_) | CacheError::DuplicateAccessor { .. }
        )
    }

    pub(crate) fn serialization(property: &str, err: impl std::fmt::Display) -> Self {
        CacheError::Serialization {
            property: property.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn storage(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        CacheError::Storage {
            context: context.into(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}
