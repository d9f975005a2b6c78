//! # Error Types
//!
//! Domain errors for forrest-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  forrest-core  → CoreError   (this file: parse/shape failures)         │
//! │  forrest-db    → DbError     (SQLite, persisted cells, stores)         │
//! │  forrest-sync  → SyncError   (config, network, stream, validation)     │
//! │                                                                         │
//! │  Flow: CoreError → DbError → SyncError → logged / alerted              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Data model errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A timestamp was neither an integer nor a numeric string.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A change event named an action outside post/put/delete/archive.
    #[error("Unknown action '{0}'. Valid actions: post, put, delete, archive")]
    InvalidAction(String),

    /// A record has no usable `id` field.
    #[error("Record has no id")]
    MissingId,

    /// A value that must be a JSON object was something else.
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(String),

    /// A collection or index name cannot be used as an SQL identifier.
    #[error("Invalid identifier '{0}': only letters, digits and underscores are allowed")]
    InvalidIdentifier(String),

    /// A collection name collides with a persisted state key.
    #[error("Collection name '{0}' is reserved")]
    ReservedName(String),
}
