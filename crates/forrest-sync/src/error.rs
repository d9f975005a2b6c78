//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Network      │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  RequestFailed  │  │  InvalidEvent           │ │
//! │  │  InvalidUrl     │  │  Unexpected-    │  │  DeserializationFailed  │ │
//! │  │  ConfigLoad/    │  │    Status       │  │                         │ │
//! │  │    SaveFailed   │  │  StreamClosed   │  │                         │ │
//! │  │                 │  │  Timeout        │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Database     │  │   Validation    │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Database       │  │  Validation-    │  │  ChannelError           │ │
//! │  │                 │  │    Failed       │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here is fatal to a running agent: network and protocol errors
//! are logged and leave events pending, validation errors abort a single
//! write before it reaches the network.

use forrest_core::CoreError;
use forrest_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// A configured or derived URL is unusable.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// The request never produced a response (connect, DNS, reset, body read).
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The server answered with a status the caller can't use.
    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    /// The event stream ended.
    #[error("Event stream closed")]
    StreamClosed,

    /// Connection timeout.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// A change event could not be parsed.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A response body could not be decoded.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Persisted state could not be read or written.
    #[error("Database error: {0}")]
    Database(String),

    /// A record was rejected by the collection's validator.
    #[error("{0}")]
    ValidationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Component is shutting down.
    #[error("Sync is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidAction(_) | CoreError::InvalidTimestamp(_) => {
                SyncError::InvalidEvent(err.to_string())
            }
            CoreError::InvalidIdentifier(_) | CoreError::ReservedName(_) => {
                SyncError::InvalidConfig(err.to_string())
            }
            CoreError::MissingId | CoreError::NotAnObject(_) => {
                SyncError::DeserializationFailed(err.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::DeserializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::DeserializationFailed(err.to_string())
        } else {
            SyncError::RequestFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RequestFailed(_) | SyncError::StreamClosed | SyncError::Timeout(_) => true,
            SyncError::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if the server sent something we couldn't understand.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidEvent(_) | SyncError::DeserializationFailed(_)
        )
    }
}
