//! # forrest-core: Pure Data Model for Forrest Sync
//!
//! Everything the sync layer reasons about, with zero I/O: records, change
//! events, the shared pending-event queue, the watermark and the record
//! validation predicate.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Forrest Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                forrest-sync (Gateway, SyncEngine)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              forrest-db (cells, record stores)                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ forrest-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  record   │  │   event   │  │   time    │  │ validation│  │   │
//! │  │   │  Record   │  │ChangeEvent│  │ Timestamp │  │ predicate │  │   │
//! │  │   │  RecordId │  │PendingQ.  │  │ windows   │  │  schema   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`] - `Record` and `RecordId`
//! - [`event`] - `Action`, `ChangeEvent`, `PendingQueue`, `Watermark`
//! - [`time`] - `Timestamp` plus freshness/staleness windows
//! - [`schema`] - `IndexSchema` for indexed record stores
//! - [`validation`] - Pluggable record predicate
//! - [`error`] - Domain error types
//!
//! ## Example
//!
//! ```rust
//! use forrest_core::{Action, ChangeEvent, PendingQueue};
//!
//! let event: ChangeEvent = serde_json::from_str(
//!     r#"{"id":"a","branch":"tasks","action":"post","time":1700000000000}"#,
//! ).unwrap();
//! assert_eq!(event.action, Action::Post);
//!
//! let mut queue = PendingQueue::default();
//! queue.push(event);
//! assert_eq!(queue.slice("tasks").len(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod event;
pub mod record;
pub mod schema;
pub mod time;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult};
pub use event::{Action, ChangeEvent, PendingQueue, Watermark};
pub use record::{max_updated, Record, RecordId};
pub use schema::{validate_identifier, IndexSchema, MANDATORY_INDEXES};
pub use time::{is_stale, FreshnessWindow, Timestamp};
pub use validation::{AcceptAll, RecordValidator, RequireId};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Persisted cell key for the process-wide event watermark.
pub const WATERMARK_KEY: &str = "forrestLastUpdate";

/// Persisted cell key for the process-wide pending-event queue.
pub const PENDING_QUEUE_KEY: &str = "forrestUpdateQuery";

/// Suffix of the per-collection last-update mark key.
const LAST_UPDATE_SUFFIX: &str = "LastUpdate";

/// Returns the persisted cell key holding a collection's last-update mark.
pub fn last_update_key(collection: &str) -> String {
    format!("{collection}{LAST_UPDATE_SUFFIX}")
}

/// Checks that `name` can key a collection's persisted state.
///
/// Local records live under the bare collection name, so a name must be a
/// valid identifier and must not shadow the watermark, the pending queue or
/// another collection's last-update mark.
pub fn validate_collection_name(name: &str) -> CoreResult<()> {
    validate_identifier(name)?;
    if name == WATERMARK_KEY || name == PENDING_QUEUE_KEY || name.ends_with(LAST_UPDATE_SUFFIX) {
        return Err(CoreError::ReservedName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_rejects_state_keys() {
        assert!(validate_collection_name("tasks").is_ok());
        assert!(validate_collection_name("last_update").is_ok());

        for name in [WATERMARK_KEY, PENDING_QUEUE_KEY, "tasksLastUpdate", "LastUpdate"] {
            assert_eq!(
                validate_collection_name(name),
                Err(CoreError::ReservedName(name.to_string()))
            );
        }
        assert!(matches!(
            validate_collection_name("a-b"),
            Err(CoreError::InvalidIdentifier(_))
        ));
    }
}
