//! # forrest-db: Local Persistence for Forrest Sync
//!
//! Everything the sync layer keeps across restarts: the watermark, the
//! pending-event queue, per-collection marks and the records themselves.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Forrest Data Flow                                │
//! │                                                                         │
//! │  Gateway / SyncEngine (forrest-sync)                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    forrest-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐  ┌────────────────┐  ┌─────────────────┐  │   │
//! │  │   │   Database    │  │ PersistentCell │  │  RecordStore    │  │   │
//! │  │   │   (pool.rs)   │  │   (cell.rs)    │  │  Local/Indexed  │  │   │
//! │  │   │               │  │                │  │                 │  │   │
//! │  │   │ SqlitePool    │◄─│ watch + state_ │◄─│ cell or         │  │   │
//! │  │   │ Migrations    │  │ cells row      │  │ records_{name}  │  │   │
//! │  │   └───────────────┘  └────────────────┘  └─────────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (default: <data dir>/forrest.db)                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`repository`] - Named cell rows
//! - [`cell`] - Reactive persisted values, optional debounce
//! - [`store`] - Local and indexed record stores
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use forrest_db::{Database, DbConfig, PersistMode, PersistentCell};
//!
//! let db = Database::new(DbConfig::new("forrest.db")).await?;
//! let mark = PersistentCell::load(db.state(), "tasksLastUpdate", None::<i64>, PersistMode::Immediate).await?;
//! mark.set(Some(1_700_000_000_000)).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cell;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use cell::{CellValue, PersistMode, PersistentCell};
pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::state::StateRepository;
pub use store::{IndexedRecordStore, LocalRecordStore, RecordStore};
