//! # forrest-sync: Sync Engine for Forrest
//!
//! Keeps local record stores consistent with a remote tree (REST) and
//! events (server-sent events) backend, offline first.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Layer Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    Gateway (one per process)                     │  │
//! │  │                                                                  │  │
//! │  │  catch-up GET events/batch/{since}                               │  │
//! │  │  live     GET events/stream/{username}/{since}  (SSE)            │  │
//! │  │  fixed-delay reconnect                                           │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ ingest()                               │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  SyncContext: watermark + PendingQueue + broadcast<Watermark>    │  │
//! │  └──────────┬───────────────────────┬───────────────────────┬───────┘  │
//! │             ▼                       ▼                       ▼          │
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌────────────────────┐│
//! │  │ SyncEngine "tasks" │  │ SyncEngine "notes" │  │ SyncEngine ...     ││
//! │  │ bootstrap, passes, │  │                    │  │                    ││
//! │  │ writes, BusyFlag   │  │                    │  │                    ││
//! │  └─────────┬──────────┘  └────────────────────┘  └────────────────────┘│
//! │            ▼                                                            │
//! │   RecordStore (forrest-db): LocalRecordStore / IndexedRecordStore      │
//! │                                                                         │
//! │  ALERTS: write responses, validation failures and busy timeouts go     │
//! │  to the collection's AlertSink (tracing by default).                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - `SyncConfig` (TOML + env) and resolved `Endpoints`
//! - [`error`] - Sync error types
//! - [`http`] - `RestClient` over reqwest
//! - [`sse`] - Incremental `text/event-stream` decoder
//! - [`context`] - Shared watermark, pending queue and change broadcast
//! - [`gateway`] - Event stream task with catch-up and reconnect
//! - [`engine`] - Per-collection `SyncEngine`
//! - [`busy`] - Busy flag with timeout
//! - [`alert`] - `AlertSink` and the stock sinks

// =============================================================================
// Module Declarations
// =============================================================================

pub mod alert;
pub mod busy;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod http;
pub mod sse;

// =============================================================================
// Re-exports
// =============================================================================

pub use alert::{AlertSink, LogAlertSink, MemoryAlertSink};
pub use busy::BusyFlag;
pub use config::{
    CollectionConfig, EngineSettings, Endpoints, GatewaySettings, ServerSettings,
    StorageSettings, SyncConfig,
};
pub use context::SyncContext;
pub use engine::{CollectionOptions, PassReport, SyncEngine, NETWORK_FAILURE_STATUS};
pub use error::{SyncError, SyncResult};
pub use gateway::{ConnectionState, Gateway, GatewayConfig, GatewayHandle};
pub use http::{RestClient, WriteMethod, WriteResponse};
pub use sse::{SseDecoder, SseEvent};
