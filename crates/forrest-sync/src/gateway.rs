//! # Event Gateway
//!
//! Owns the process's single event-stream connection and feeds the shared
//! pending queue.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Gateway Connection States                          │
//! │                                                                         │
//! │  start ──► watermark inside freshness window?                          │
//! │              │ yes                        │ no                          │
//! │              ▼                            │                             │
//! │        ┌────────────┐  GET batch/{since}  │                             │
//! │        │ CatchingUp │ ─────────────────┐  │                             │
//! │        └────────────┘                  ▼  ▼                             │
//! │                                   ┌────────────┐                        │
//! │              ┌──────────────────► │ Connecting │ GET stream/{u}/{since} │
//! │              │                    └─────┬──────┘                        │
//! │              │              200         │   failure                     │
//! │              │                  ┌───────┴──────┐                        │
//! │              │                  ▼              ▼                        │
//! │              │          ┌────────────┐  ┌────────────┐                  │
//! │              │          │ Streaming  │─►│  Backoff   │ closed / error   │
//! │              │          └────────────┘  └─────┬──────┘                  │
//! │              └────────────────────────────────┘ fixed delay (5s)        │
//! │                                                                         │
//! │  shutdown() from any state ──► Disconnected                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `message` event on the stream is queued under its branch and moves
//! the watermark to the event id the server sent alongside it. Nothing the
//! gateway runs into is returned to callers; it is logged and retried.

use backoff::backoff::{Backoff, Constant};
use forrest_core::{ChangeEvent, FreshnessWindow, Timestamp};
use futures_util::StreamExt;
use reqwest::Response;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::http::RestClient;
use crate::sse::{SseDecoder, SseEvent, MESSAGE};

// =============================================================================
// Gateway State
// =============================================================================

/// Connection state of the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not running.
    Disconnected,
    /// Fetching missed events before opening the stream.
    CatchingUp,
    /// Opening the stream.
    Connecting,
    /// Stream open, events flowing.
    Streaming,
    /// Waiting before the next connection attempt.
    Backoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::CatchingUp => write!(f, "catching_up"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Streaming => write!(f, "streaming"),
            ConnectionState::Backoff => write!(f, "backoff"),
        }
    }
}

// =============================================================================
// Gateway Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Account whose stream is followed.
    pub username: String,

    /// Time to wait for the stream's response headers.
    pub connect_timeout: Duration,

    /// Fixed delay between connection attempts.
    pub reconnect_backoff: Duration,

    /// Consecutive failures before giving up (0 = infinite).
    pub max_retries: u32,

    /// Watermark ages for which a catch-up batch is fetched.
    pub freshness: FreshnessWindow,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            username: "user".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(5),
            max_retries: 0,
            freshness: FreshnessWindow::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        GatewayConfig {
            username: config.username().to_string(),
            connect_timeout: config.gateway.connect_timeout(),
            reconnect_backoff: config.gateway.reconnect_backoff(),
            max_retries: config.gateway.max_retries,
            freshness: config.gateway.freshness_window(),
        }
    }
}

// =============================================================================
// Gateway Handle
// =============================================================================

/// Handle to a running gateway.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    state: watch::Receiver<ConnectionState>,
    shutdown_tx: mpsc::Sender<()>,
}

impl GatewayHandle {
    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Returns true if the stream is open.
    pub fn is_streaming(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    /// Stops the gateway. The state settles on `Disconnected`.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Failed to send shutdown signal".into()))
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Event stream client with catch-up and fixed-delay reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let ctx = SyncContext::open(&db, Duration::from_millis(500)).await?;
/// let client = RestClient::new(config.endpoints()?, Duration::from_secs(10))?;
///
/// let gateway = Gateway::spawn(GatewayConfig::from_sync_config(&config), client, ctx.clone());
/// // ... engines subscribe to ctx ...
/// gateway.shutdown().await?;
/// ```
pub struct Gateway {
    config: GatewayConfig,
    client: RestClient,
    ctx: Arc<SyncContext>,
    state: watch::Sender<ConnectionState>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Gateway {
    /// Spawns the gateway task and returns its handle.
    pub fn spawn(config: GatewayConfig, client: RestClient, ctx: Arc<SyncContext>) -> GatewayHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);

        let gateway = Gateway {
            config,
            client,
            ctx,
            state,
            shutdown_rx,
        };

        tokio::spawn(gateway.run());

        GatewayHandle {
            state: state_rx,
            shutdown_tx,
        }
    }

    /// Main gateway loop.
    async fn run(mut self) {
        info!(
            events = %self.client.endpoints().events_base(),
            username = %self.config.username,
            "Gateway starting"
        );

        if self.should_catch_up() {
            self.set_state(ConnectionState::CatchingUp);
            match self.catch_up().await {
                Ok(count) => info!(count, "Catch-up complete"),
                Err(e) => warn!(error = %e, "Catch-up failed, continuing with stream"),
            }
        }

        let mut backoff = self.create_backoff();
        let mut retry_count = 0u32;

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                info!("Gateway received shutdown signal");
                break;
            }

            self.set_state(ConnectionState::Connecting);

            let ended = match self.connect_with_timeout().await {
                Ok(response) => {
                    info!("Event stream open");
                    self.set_state(ConnectionState::Streaming);

                    backoff.reset();
                    retry_count = 0;

                    self.stream_loop(response).await
                }
                Err(e) => e,
            };

            match ended {
                SyncError::ShuttingDown => {
                    info!("Gateway received shutdown signal");
                    break;
                }
                SyncError::StreamClosed => info!("Event stream closed by server"),
                e if e.is_retryable() => warn!(error = %e, "Event stream interrupted"),
                e => error!(error = %e, "Event stream failed"),
            }

            self.set_state(ConnectionState::Backoff);

            if self.config.max_retries > 0 {
                retry_count += 1;
                if retry_count >= self.config.max_retries {
                    error!(
                        max_retries = self.config.max_retries,
                        "Max reconnection attempts reached"
                    );
                    break;
                }
            }

            if let Some(duration) = backoff.next_backoff() {
                debug!(?duration, attempt = retry_count, "Waiting before reconnect");

                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = self.shutdown_rx.recv() => {
                        info!("Shutdown during backoff");
                        break;
                    }
                }
            } else {
                error!("Backoff exhausted");
                break;
            }
        }

        if let Err(e) = self.ctx.flush().await {
            warn!(error = %e, "Failed to flush sync state");
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Gateway stopped");
    }

    /// A watermark that is too fresh is covered by the stream's own replay;
    /// one that is too old predates the server's event log.
    fn should_catch_up(&self) -> bool {
        self.ctx
            .watermark()
            .get()
            .is_some_and(|mark| self.config.freshness.contains(mark, Timestamp::now()))
    }

    async fn catch_up(&self) -> SyncResult<usize> {
        let since = self.ctx.watermark();
        debug!(since = %since.since_segment(), "Fetching missed events");
        let events = self.client.fetch_event_batch(&since).await?;
        let count = events.len();
        self.ctx.ingest_batch(events).await?;
        Ok(count)
    }

    /// Opens the stream from the current watermark. Shutdown aborts the
    /// attempt with [`SyncError::ShuttingDown`].
    async fn connect_with_timeout(&mut self) -> SyncResult<Response> {
        let since = self.ctx.watermark();
        let connect = self.client.open_stream(&self.config.username, &since);

        tokio::select! {
            result = timeout(self.config.connect_timeout, connect) => match result {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
            },
            _ = self.shutdown_rx.recv() => Err(SyncError::ShuttingDown),
        }
    }

    /// Reads the stream until it ends, fails or shutdown is requested, and
    /// returns why it stopped: [`SyncError::StreamClosed`] when the server
    /// ended it, [`SyncError::ShuttingDown`] on shutdown.
    async fn stream_loop(&mut self, response: Response) -> SyncError {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for event in decoder.feed(&bytes) {
                            ingest_stream_event(&self.ctx, event).await;
                        }
                    }
                    Some(Err(e)) => return SyncError::from(e),
                    None => return SyncError::StreamClosed,
                },

                _ = self.shutdown_rx.recv() => return SyncError::ShuttingDown,
            }
        }
    }

    fn create_backoff(&self) -> Constant {
        Constant::new(self.config.reconnect_backoff)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// Queues one SSE event. Non-`message` events and bad payloads are skipped.
async fn ingest_stream_event(ctx: &SyncContext, sse: SseEvent) {
    if sse.event != MESSAGE {
        debug!(event = %sse.event, "Ignoring stream event");
        return;
    }

    let event: ChangeEvent = match serde_json::from_str(&sse.data) {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, data = %sse.data, "Skipping malformed stream event");
            return;
        }
    };

    let event_id = match sse.id.as_deref().map(str::parse::<Timestamp>) {
        Some(Ok(id)) => Some(id),
        Some(Err(e)) => {
            warn!(error = %e, "Stream event id is not a timestamp, using event time");
            None
        }
        None => None,
    };

    if let Err(e) = ctx.ingest(event, event_id).await {
        error!(error = %e, "Failed to queue stream event");
    }
}
