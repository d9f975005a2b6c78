//! In-process tree/events backend for integration tests.
//!
//! ```text
//! http://127.0.0.1:{port}/tree/batch/{collection}          GET
//! http://127.0.0.1:{port}/tree/rest/{collection}/          POST
//! http://127.0.0.1:{port}/tree/rest/{collection}/{id}      GET PUT
//! http://127.0.0.1:{port}/tree/rest/{collection}/{id}/{t}  DELETE
//! http://127.0.0.1:{port}/events/batch/{since}             GET
//! http://127.0.0.1:{port}/events/stream/{user}/{since}     GET (SSE)
//! ```
//!
//! Each stream connection plays the next scripted body and closes. Once the
//! scripts run out, connections stay open and silent.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use forrest_core::Timestamp;
use forrest_db::{Database, DbConfig};
use forrest_sync::{Endpoints, EngineSettings, RestClient, SyncContext};
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

#[derive(Default)]
pub struct MockState {
    records: Mutex<HashMap<(String, String), Value>>,
    tree_batches: Mutex<HashMap<String, Vec<Value>>>,
    event_batch: Mutex<Vec<Value>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    write_reply: Mutex<(u16, String)>,
    stream_scripts: Mutex<VecDeque<String>>,
    log: Mutex<Vec<String>>,
    writes: Mutex<Vec<String>>,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        init_tracing();

        let state = Arc::new(MockState::default());
        *state.write_reply.lock().unwrap() = (200, String::new());

        let tree = Router::new()
            .route("/batch/{collection}", get(tree_batch))
            .route("/rest/{collection}/", post(write_record))
            .route("/rest/{collection}/{id}", get(get_record).put(write_record_by_id))
            .route("/rest/{collection}/{id}/{target}", delete(delete_record));

        let events = Router::new()
            .route("/batch/{since}", get(event_batch))
            .route("/stream/{user}/", get(stream_from_start))
            .route("/stream/{user}/{since}", get(stream_since));

        let app = Router::new()
            .nest("/tree", tree)
            .nest("/events", events)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockBackend { addr, state }
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new(
            &format!("http://{}/events", self.addr),
            &format!("http://{}/tree", self.addr),
        )
        .unwrap()
    }

    pub fn client(&self) -> RestClient {
        RestClient::new(self.endpoints(), Duration::from_secs(2)).unwrap()
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    pub fn set_record(&self, collection: &str, record: Value) {
        let id = match &record["id"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.state
            .records
            .lock()
            .unwrap()
            .insert((collection.to_string(), id), record);
    }

    pub fn set_tree_batch(&self, collection: &str, records: Vec<Value>) {
        self.state
            .tree_batches
            .lock()
            .unwrap()
            .insert(collection.to_string(), records);
    }

    pub fn set_event_batch(&self, events: Vec<Value>) {
        *self.state.event_batch.lock().unwrap() = events;
    }

    /// Record fetches for `id` answer 500 until cleared.
    pub fn fail_record(&self, id: &str) {
        self.state.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn heal_record(&self, id: &str) {
        self.state.failing.lock().unwrap().remove(id);
    }

    /// Holds the answer to `request` (as logged, e.g. `"GET rest/tasks/a"`)
    /// for `by` before replying.
    pub fn delay(&self, request: &str, by: Duration) {
        self.state
            .delays
            .lock()
            .unwrap()
            .insert(request.to_string(), by);
    }

    pub fn reply_to_writes(&self, status: u16, body: &str) {
        *self.state.write_reply.lock().unwrap() = (status, body.to_string());
    }

    pub fn push_stream_script(&self, body: &str) {
        self.state
            .stream_scripts
            .lock()
            .unwrap()
            .push_back(body.to_string());
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every request seen, as `"METHOD path"` relative to its base.
    pub fn requests(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn count_requests(&self, prefix: &str) -> usize {
        self.requests().iter().filter(|r| r.starts_with(prefix)).count()
    }

    /// Bodies received by POST and PUT.
    pub fn writes(&self) -> Vec<String> {
        self.state.writes.lock().unwrap().clone()
    }
}

impl MockState {
    fn log(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }

    /// Logs the request, then sleeps out any delay scripted for it.
    async fn log_and_wait(&self, line: String) {
        let delay = self.delays.lock().unwrap().get(&line).copied();
        self.log(line);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn write_reply(&self) -> Response {
        let (status, body) = self.write_reply.lock().unwrap().clone();
        (StatusCode::from_u16(status).unwrap(), body).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn tree_batch(State(state): State<Arc<MockState>>, Path(collection): Path<String>) -> Response {
    state.log(format!("GET batch/{collection}"));
    let records = state
        .tree_batches
        .lock()
        .unwrap()
        .get(&collection)
        .cloned()
        .unwrap_or_default();
    Json(records).into_response()
}

async fn get_record(
    State(state): State<Arc<MockState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Response {
    state.log_and_wait(format!("GET rest/{collection}/{id}")).await;
    if state.failing.lock().unwrap().contains(&id) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match state.records.lock().unwrap().get(&(collection, id)) {
        Some(record) => Json(record.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn write_record(
    State(state): State<Arc<MockState>>,
    Path(collection): Path<String>,
    body: String,
) -> Response {
    state.log_and_wait(format!("POST rest/{collection}/")).await;
    state.writes.lock().unwrap().push(body);
    state.write_reply()
}

async fn write_record_by_id(
    State(state): State<Arc<MockState>>,
    Path((collection, id)): Path<(String, String)>,
    body: String,
) -> Response {
    state.log_and_wait(format!("PUT rest/{collection}/{id}")).await;
    state.writes.lock().unwrap().push(body);
    state.write_reply()
}

async fn delete_record(
    State(state): State<Arc<MockState>>,
    Path((collection, id, target)): Path<(String, String, String)>,
) -> Response {
    state.log_and_wait(format!("DELETE rest/{collection}/{id}/{target}")).await;
    state.write_reply()
}

async fn event_batch(State(state): State<Arc<MockState>>, Path(since): Path<String>) -> Response {
    state.log(format!("GET events/batch/{since}"));
    Json(state.event_batch.lock().unwrap().clone()).into_response()
}

async fn stream_from_start(
    State(state): State<Arc<MockState>>,
    Path(user): Path<String>,
) -> Response {
    open_stream(state, user, String::new())
}

async fn stream_since(
    State(state): State<Arc<MockState>>,
    Path((user, since)): Path<(String, String)>,
) -> Response {
    open_stream(state, user, since)
}

fn open_stream(state: Arc<MockState>, user: String, since: String) -> Response {
    state.log(format!("GET events/stream/{user}/{since}"));

    let body = match state.stream_scripts.lock().unwrap().pop_front() {
        Some(script) => Body::from(script),
        None => Body::from_stream(
            stream::iter([Ok::<_, std::io::Error>(": connected\n\n".to_string())])
                .chain(stream::pending()),
        ),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("forrest=debug,forrest_sync=debug,forrest_db=debug")
        .with_test_writer()
        .try_init();
}

pub async fn database() -> Database {
    Database::new(DbConfig::in_memory()).await.unwrap()
}

pub async fn context(db: &Database) -> Arc<SyncContext> {
    SyncContext::open(db, Duration::ZERO).await.unwrap()
}

/// Writes land immediately so tests can read them back at once.
pub fn engine_settings() -> EngineSettings {
    EngineSettings {
        busy_timeout_secs: 30,
        staleness_secs: 25 * 24 * 3600,
        persist_debounce_ms: 0,
    }
}

pub fn event(id: &str, branch: &str, action: &str, time: i64) -> Value {
    json!({ "id": id, "branch": branch, "action": action, "time": time })
}

/// Milliseconds `secs` ago.
pub fn ago(secs: u64) -> Timestamp {
    Timestamp::now().saturating_sub(Duration::from_secs(secs))
}

/// Polls `check` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
