//! # REST Client
//!
//! Thin `reqwest` wrapper over the tree and events backends.
//!
//! ```text
//!   read path                                write path
//!   ─────────                                ──────────
//!   fetch_event_batch   GET events/batch     write   POST tree/rest/{c}/
//!   fetch_collection    GET tree/batch/{c}           PUT  tree/rest/{c}/{id}
//!   fetch_record        GET tree/rest/{c}/id delete  DELETE tree/rest/{c}/{id}/{t}
//!   open_stream         GET events/stream
//! ```
//!
//! Reads insist on `200` and surface anything else as
//! [`SyncError::UnexpectedStatus`]. Writes hand back whatever status and
//! body the server chose; interpreting them is the engine's job.

use forrest_core::{ChangeEvent, Record, RecordId, Watermark};
use reqwest::{header, Method, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::Endpoints;
use crate::error::{SyncError, SyncResult};

/// Method of a record write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    Post,
    Put,
}

/// What the server answered to a write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse {
    pub status: u16,
    /// Parsed body; `None` when empty or not JSON.
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    endpoints: Arc<Endpoints>,
}

impl RestClient {
    /// Builds a client with a connect timeout. Stream bodies are unbounded,
    /// so there is no overall request timeout.
    pub fn new(endpoints: Endpoints, connect_timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(RestClient {
            client,
            endpoints: Arc::new(endpoints),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Change events newer than `since`. Entries that don't parse are
    /// logged and dropped.
    pub async fn fetch_event_batch(&self, since: &Watermark) -> SyncResult<Vec<ChangeEvent>> {
        let url = self.endpoints.event_batch(since)?;
        let items: Vec<Value> = self.get_ok(url).await?.json().await?;

        let mut events = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<ChangeEvent>(item) {
                Ok(event) => events.push(event),
                Err(e) => error!(error = %e, "Dropping malformed change event from batch"),
            }
        }
        Ok(events)
    }

    /// Every record of a collection.
    pub async fn fetch_collection_batch(&self, collection: &str) -> SyncResult<Vec<Record>> {
        let url = self.endpoints.collection_batch(collection)?;
        Ok(self.get_ok(url).await?.json().await?)
    }

    /// One record.
    pub async fn fetch_record(&self, collection: &str, id: &RecordId) -> SyncResult<Record> {
        let url = self.endpoints.record(collection, id)?;
        Ok(self.get_ok(url).await?.json().await?)
    }

    /// Opens the event stream. The response body is the SSE byte stream.
    pub async fn open_stream(&self, username: &str, since: &Watermark) -> SyncResult<Response> {
        let url = self.endpoints.stream(username, since)?;
        debug!(%url, "Opening event stream");
        let response = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        ensure_ok(response, &url)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// `POST` a new record or `PUT` an existing one.
    pub async fn write(
        &self,
        collection: &str,
        method: WriteMethod,
        record: &Record,
    ) -> SyncResult<WriteResponse> {
        let (method, url) = match method {
            WriteMethod::Post => (Method::POST, self.endpoints.collection(collection)?),
            WriteMethod::Put => {
                let id = record.require_id()?;
                (Method::PUT, self.endpoints.record(collection, &id)?)
            }
        };

        debug!(%method, %url, "Writing record");
        let response = self
            .client
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(record)?)
            .send()
            .await?;
        read_write_response(response).await
    }

    /// `DELETE` a record, addressing an optional sub-target.
    pub async fn delete(
        &self,
        collection: &str,
        id: &RecordId,
        target: &str,
    ) -> SyncResult<WriteResponse> {
        let url = self.endpoints.record_target(collection, id, target)?;
        debug!(%url, "Deleting record");
        let response = self.client.delete(url).send().await?;
        read_write_response(response).await
    }

    async fn get_ok(&self, url: Url) -> SyncResult<Response> {
        debug!(%url, "GET");
        let response = self.client.get(url.clone()).send().await?;
        ensure_ok(response, &url)
    }
}

fn ensure_ok(response: Response, url: &Url) -> SyncResult<Response> {
    if response.status() != StatusCode::OK {
        warn!(status = %response.status(), %url, "Unexpected response status");
        return Err(SyncError::UnexpectedStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }
    Ok(response)
}

async fn read_write_response(response: Response) -> SyncResult<WriteResponse> {
    let status = response.status().as_u16();
    let bytes = response.bytes().await?;
    let body = if bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&bytes).ok()
    };
    Ok(WriteResponse { status, body })
}
