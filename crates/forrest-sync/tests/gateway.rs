//! Gateway against the mock backend: catch-up, stream ingestion and
//! reconnection, plus the full stream-to-store path.

mod common;

use common::*;
use forrest_core::{Action, ChangeEvent, RecordId, Timestamp};
use forrest_sync::{CollectionOptions, ConnectionState, Gateway, GatewayConfig, SyncEngine};
use serde_json::json;
use std::time::Duration;

fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        username: "alice".to_string(),
        connect_timeout: Duration::from_secs(2),
        reconnect_backoff: Duration::from_millis(50),
        ..Default::default()
    }
}

fn sse(id: Option<i64>, data: &serde_json::Value) -> String {
    match id {
        Some(id) => format!("id: {id}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

#[tokio::test]
async fn test_stream_events_are_queued() {
    let backend = MockBackend::start().await;
    let script = [
        sse(Some(1_000), &event("a", "tasks", "post", 900)),
        ": keepalive\n\n".to_string(),
        "event: ping\ndata: {}\n\n".to_string(),
        sse(None, &json!({"id": "b", "branch": "tasks", "action": "patch", "time": 950})),
        sse(Some(1_100), &event("c", "notes", "delete", 1_050)),
    ]
    .concat();
    backend.push_stream_script(&script);

    let db = database().await;
    let ctx = context(&db).await;
    let handle = Gateway::spawn(gateway_config(), backend.client(), ctx.clone());

    wait_until("two events queued", || ctx.queue().len() == 2).await;

    assert_eq!(ctx.pending("tasks")[0].id, RecordId::from("a"));
    assert_eq!(ctx.pending("notes")[0].action, Action::Delete);
    assert_eq!(ctx.watermark().get(), Some(Timestamp::from_millis(1_100)));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_resumes_from_watermark() {
    let backend = MockBackend::start().await;
    backend.push_stream_script(&sse(Some(500), &event("a", "tasks", "post", 400)));

    let db = database().await;
    let ctx = context(&db).await;
    let handle = Gateway::spawn(gateway_config(), backend.client(), ctx.clone());

    wait_until("second connection", || {
        backend.count_requests("GET events/stream/") >= 2
    })
    .await;
    wait_until("streaming", || handle.is_streaming()).await;

    let streams: Vec<_> = backend
        .requests()
        .into_iter()
        .filter(|r| r.starts_with("GET events/stream/"))
        .collect();
    assert_eq!(streams[0], "GET events/stream/alice/");
    assert_eq!(streams[1], "GET events/stream/alice/500");
    // No watermark at start, so no catch-up
    assert_eq!(backend.count_requests("GET events/batch/"), 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_catch_up_within_freshness_window() {
    let backend = MockBackend::start().await;
    let db = database().await;
    let ctx = context(&db).await;

    let since = ago(2 * 3600);
    ctx.ingest(ChangeEvent::new("old", "archive", Action::Post, since), None)
        .await
        .unwrap();

    let newer = ago(3600).millis();
    backend.set_event_batch(vec![
        event("a", "tasks", "post", newer - 10),
        event("b", "tasks", "put", newer),
        json!({"id": "bad", "branch": "tasks", "action": "nope", "time": newer}),
    ]);

    let handle = Gateway::spawn(gateway_config(), backend.client(), ctx.clone());
    wait_until("streaming", || handle.is_streaming()).await;

    assert_eq!(
        backend.requests()[0],
        format!("GET events/batch/{}", since.millis())
    );
    assert_eq!(ctx.pending("tasks").len(), 2);
    assert_eq!(ctx.watermark().get(), Some(Timestamp::from_millis(newer)));
    assert_eq!(
        backend.requests()[1],
        format!("GET events/stream/alice/{newer}")
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_no_catch_up_for_fresh_or_ancient_watermark() {
    for age in [60, 40 * 24 * 3600] {
        let backend = MockBackend::start().await;
        let db = database().await;
        let ctx = context(&db).await;
        ctx.ingest(ChangeEvent::new("x", "archive", Action::Post, ago(age)), None)
            .await
            .unwrap();

        let handle = Gateway::spawn(gateway_config(), backend.client(), ctx.clone());
        wait_until("streaming", || handle.is_streaming()).await;

        assert_eq!(backend.count_requests("GET events/batch/"), 0);
        handle.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_shutdown_settles_disconnected() {
    let backend = MockBackend::start().await;
    let db = database().await;
    let ctx = context(&db).await;
    let handle = Gateway::spawn(gateway_config(), backend.client(), ctx);

    wait_until("streaming", || handle.is_streaming()).await;
    handle.shutdown().await.unwrap();

    let mut state = handle.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_shutdown_aborts_hanging_connect() {
    // Accepts TCP connections but never answers the request
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let endpoints = forrest_sync::Endpoints::new(
        &format!("http://{addr}/events"),
        &format!("http://{addr}/tree"),
    )
    .unwrap();
    let client = forrest_sync::RestClient::new(endpoints, Duration::from_secs(2)).unwrap();
    let db = database().await;
    let config = GatewayConfig {
        connect_timeout: Duration::from_secs(60),
        ..gateway_config()
    };

    let handle = Gateway::spawn(config, client, context(&db).await);
    let mut state = handle.subscribe_state();
    state
        .wait_for(|s| *s == ConnectionState::Connecting)
        .await
        .unwrap();

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while state.changed().await.is_ok() {}
    })
    .await
    .unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    drop(listener);
}

#[tokio::test]
async fn test_max_retries_gives_up() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let endpoints = forrest_sync::Endpoints::new(
        &format!("http://{addr}/events"),
        &format!("http://{addr}/tree"),
    )
    .unwrap();
    let client = forrest_sync::RestClient::new(endpoints, Duration::from_secs(1)).unwrap();
    let db = database().await;
    let config = GatewayConfig {
        max_retries: 2,
        ..gateway_config()
    };

    let handle = Gateway::spawn(config, client, context(&db).await);
    let mut state = handle.subscribe_state();

    // The state channel closes once the gateway task has returned
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.changed().await.is_ok() {}
    })
    .await
    .unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    assert!(handle.shutdown().await.is_err());
}

#[tokio::test]
async fn test_stream_event_reaches_store() {
    let backend = MockBackend::start().await;
    let t0 = ago(3600).millis();
    backend.set_tree_batch("tasks", vec![json!({"id": "seed", "upd": t0})]);
    backend.set_record("tasks", json!({"id": "a", "upd": t0 + 5, "title": "streamed"}));
    backend.push_stream_script(&[
        sse(Some(t0 + 5), &event("a", "tasks", "post", t0 + 5)),
        sse(Some(t0 + 6), &event("seed", "tasks", "delete", t0 + 6)),
    ]
    .concat());

    let db = database().await;
    let ctx = context(&db).await;
    let engine = SyncEngine::open(
        ctx.clone(),
        backend.client(),
        &db,
        &engine_settings(),
        CollectionOptions::new("tasks"),
    )
    .await
    .unwrap();
    let handle = Gateway::spawn(gateway_config(), backend.client(), ctx.clone());

    wait_until("both events applied", || {
        ctx.watermark().get() == Some(Timestamp::from_millis(t0 + 6)) && engine.pending().is_empty()
    })
    .await;

    let records = engine.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("title"), Some(&json!("streamed")));
    assert_eq!(engine.last_update(), Some(Timestamp::from_millis(t0 + 5)));

    handle.shutdown().await.unwrap();
    engine.shutdown().await.unwrap();
}
