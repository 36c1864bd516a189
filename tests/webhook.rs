//! HTTP Handler Integration Tests
//!
//! Drives the axum handlers directly with extracted requests.

mod common;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;

use common::{staging, Harness, COMMIT, REPOSITORY};
use shipgate::core::Dispatcher;
use shipgate::server::hooks::{receive_push, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};
use shipgate::server::runs::{cancel_run, get_run, get_target, list_runs, RunQuery};
use shipgate::server::AppState;
use shipgate::trigger::{sign, TriggerReceiver, TriggerSettings};

const SECRET: &[u8] = b"hook-secret";

fn app(harness: &Harness, capacity: usize) -> AppState {
    let receiver = TriggerReceiver::new(&TriggerSettings::default(), SECRET).unwrap();
    let (dispatcher, _worker) = Dispatcher::spawn(harness.engine.clone(), staging(), capacity);
    AppState {
        receiver: Arc::new(receiver),
        dispatcher,
        store: harness.store.clone(),
    }
}

fn push_body(branch: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ref": format!("refs/heads/{}", branch),
        "after": COMMIT,
        "repository": { "clone_url": REPOSITORY },
        "pusher": { "name": "octo" },
    }))
    .unwrap()
}

fn headers(body: &[u8], delivery: &str, event: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        SIGNATURE_HEADER,
        HeaderValue::from_str(&sign(SECRET, body)).unwrap(),
    );
    headers.insert(DELIVERY_HEADER, HeaderValue::from_str(delivery).unwrap());
    headers.insert(EVENT_HEADER, HeaderValue::from_str(event).unwrap());
    headers
}

async fn push(
    state: &AppState,
    headers: HeaderMap,
    body: Vec<u8>,
) -> (StatusCode, serde_json::Value) {
    let response = match receive_push(State(state.clone()), headers, Bytes::from(body)).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test(start_paused = true)]
async fn test_valid_push_queues_one_run() {
    let harness = Harness::new();
    let state = app(&harness, 8);
    let body = push_body("main");

    let (status, value) = push(&state, headers(&body, "d-1", "push"), body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["status"], "queued");
    let run_id: uuid::Uuid = serde_json::from_value(value["run_id"].clone()).unwrap();

    // Redelivery of the same event
    let (status, value) = push(&state, headers(&body, "d-1", "push"), body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(value["delivery_id"], "d-1");

    let runs = harness.store.list(10).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run_id);
    assert_eq!(runs[0].commit_ref, COMMIT);
}

#[tokio::test(start_paused = true)]
async fn test_bad_signature_is_unauthorized() {
    let harness = Harness::new();
    let state = app(&harness, 8);
    let body = push_body("main");

    let mut tampered = headers(&body, "d-1", "push");
    tampered.insert(
        SIGNATURE_HEADER,
        HeaderValue::from_str(&sign(b"wrong", &body)).unwrap(),
    );
    let (status, value) = push(&state, tampered, body.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(value["error"].is_string());

    let mut unsigned = headers(&body, "d-2", "push");
    unsigned.remove(SIGNATURE_HEADER);
    let (status, _) = push(&state, unsigned, body).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(harness.store.list(10).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_payload_is_unprocessable() {
    let harness = Harness::new();
    let state = app(&harness, 8);
    let body = b"{\"ref\": 42".to_vec();

    let (status, value) = push(&state, headers(&body, "d-1", "push"), body).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(!value["error"].as_str().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_other_branches_and_events_are_no_ops() {
    let harness = Harness::new();
    let state = app(&harness, 8);

    let body = push_body("feature/login");
    let (status, _) = push(&state, headers(&body, "d-1", "push"), body).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let body = br#"{"zen": "Keep it logically awesome."}"#.to_vec();
    let (status, _) = push(&state, headers(&body, "d-2", "ping"), body).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert!(harness.store.list(10).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_releases_delivery_for_redelivery() {
    let harness = Harness::new();
    let state = app(&harness, 1);

    let first = push_body("main");
    let (status, _) = push(&state, headers(&first, "d-1", "push"), first).await;
    assert_eq!(status, StatusCode::OK);

    let second = push_body("main");
    let (status, value) = push(&state, headers(&second, "d-2", "push"), second.clone()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(value["error"].as_str().unwrap().contains("full"));

    // Once the worker drains the queue the redelivery is accepted, not deduplicated
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let (status, _) = push(&state, headers(&second, "d-2", "push"), second).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn test_inspection_endpoints() {
    let mut harness = Harness::new();
    let state = app(&harness, 8);
    let body = push_body("main");
    let (_, value) = push(&state, headers(&body, "d-1", "push"), body).await;
    let run_id: uuid::Uuid = serde_json::from_value(value["run_id"].clone()).unwrap();

    harness.notifications.recv().await.unwrap();

    let view = get_run(State(state.clone()), Path(run_id)).await.unwrap().0;
    assert_eq!(view.run.id, run_id);
    assert!(view.stopped_at.is_none());
    let json = serde_json::to_value(&view).unwrap();
    assert_eq!(json["state"], "succeeded");
    assert_eq!(json["stages"].as_array().unwrap().len(), 7);

    let missing = get_run(State(state.clone()), Path(uuid::Uuid::new_v4()))
        .await
        .unwrap_err()
        .into_response();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let by_commit = list_runs(
        State(state.clone()),
        Query(RunQuery {
            commit: Some(COMMIT[..8].to_string()),
            limit: None,
        }),
    )
    .await
    .unwrap()
    .0;
    assert_eq!(by_commit.len(), 1);

    let too_short = list_runs(
        State(state.clone()),
        Query(RunQuery {
            commit: Some("3f2c".to_string()),
            limit: None,
        }),
    )
    .await
    .unwrap_err()
    .into_response();
    assert_eq!(too_short.status(), StatusCode::BAD_REQUEST);

    let target = get_target(State(state.clone())).await.0;
    assert_eq!(target.name, "staging");
    assert_eq!(target.images.len(), 2);

    // Finished runs cannot be cancelled
    let cancel = match cancel_run(State(state.clone()), Path(run_id)).await {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    };
    assert_eq!(cancel.status(), StatusCode::NOT_FOUND);
}
