//! Dispatcher Integration Tests
//!
//! Per-target FIFO queueing: one running run at a time, back-pressure and
//! operator cancellation of queued runs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{staging, Harness, Step, COMMIT, REPOSITORY};
use shipgate::core::{DispatchError, Dispatcher, PipelineSettings, RunStore};
use shipgate::domain::{Component, FailureClass, ImageRef, RunState};
use shipgate::trigger::PipelineRequest;

fn request(delivery_id: &str, commit: &str) -> PipelineRequest {
    PipelineRequest {
        delivery_id: delivery_id.to_string(),
        commit_ref: commit.to_string(),
        branch: "main".to_string(),
        repository: REPOSITORY.to_string(),
        pusher: Some("octo".to_string()),
        received_at: Utc::now(),
    }
}

/// Builds hang once and time out after five seconds
fn slow_build_settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.timeouts.build_seconds = 5;
    settings
}

#[tokio::test(start_paused = true)]
async fn test_second_run_waits_for_the_first() {
    let mut harness = Harness::with_settings(slow_build_settings());
    harness.builder.script("backend", [Step::Hang]);
    let (dispatcher, _worker) = Dispatcher::spawn(harness.engine.clone(), staging(), 8);

    let first = dispatcher.submit(&request("d-1", COMMIT)).await.unwrap();
    let second = dispatcher
        .submit(&request("d-2", "aaaaaaa0000000000000000000000000000000bb"))
        .await
        .unwrap();
    assert_eq!(first.state, RunState::Pending);
    assert_eq!(first.delivery_id.as_deref(), Some("d-1"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        harness.store.get(first.id).await.unwrap().state,
        RunState::Running
    );
    assert_eq!(
        harness.store.get(second.id).await.unwrap().state,
        RunState::Pending
    );

    let done_first = harness.notifications.recv().await.unwrap();
    let done_second = harness.notifications.recv().await.unwrap();
    assert_eq!(done_first.run_id, first.id);
    assert_eq!(done_second.run_id, second.id);

    let first = harness.store.get(first.id).await.unwrap();
    let second = harness.store.get(second.id).await.unwrap();
    assert_eq!(first.state, RunState::Succeeded);
    assert_eq!(second.state, RunState::Succeeded);
    assert!(second.started_at.unwrap() >= first.finished_at.unwrap());

    // The worker publishes what the target serves after each run
    let served = dispatcher.current_images();
    assert_eq!(
        served["api"],
        ImageRef::canonical(
            "shipgate.local",
            Component::Backend.name(),
            &second.commit_ref,
            second.id
        )
    );
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_without_creating_a_run() {
    let harness = Harness::new();
    let (dispatcher, _worker) = Dispatcher::spawn(harness.engine.clone(), staging(), 1);

    dispatcher.submit(&request("d-1", COMMIT)).await.unwrap();
    assert_eq!(dispatcher.available_slots(), 0);

    let err = dispatcher.submit(&request("d-2", COMMIT)).await.unwrap_err();
    assert!(matches!(err, DispatchError::QueueFull(ref name) if name == "staging"));
    assert_eq!(harness.store.list(10).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_run() {
    let mut harness = Harness::with_settings(slow_build_settings());
    harness.builder.script("backend", [Step::Hang]);
    let (dispatcher, _worker) = Dispatcher::spawn(harness.engine.clone(), staging(), 8);

    let first = dispatcher.submit(&request("d-1", COMMIT)).await.unwrap();
    let second = dispatcher.submit(&request("d-2", COMMIT)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(dispatcher.cancel(second.id));
    assert!(!dispatcher.cancel(uuid::Uuid::new_v4()));

    harness.notifications.recv().await.unwrap();
    let cancelled = harness.notifications.recv().await.unwrap();
    assert_eq!(cancelled.run_id, second.id);
    assert_eq!(cancelled.state, RunState::Failed);

    let second = harness.store.get(second.id).await.unwrap();
    assert!(second.stages.is_empty());
    assert_eq!(second.failure.unwrap().class, FailureClass::Cancelled);
    assert_eq!(
        harness.store.get(first.id).await.unwrap().state,
        RunState::Succeeded
    );

    // Finished runs can no longer be cancelled
    assert!(!dispatcher.cancel(first.id));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_run_stops_at_next_boundary() {
    let mut harness = Harness::with_settings(slow_build_settings());
    harness.builder.script("backend", [Step::Hang]);
    let (dispatcher, _worker) = Dispatcher::spawn(harness.engine.clone(), staging(), 8);

    let run = dispatcher.submit(&request("d-1", COMMIT)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(dispatcher.cancel(run.id));

    let notification = harness.notifications.recv().await.unwrap();
    assert_eq!(notification.state, RunState::Failed);

    let run = harness.store.get(run.id).await.unwrap();
    assert_eq!(run.failure.unwrap().class, FailureClass::Cancelled);
    // The in-flight builds finished (the backend one by timeout); nothing after ran
    assert!(harness.builder.builds_for("test").is_empty());
    assert!(harness.runtime.applied().is_empty());
}

#[tokio::test]
async fn test_run_aborted_by_store_error_is_closed_and_notified() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(RunStore::open(temp.path()).await.unwrap());
    let mut harness = Harness::with_store(PipelineSettings::default(), Arc::clone(&store));
    let (dispatcher, worker) = Dispatcher::spawn(harness.engine.clone(), staging(), 8);

    let run = dispatcher.submit(&request("d-1", COMMIT)).await.unwrap();

    // The worker has not run yet; make the run's log unwritable
    let run_dir = temp.path().join(run.id.to_string());
    std::fs::remove_dir_all(&run_dir).unwrap();
    std::fs::write(&run_dir, b"").unwrap();

    let notification = harness.notifications.recv().await.unwrap();
    assert_eq!(notification.run_id, run.id);
    assert_eq!(notification.state, RunState::Failed);

    let aborted = store.get(run.id).await.unwrap();
    assert_eq!(aborted.state, RunState::Failed);
    assert!(aborted.finished_at.is_some());
    let failure = aborted.failure.unwrap();
    assert_eq!(failure.class, FailureClass::Fatal);
    assert!(failure.message.starts_with("run aborted"));
    assert!(harness.source.checkouts.lock().unwrap().is_empty());

    // No second notification; the worker exits once every handle is dropped
    drop(dispatcher);
    worker.await.unwrap();
    assert!(harness.notifications.try_recv().is_err());
}
