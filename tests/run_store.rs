//! Run Store Integration Tests
//!
//! Persistence to per-run JSONL logs, replay on open, and restart recovery.

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use common::{origin, previous_images, Harness, COMMIT};
use shipgate::core::{PipelineSettings, RunStore};
use shipgate::domain::{
    FailureClass, ImageRef, ImageSet, PipelineRun, RunFailure, RunState, StageName, StageResult,
};

fn deploy_detail(images: &ImageSet) -> serde_json::Value {
    json!({ "target": "staging", "services": images })
}

/// Record a complete successful run that deployed `images`
async fn succeed(store: &RunStore, images: &ImageSet) -> PipelineRun {
    let run = PipelineRun::new(origin(COMMIT));
    let id = store.create(&run).await.unwrap();
    for name in StageName::ORDER {
        let detail = if name == StageName::Deploy {
            deploy_detail(images)
        } else {
            json!({})
        };
        store
            .append_stage(id, StageResult::success(name, 1, detail))
            .await
            .unwrap();
    }
    store.set_state(id, RunState::Succeeded).await.unwrap()
}

#[tokio::test]
async fn test_runs_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let images = previous_images();

    let original = {
        let store = RunStore::open(temp.path()).await.unwrap();
        succeed(&store, &images).await
    };

    let events = temp
        .path()
        .join(original.id.to_string())
        .join("events.jsonl");
    let content = std::fs::read_to_string(&events).unwrap();
    // created + 7 stages + running + succeeded
    assert_eq!(content.lines().count(), 10);

    let store = RunStore::open(temp.path()).await.unwrap();
    let replayed = store.get(original.id).await.unwrap();

    assert_eq!(replayed.state, RunState::Succeeded);
    assert_eq!(replayed.stages.len(), original.stages.len());
    assert_eq!(replayed.commit_ref, COMMIT);
    assert_eq!(replayed.finished_at, original.finished_at);
    assert_eq!(store.find_by_commit(&COMMIT[..7]).await.len(), 1);
}

#[tokio::test]
async fn test_terminal_guard_holds_after_reopen() {
    let temp = TempDir::new().unwrap();
    let id = {
        let store = RunStore::open(temp.path()).await.unwrap();
        let run = PipelineRun::new(origin(COMMIT));
        let id = store.create(&run).await.unwrap();
        store.set_state(id, RunState::Running).await.unwrap();
        store.set_state(id, RunState::Failed).await.unwrap();
        id
    };

    let store = RunStore::open(temp.path()).await.unwrap();
    let err = store.set_state(id, RunState::Succeeded).await.unwrap_err();
    assert!(err.is_consistency());
}

#[tokio::test]
async fn test_unreadable_logs_are_skipped() {
    let temp = TempDir::new().unwrap();
    let good = {
        let store = RunStore::open(temp.path()).await.unwrap();
        succeed(&store, &previous_images()).await
    };

    let broken = temp.path().join(uuid::Uuid::new_v4().to_string());
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("events.jsonl"), "{not json\n").unwrap();
    std::fs::create_dir_all(temp.path().join("not-a-run")).unwrap();

    let store = RunStore::open(temp.path()).await.unwrap();
    let runs = store.list(10).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, good.id);
}

#[tokio::test]
async fn test_served_images_follow_deploys_and_rollbacks() {
    let store = RunStore::in_memory();
    assert!(store.served_images("staging").await.is_empty());

    let first = previous_images();
    succeed(&store, &first).await;
    assert_eq!(store.served_images("staging").await, first);

    // A later run deploys new images, fails verify, and restores `first`
    let run = PipelineRun::new(origin("aaaaaaa1"));
    let id = store.create(&run).await.unwrap();
    let new_images: ImageSet = [("api".to_string(), ImageRef::new("shipgate.local/backend:new"))]
        .into_iter()
        .collect();
    for name in &StageName::ORDER[..6] {
        let detail = if *name == StageName::Deploy {
            deploy_detail(&new_images)
        } else {
            json!({})
        };
        store
            .append_stage(id, StageResult::success(*name, 1, detail))
            .await
            .unwrap();
    }
    store
        .append_stage(
            id,
            StageResult::failure(StageName::Verify, 1, FailureClass::Policy, json!({})),
        )
        .await
        .unwrap();

    let restored: ImageSet = first
        .iter()
        .filter(|(service, _)| *service == "api")
        .map(|(s, i)| (s.clone(), i.clone()))
        .collect();
    store
        .record_rollback(
            id,
            StageResult::success(StageName::Deploy, 1, deploy_detail(&restored)),
        )
        .await
        .unwrap();
    store.set_state(id, RunState::RolledBack).await.unwrap();

    assert_eq!(store.served_images("staging").await, first);
    assert!(store.served_images("production").await.is_empty());
}

#[tokio::test]
async fn test_interrupted_runs_are_closed() {
    let store = Arc::new(RunStore::in_memory());
    let mut harness = Harness::with_store(PipelineSettings::default(), Arc::clone(&store));
    let done = succeed(&store, &previous_images()).await;

    let queued = store.create(&PipelineRun::new(origin(COMMIT))).await.unwrap();
    let running = store.create(&PipelineRun::new(origin(COMMIT))).await.unwrap();
    store
        .append_stage(running, StageResult::success(StageName::Checkout, 1, json!({})))
        .await
        .unwrap();

    let closed = harness.engine.close_interrupted().await.unwrap();
    let mut closed: Vec<_> = closed.into_iter().map(|run| run.id).collect();
    closed.sort();
    let mut expected = vec![queued, running];
    expected.sort();
    assert_eq!(closed, expected);

    for id in [queued, running] {
        let run = store.get(id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.finished_at.is_some());
        assert_eq!(run.failure.unwrap().class, FailureClass::Cancelled);
    }
    assert_eq!(store.get(done.id).await.unwrap().state, RunState::Succeeded);

    // One notification per closed run, none for the finished one
    let mut notified = Vec::new();
    while let Ok(notification) = harness.notifications.try_recv() {
        assert_eq!(notification.state, RunState::Failed);
        notified.push(notification.run_id);
    }
    notified.sort();
    assert_eq!(notified, expected);

    assert!(harness.engine.close_interrupted().await.unwrap().is_empty());
    assert!(harness.notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_abandoned_run_is_closed_even_when_log_is_gone() {
    let temp = TempDir::new().unwrap();
    let store = RunStore::open(temp.path()).await.unwrap();
    let id = store.create(&PipelineRun::new(origin(COMMIT))).await.unwrap();

    // Put a file where the run's log directory was
    let run_dir = temp.path().join(id.to_string());
    std::fs::remove_dir_all(&run_dir).unwrap();
    std::fs::write(&run_dir, b"").unwrap();

    let failure = RunFailure {
        stage: None,
        class: FailureClass::Fatal,
        message: "run aborted".to_string(),
    };
    let run = store.abandon(id, failure.clone()).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(run.finished_at.is_some());
    assert_eq!(store.get(id).await.unwrap().failure, Some(failure.clone()));

    // Closed exactly once
    assert!(store.abandon(id, failure).await.is_err());
}

#[tokio::test]
async fn test_unrelated_runs_append_in_parallel() {
    let store = Arc::new(RunStore::in_memory());
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(store.create(&PipelineRun::new(origin(COMMIT))).await.unwrap());
    }

    let mut handles = Vec::new();
    for id in ids.clone() {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            for name in StageName::ORDER {
                store
                    .append_stage(id, StageResult::success(name, 1, json!({})))
                    .await
                    .unwrap();
            }
            store.set_state(id, RunState::Succeeded).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for id in ids {
        let run = store.get(id).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.stages.len(), StageName::ORDER.len());
    }
}

#[tokio::test]
async fn test_failure_and_alarm_are_replayed() {
    let temp = TempDir::new().unwrap();
    let id = {
        let store = RunStore::open(temp.path()).await.unwrap();
        let id = store.create(&PipelineRun::new(origin(COMMIT))).await.unwrap();
        store
            .append_stage(id, StageResult::success(StageName::Checkout, 1, json!({})))
            .await
            .unwrap();
        store
            .record_failure(
                id,
                RunFailure {
                    stage: Some(StageName::BuildBackend),
                    class: FailureClass::Fatal,
                    message: "compile error".to_string(),
                },
            )
            .await
            .unwrap();
        store.raise_alarm(id, "operator needed").await.unwrap();
        store.set_state(id, RunState::Failed).await.unwrap();
        id
    };

    let store = RunStore::open(temp.path()).await.unwrap();
    let run = store.get(id).await.unwrap();
    assert_eq!(run.stopped_at(), Some(StageName::BuildBackend));
    assert_eq!(run.alarm.as_deref(), Some("operator needed"));
    assert_eq!(run.failure.unwrap().message, "compile error");
}
