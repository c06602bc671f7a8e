// ABOUTME: Integration tests for per-user sandbox lifecycle through the public manager API
// ABOUTME: Covers single-flight creation, transition ordering, removal and restore from SQLite

mod common;

use chrono::Utc;
use common::{manager, FakeRuntime};
use corral_sandbox::{
    ContainerStatus, PersistedRecord, SandboxOptions, SandboxState, SandboxStorage,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_requests_create_one_container() {
    let runtime = Arc::new(FakeRuntime::with_latency(Duration::from_millis(50)));
    let manager = Arc::new(manager(runtime.clone()));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .get_or_create_sandbox("u1", SandboxOptions::default())
                    .await
            })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(runtime.creates(), 1);
    assert!(handles.iter().all(|h| h == &handles[0]));
    assert_eq!(handles[0].state, SandboxState::Ready);
}

#[tokio::test]
async fn test_first_request_walks_the_creation_sequence() {
    let runtime = Arc::new(FakeRuntime::with_latency(Duration::from_millis(20)));
    let manager = Arc::new(manager(runtime.clone()));
    let mut events = manager.subscribe();

    let (first, second) = tokio::join!(
        manager.get_or_create_sandbox("42", SandboxOptions::default()),
        manager.get_or_create_sandbox("42", SandboxOptions::default()),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first, second);
    assert_eq!(first.sandbox_id, "corral-42");

    let mut observed = vec![SandboxState::NonExistent];
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.user_id, "42");
        assert_eq!(Some(&event.from), observed.last());
        observed.push(event.to);
    }
    assert_eq!(
        observed,
        vec![
            SandboxState::NonExistent,
            SandboxState::Creating,
            SandboxState::Starting,
            SandboxState::HealthChecking,
            SandboxState::Ready,
        ]
    );
    assert_eq!(runtime.creates(), 1);
}

#[tokio::test]
async fn test_removal_returns_the_record_to_non_existent() {
    let runtime = Arc::new(FakeRuntime::new());
    let manager = Arc::new(manager(runtime.clone()));

    manager
        .get_or_create_sandbox("u1", SandboxOptions::default())
        .await
        .unwrap();
    manager.remove_sandbox("u1").await.unwrap();

    let record = manager.get_record("u1").await.unwrap();
    assert_eq!(record.current_state, SandboxState::NonExistent);

    // A later request provisions a fresh container
    manager
        .get_or_create_sandbox("u1", SandboxOptions::default())
        .await
        .unwrap();
    assert_eq!(runtime.creates(), 2);
}

fn persisted(user_id: &str, state: SandboxState) -> PersistedRecord {
    PersistedRecord {
        user_id: user_id.to_string(),
        sandbox_name: format!("corral-{}", user_id),
        current_state: state,
        state_history: Vec::new(),
        last_transition_time: Utc::now(),
        last_error: None,
    }
}

#[tokio::test]
async fn test_restore_collapses_interrupted_creation_and_drift() {
    let storage = Arc::new(SandboxStorage::connect("sqlite::memory:").await.unwrap());
    storage
        .upsert_record(&persisted("mid-create", SandboxState::HealthChecking))
        .await
        .unwrap();
    storage
        .upsert_record(&persisted("gone", SandboxState::Ready))
        .await
        .unwrap();
    storage
        .upsert_record(&persisted("alive", SandboxState::Ready))
        .await
        .unwrap();

    let runtime = Arc::new(FakeRuntime::new());
    runtime.insert("corral-alive", ContainerStatus::Running);
    let manager = Arc::new(manager(runtime.clone()).with_storage(storage));

    assert_eq!(manager.restore().await.unwrap(), 3);
    let interrupted = manager.get_record("mid-create").await.unwrap();
    assert_eq!(interrupted.current_state, SandboxState::NonExistent);
    assert!(!interrupted.creation_guard);

    manager.reconcile_all().await;
    assert_eq!(
        manager.get_record("gone").await.unwrap().current_state,
        SandboxState::NonExistent
    );
    assert_eq!(
        manager.get_record("alive").await.unwrap().current_state,
        SandboxState::Ready
    );

    // The restored Ready sandbox is reused without another create
    manager
        .get_or_create_sandbox("alive", SandboxOptions::default())
        .await
        .unwrap();
    assert_eq!(runtime.creates(), 0);
}

#[tokio::test]
async fn test_stable_states_are_persisted() {
    let storage = Arc::new(SandboxStorage::connect("sqlite::memory:").await.unwrap());
    let runtime = Arc::new(FakeRuntime::new());
    let manager = Arc::new(manager(runtime).with_storage(storage.clone()));
    let persistence = manager.start_persistence().unwrap();

    manager
        .get_or_create_sandbox("u1", SandboxOptions::default())
        .await
        .unwrap();

    let mut saved = None;
    for _ in 0..50 {
        saved = storage.get_record("u1").await.unwrap();
        if saved
            .as_ref()
            .is_some_and(|r| r.current_state == SandboxState::Ready)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let saved = saved.unwrap();
    assert_eq!(saved.current_state, SandboxState::Ready);
    assert_eq!(saved.state_history.len(), 4);

    persistence.abort();
}
