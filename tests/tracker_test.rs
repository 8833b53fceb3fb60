//! Tests for the execution tracker: terminal immutability and lost-update
//! freedom under concurrent writers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use conveyor::{
    AppendOutcome, Batch, BatchRegistry, CasOutcome, Execution, ExecutionStatus, ExecutionStore,
    ExecutionTracker, ManualClock, MemoryStore, Page, PageRequest, ProcessQuota, QuotaEnforcer,
    StatusNotifier, StoreError, SubmitRequest, TrackerError,
};

fn quota_enforcer(store: &MemoryStore, max_parallel: u32) -> QuotaEnforcer {
    QuotaEnforcer::new(
        Box::new(store.clone()),
        Box::new(store.clone()),
        HashMap::new(),
        ProcessQuota {
            max_parallel_executions_per_user: max_parallel,
            ..ProcessQuota::default()
        },
    )
}

fn tracker(store: &MemoryStore, clock: &ManualClock, max_retries: u32) -> ExecutionTracker {
    ExecutionTracker::new(
        Box::new(store.clone()),
        quota_enforcer(store, 1_000),
        StatusNotifier::new(),
        Arc::new(clock.clone()),
        max_retries,
    )
}

fn test_batch() -> Batch {
    Batch::new(
        "corr-1".into(),
        Uuid::new_v4(),
        "resample".into(),
        "default".into(),
        "user@example.com".into(),
        "EXPLOIT".into(),
        serde_json::json!({"grid": "0.5deg"}),
        Vec::new(),
        Utc::now(),
    )
}

#[tokio::test]
async fn create_execution_starts_with_single_registered_step() -> Result<()> {
    let store = MemoryStore::new();
    let clock = ManualClock::at(Utc::now());
    let tracker = tracker(&store, &clock, 3);

    let execution = tracker
        .create_execution(&test_batch(), vec!["file:///in.nc".into()], 60_000, 1_000)
        .await?;

    assert_eq!(execution.version, 0);
    assert_eq!(execution.steps.len(), 1);
    assert_eq!(execution.current_status, ExecutionStatus::Registered);
    assert_eq!(execution.input_files, vec!["file:///in.nc".to_string()]);
    Ok(())
}

#[tokio::test]
async fn append_after_terminal_is_a_no_op() -> Result<()> {
    let store = MemoryStore::new();
    let clock = ManualClock::at(Utc::now());
    let tracker = tracker(&store, &clock, 3);
    let execution = tracker
        .create_execution(&test_batch(), Vec::new(), 60_000, 1_000)
        .await?;

    tracker
        .append_step(execution.id, ExecutionStatus::Running, "started")
        .await?;
    tracker
        .append_step(execution.id, ExecutionStatus::Success, "done")
        .await?;

    let before = tracker.get(execution.id).await?;
    let outcome = tracker
        .append_step(execution.id, ExecutionStatus::Running, "late heartbeat")
        .await?;
    let after = tracker.get(execution.id).await?;

    assert_eq!(
        outcome,
        AppendOutcome::AlreadyTerminal(ExecutionStatus::Success)
    );
    assert_eq!(after.steps.len(), 3);
    assert_eq!(after.current_status, ExecutionStatus::Success);
    assert_eq!(after.version, before.version);
    Ok(())
}

#[tokio::test]
async fn illegal_transition_is_rejected_without_writing() -> Result<()> {
    let store = MemoryStore::new();
    let clock = ManualClock::at(Utc::now());
    let tracker = tracker(&store, &clock, 3);
    let execution = tracker
        .create_execution(&test_batch(), Vec::new(), 60_000, 1_000)
        .await?;

    let err = tracker
        .append_step(execution.id, ExecutionStatus::Success, "skipped running")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        conveyor::TrackerError::IllegalTransition {
            from: ExecutionStatus::Registered,
            to: ExecutionStatus::Success,
        }
    ));
    assert_eq!(tracker.get(execution.id).await?.version, 0);
    Ok(())
}

/// Store whose conditional writes always lose, as if another writer raced
/// in between every reload. Reads and inserts delegate to the inner store.
#[derive(Clone)]
struct ContendedStore {
    inner: MemoryStore,
    cas_calls: Arc<AtomicU32>,
}

impl ExecutionStore for ContendedStore {
    fn clone_box(&self) -> Box<dyn ExecutionStore> {
        Box::new(self.clone())
    }

    fn insert<'a>(&'a self, execution: &'a Execution) -> BoxFuture<'a, Result<(), StoreError>> {
        ExecutionStore::insert(&self.inner, execution)
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<Execution>, StoreError>> {
        ExecutionStore::get(&self.inner, id)
    }

    fn compare_and_swap<'a>(
        &'a self,
        _updated: &'a Execution,
        _expected_version: u64,
    ) -> BoxFuture<'a, Result<CasOutcome, StoreError>> {
        Box::pin(async move {
            self.cas_calls.fetch_add(1, Ordering::SeqCst);
            Ok(CasOutcome::VersionMismatch)
        })
    }

    fn find_by_status<'a>(
        &'a self,
        tenant: &'a str,
        statuses: &'a [ExecutionStatus],
        page: PageRequest,
    ) -> BoxFuture<'a, Result<Page<Execution>, StoreError>> {
        self.inner.find_by_status(tenant, statuses, page)
    }

    fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> BoxFuture<'_, Result<Vec<Execution>, StoreError>> {
        self.inner.find_timed_out(now, limit)
    }

    fn count_active<'a>(
        &'a self,
        user_email: &'a str,
        process_business_id: Uuid,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        self.inner.count_active(user_email, process_business_id)
    }
}

#[tokio::test]
async fn exhausted_retry_budget_surfaces_a_conflict() -> Result<()> {
    let store = MemoryStore::new();
    let clock = ManualClock::at(Utc::now());
    let cas_calls = Arc::new(AtomicU32::new(0));
    let contended = ContendedStore {
        inner: store.clone(),
        cas_calls: cas_calls.clone(),
    };
    let tracker = ExecutionTracker::new(
        Box::new(contended),
        quota_enforcer(&store, 1_000),
        StatusNotifier::new(),
        Arc::new(clock.clone()),
        3,
    );
    let execution = tracker
        .create_execution(&test_batch(), Vec::new(), 60_000, 1_000)
        .await?;

    let err = tracker
        .append_step(execution.id, ExecutionStatus::Running, "started")
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::Conflict { attempts: 3, .. }));
    // One conditional write per attempt, nothing persisted.
    assert_eq!(cas_calls.load(Ordering::SeqCst), 3);
    let stored = tracker.get(execution.id).await?;
    assert_eq!(stored.version, 0);
    assert_eq!(stored.steps.len(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_appends_lose_no_updates() -> Result<()> {
    let store = MemoryStore::new();
    let clock = ManualClock::at(Utc::now());
    // Retry budget above the writer count so every heartbeat lands.
    let tracker = tracker(&store, &clock, 16);
    let execution = tracker
        .create_execution(&test_batch(), Vec::new(), 60_000, 60_000)
        .await?;
    tracker
        .append_step(execution.id, ExecutionStatus::Running, "started")
        .await?;

    let writers = 8;
    let mut handles = Vec::new();
    for i in 0..writers {
        let tracker = tracker.clone();
        let id = execution.id;
        handles.push(tokio::spawn(async move {
            tracker
                .append_step(id, ExecutionStatus::Running, &format!("heartbeat {i}"))
                .await
        }));
    }
    for handle in handles {
        assert!(matches!(handle.await?, Ok(AppendOutcome::Appended(_))));
    }

    let stored = tracker.get(execution.id).await?;
    // Initial REGISTERED + started + 8 heartbeats.
    assert_eq!(stored.steps.len(), 2 + writers);
    assert_eq!(stored.version, 1 + writers as u64);
    for pair in stored.steps.windows(2) {
        assert!(pair[0].time <= pair[1].time);
    }
    Ok(())
}

#[tokio::test]
async fn stress_many_concurrent_submission_flows() -> Result<()> {
    let store = MemoryStore::new();
    let clock = ManualClock::at(Utc::now());
    let tracker = tracker(&store, &clock, 3);
    let registry = BatchRegistry::new(
        Box::new(store.clone()),
        tracker.clone(),
        quota_enforcer(&store, 1_000),
        Arc::new(clock.clone()),
    );

    let mut handles = Vec::new();
    for i in 0..200 {
        let registry = registry.clone();
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            let receipt = registry
                .submit(SubmitRequest {
                    correlation_id: format!("corr-{i}"),
                    process_business_id: Uuid::new_v4(),
                    process_name: "resample".into(),
                    tenant: "default".into(),
                    user_email: format!("user{i}@example.com"),
                    user_role: "EXPLOIT".into(),
                    parameters: serde_json::json!({}),
                    file_set_stats: Vec::new(),
                    input_files: Vec::new(),
                    expected_duration_millis: 60_000,
                    timeout_after_millis: 60_000,
                })
                .await?;
            tracker
                .append_step(receipt.execution_id, ExecutionStatus::Running, "started")
                .await?;
            let outcome = tracker
                .append_step(receipt.execution_id, ExecutionStatus::Success, "done")
                .await?;
            anyhow::Ok((receipt.execution_id, outcome))
        }));
    }

    for handle in handles {
        let (execution_id, outcome) = handle.await??;
        let AppendOutcome::Appended(local) = outcome else {
            panic!("expected appended outcome");
        };
        let stored = tracker.get(execution_id).await?;
        assert_eq!(stored, local);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.current_status, ExecutionStatus::Success);
    }
    Ok(())
}

#[tokio::test]
async fn status_events_are_published_on_append() -> Result<()> {
    let store = MemoryStore::new();
    let clock = ManualClock::at(Utc::now());
    let tracker = tracker(&store, &clock, 3);
    let mut events = tracker.notifier().subscribe();

    let execution = tracker
        .create_execution(&test_batch(), Vec::new(), 60_000, 1_000)
        .await?;
    tracker
        .append_step(execution.id, ExecutionStatus::Running, "started")
        .await?;

    let created = events.recv().await?;
    assert_eq!(created.status, ExecutionStatus::Registered);
    let running = events.recv().await?;
    assert_eq!(running.execution_id, execution.id);
    assert_eq!(running.status, ExecutionStatus::Running);
    Ok(())
}
