//! Tests for quota enforcement at submission and execution-creation time.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use uuid::Uuid;

use conveyor::{
    ArtifactError, ArtifactStorage, BatchRegistry, Checksum, ExecutionStatus, ExecutionTracker,
    ManualClock, MemoryStore, OutputFileManager, ProcessQuota, QuotaEnforcer, StatusNotifier,
    SubmitError, SubmitRequest,
};

struct NullArtifacts;

impl ArtifactStorage for NullArtifacts {
    fn remove<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<(), ArtifactError>> {
        Box::pin(async { Ok(()) })
    }
}

struct Harness {
    registry: BatchRegistry,
    tracker: ExecutionTracker,
    quota: QuotaEnforcer,
    manager: OutputFileManager,
}

fn harness(max_parallel: u32, max_bytes: u64) -> Harness {
    conveyor::init_tracing();
    let store = MemoryStore::new();
    let clock = ManualClock::at(Utc::now());
    let quota = QuotaEnforcer::new(
        Box::new(store.clone()),
        Box::new(store.clone()),
        HashMap::new(),
        ProcessQuota {
            max_parallel_executions_per_user: max_parallel,
            max_bytes_in_cache: max_bytes,
        },
    );
    let tracker = ExecutionTracker::new(
        Box::new(store.clone()),
        quota.clone(),
        StatusNotifier::new(),
        Arc::new(clock.clone()),
        3,
    );
    let registry = BatchRegistry::new(
        Box::new(store.clone()),
        tracker.clone(),
        quota.clone(),
        Arc::new(clock.clone()),
    );
    let manager = OutputFileManager::new(
        Box::new(store.clone()),
        Arc::new(NullArtifacts),
        Arc::new(clock),
    );
    Harness {
        registry,
        tracker,
        quota,
        manager,
    }
}

fn request(process_business_id: Uuid, correlation_id: &str) -> SubmitRequest {
    SubmitRequest {
        correlation_id: correlation_id.into(),
        process_business_id,
        process_name: "resample".into(),
        tenant: "default".into(),
        user_email: "user@example.com".into(),
        user_role: "EXPLOIT".into(),
        parameters: serde_json::json!({}),
        file_set_stats: Vec::new(),
        input_files: Vec::new(),
        expected_duration_millis: 60_000,
        timeout_after_millis: 60_000,
    }
}

#[tokio::test]
async fn second_submission_is_rejected_while_first_is_active() -> Result<()> {
    let h = harness(1, u64::MAX);
    let process = Uuid::new_v4();

    let receipt = h.registry.submit(request(process, "corr-1")).await?;
    h.tracker
        .append_step(receipt.execution_id, ExecutionStatus::Running, "started")
        .await?;

    let err = h.registry.submit(request(process, "corr-2")).await.unwrap_err();
    assert!(matches!(err, SubmitError::Quota(_)));
    // The rejected submission left no batch behind.
    assert_eq!(
        h.tracker
            .find_by_status(
                "default",
                &[ExecutionStatus::Registered, ExecutionStatus::Running],
                conveyor::PageRequest::of(0, 10),
            )
            .await?
            .total,
        1
    );

    // Once the first execution terminates, admission reopens.
    h.tracker
        .append_step(receipt.execution_id, ExecutionStatus::Success, "done")
        .await?;
    let second = h.registry.submit(request(process, "corr-3")).await?;
    assert_ne!(second.batch_id, receipt.batch_id);
    Ok(())
}

#[tokio::test]
async fn quota_is_rechecked_at_execution_creation() -> Result<()> {
    let h = harness(1, u64::MAX);
    let process = Uuid::new_v4();

    let receipt = h.registry.submit(request(process, "corr-1")).await?;
    let batch = h.registry.get_batch(receipt.batch_id).await?.unwrap();

    // A second execution for the same batch hits the same ceiling even
    // though no new submission happened.
    let err = h
        .tracker
        .create_execution(&batch, Vec::new(), 60_000, 60_000)
        .await
        .unwrap_err();
    assert!(matches!(err, conveyor::TrackerError::Quota(_)));
    Ok(())
}

#[tokio::test]
async fn terminal_executions_do_not_count_against_parallelism() -> Result<()> {
    let h = harness(2, u64::MAX);
    let process = Uuid::new_v4();

    let first = h.registry.submit(request(process, "corr-1")).await?;
    h.tracker
        .append_step(first.execution_id, ExecutionStatus::Running, "started")
        .await?;
    h.tracker
        .append_step(first.execution_id, ExecutionStatus::Failure, "boom")
        .await?;

    h.registry.submit(request(process, "corr-2")).await?;
    h.registry.submit(request(process, "corr-3")).await?;
    Ok(())
}

#[tokio::test]
async fn cache_quota_is_reported_not_blocking() -> Result<()> {
    let h = harness(10, 1_000);
    let process = Uuid::new_v4();
    let receipt = h.registry.submit(request(process, "corr-1")).await?;

    h.manager
        .register_output_file(
            receipt.execution_id,
            "big.nc".into(),
            Checksum {
                method: "MD5".into(),
                value: "abc".into(),
            },
            "file:///cache/big.nc".into(),
            4_096,
        )
        .await?;

    assert_eq!(h.quota.cached_bytes(process).await?, 4_096);
    assert!(h.quota.cache_over_quota(process).await?);
    // Cache pressure never blocks admission.
    h.registry.submit(request(process, "corr-2")).await?;
    Ok(())
}
