//! Batch Registry: submission orchestration.
//!
//! Quota check first, then the durable batch record, then the first
//! execution. A quota rejection writes nothing.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{Batch, FileSetStats};
use crate::quota::{QuotaEnforcer, QuotaError};
use crate::store::{BatchStore, StoreError};
use crate::tracker::{ExecutionTracker, TrackerError};

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Caller-supplied idempotency token.
    pub correlation_id: String,
    pub process_business_id: Uuid,
    pub process_name: String,
    pub tenant: String,
    pub user_email: String,
    pub user_role: String,
    pub parameters: serde_json::Value,
    pub file_set_stats: Vec<FileSetStats>,
    pub input_files: Vec<String>,
    pub expected_duration_millis: i64,
    pub timeout_after_millis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub batch_id: Uuid,
    pub execution_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct BatchRegistry {
    batches: Box<dyn BatchStore>,
    tracker: ExecutionTracker,
    quota: QuotaEnforcer,
    clock: Arc<dyn Clock>,
}

impl BatchRegistry {
    pub fn new(
        batches: Box<dyn BatchStore>,
        tracker: ExecutionTracker,
        quota: QuotaEnforcer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            batches,
            tracker,
            quota,
            clock,
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        self.quota
            .check_parallel_quota(&request.user_email, request.process_business_id)
            .await?;

        let batch = Batch::new(
            request.correlation_id,
            request.process_business_id,
            request.process_name,
            request.tenant,
            request.user_email,
            request.user_role,
            request.parameters,
            request.file_set_stats,
            self.clock.now(),
        );
        self.batches.insert(&batch).await?;
        info!(
            batch_id = %batch.id,
            correlation_id = %batch.correlation_id,
            process = %batch.process_name,
            "batch registered",
        );

        let execution = self
            .tracker
            .create_execution(
                &batch,
                request.input_files,
                request.expected_duration_millis,
                request.timeout_after_millis,
            )
            .await?;

        Ok(SubmitReceipt {
            batch_id: batch.id,
            execution_id: execution.id,
        })
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, SubmitError> {
        Ok(self.batches.get(id).await?)
    }
}
