//! Execution Tracker: creates executions and appends progress steps.
//!
//! Two writers race on the same execution: the worker driving the workload
//! engine and the timeout sweep. Coordination is purely optimistic: read
//! the current version, compute the new step log, write conditionally, and
//! on a version mismatch reload and re-decide. The terminal-state guard is
//! re-checked after every reload, so losing a race against a completing
//! writer degrades into a benign no-op instead of a double terminal step.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{Batch, Execution, ExecutionStatus, TransitionError};
use crate::events::{StatusChanged, StatusNotifier};
use crate::quota::{QuotaEnforcer, QuotaError};
use crate::store::{CasOutcome, ExecutionStore, Page, PageRequest, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    /// Optimistic retries exhausted; transient, the caller may retry later.
    #[error("version conflict on execution {id} after {attempts} attempts")]
    Conflict { id: Uuid, attempts: u32 },
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a successful `append_step` call.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The step was appended; carries the persisted execution.
    Appended(Execution),
    /// The execution was already terminal. Idempotent no-op, not a failure.
    AlreadyTerminal(ExecutionStatus),
}

#[derive(Clone)]
pub struct ExecutionTracker {
    store: Box<dyn ExecutionStore>,
    quota: QuotaEnforcer,
    notifier: StatusNotifier,
    clock: Arc<dyn Clock>,
    max_retries_on_conflict: u32,
}

impl ExecutionTracker {
    pub fn new(
        store: Box<dyn ExecutionStore>,
        quota: QuotaEnforcer,
        notifier: StatusNotifier,
        clock: Arc<dyn Clock>,
        max_retries_on_conflict: u32,
    ) -> Self {
        Self {
            store,
            quota,
            notifier,
            clock,
            max_retries_on_conflict,
        }
    }

    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    /// Persist a new execution for `batch` whose step log is exactly
    /// `[REGISTERED @ now]`. The parallel quota is re-checked here, not only
    /// at submission, so two batches submitted back-to-back cannot both
    /// spawn executions past the ceiling.
    pub async fn create_execution(
        &self,
        batch: &Batch,
        input_files: Vec<String>,
        expected_duration_millis: i64,
        timeout_after_millis: i64,
    ) -> Result<Execution, TrackerError> {
        self.quota
            .check_parallel_quota(&batch.user_email, batch.process_business_id)
            .await?;

        let now = self.clock.now();
        let execution = Execution::new(
            batch.id,
            format!("{}/{}", batch.correlation_id, Uuid::new_v4()),
            batch.correlation_id.clone(),
            batch.tenant.clone(),
            batch.user_email.clone(),
            batch.process_name.clone(),
            batch.process_business_id,
            input_files,
            expected_duration_millis,
            timeout_after_millis,
            now,
        );
        self.store.insert(&execution).await?;
        info!(
            execution_id = %execution.id,
            batch_id = %batch.id,
            process = %batch.process_name,
            timeout_after_millis,
            "execution created",
        );
        metrics::counter!("conveyor_executions_created_total").increment(1);
        self.publish(&execution);
        Ok(execution)
    }

    /// Append one step, retrying on version conflicts up to the configured
    /// budget. Appending to a terminal execution returns
    /// [`AppendOutcome::AlreadyTerminal`] without writing anything.
    pub async fn append_step(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        message: &str,
    ) -> Result<AppendOutcome, TrackerError> {
        let attempts = self.max_retries_on_conflict.max(1);
        for attempt in 0..attempts {
            let current = self
                .store
                .get(execution_id)
                .await?
                .ok_or(TrackerError::NotFound(execution_id))?;

            let next = match current.with_step(status, self.clock.now(), message) {
                Ok(next) => next,
                Err(TransitionError::AlreadyTerminal { current }) => {
                    debug!(
                        execution_id = %execution_id,
                        current = current.as_str(),
                        requested = status.as_str(),
                        "append on terminal execution, no-op",
                    );
                    return Ok(AppendOutcome::AlreadyTerminal(current));
                }
                Err(TransitionError::Illegal { from, to }) => {
                    return Err(TrackerError::IllegalTransition { from, to });
                }
            };

            match self.store.compare_and_swap(&next, current.version).await? {
                CasOutcome::Updated => {
                    let mut persisted = next;
                    persisted.version = current.version + 1;
                    debug!(
                        execution_id = %execution_id,
                        status = status.as_str(),
                        version = persisted.version,
                        "step appended",
                    );
                    metrics::counter!("conveyor_steps_appended_total").increment(1);
                    self.publish(&persisted);
                    return Ok(AppendOutcome::Appended(persisted));
                }
                CasOutcome::VersionMismatch => {
                    metrics::counter!("conveyor_append_conflicts_total").increment(1);
                    warn!(
                        execution_id = %execution_id,
                        attempt = attempt + 1,
                        "version conflict, reloading",
                    );
                }
            }
        }
        Err(TrackerError::Conflict {
            id: execution_id,
            attempts,
        })
    }

    pub async fn get(&self, execution_id: Uuid) -> Result<Execution, TrackerError> {
        self.store
            .get(execution_id)
            .await?
            .ok_or(TrackerError::NotFound(execution_id))
    }

    /// Paged monitoring query; never loads the whole table.
    pub async fn find_by_status(
        &self,
        tenant: &str,
        statuses: &[ExecutionStatus],
        page: PageRequest,
    ) -> Result<Page<Execution>, TrackerError> {
        Ok(self.store.find_by_status(tenant, statuses, page).await?)
    }

    /// Timed-out candidates for the sweep: non-terminal and silent for
    /// longer than their budget, measured from the last step.
    pub async fn find_timed_out(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        limit: u64,
    ) -> Result<Vec<Execution>, TrackerError> {
        Ok(self.store.find_timed_out(now, limit).await?)
    }

    fn publish(&self, execution: &Execution) {
        self.notifier.publish(StatusChanged {
            execution_id: execution.id,
            batch_id: execution.batch_id,
            tenant: execution.tenant.clone(),
            status: execution.current_status,
            time: execution.last_updated,
        });
    }
}
