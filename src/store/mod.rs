//! Store interfaces for batches, executions, and output files.
//!
//! Any backend satisfying these contracts is acceptable; the crate ships an
//! in-memory backend for tests and a PostgreSQL backend. The only write path
//! for an existing execution is [`ExecutionStore::compare_and_swap`], keyed
//! on the execution's version: cross-writer coordination is optimistic, with
//! no execution-level mutex anywhere.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Batch, Execution, ExecutionStatus, OutputFile};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error("not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a conditional write keyed on the expected version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The row matched the expected version and now carries `expected + 1`.
    Updated,
    /// Another writer got there first; reload and re-decide.
    VersionMismatch,
}

/// Bounded page selector. `page` is zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u64,
    pub size: u64,
}

impl PageRequest {
    pub fn of(page: u64, size: u64) -> Self {
        Self { page, size }
    }

    pub fn offset(&self) -> u64 {
        self.page * self.size
    }
}

/// One bounded page of results plus the total match count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u64,
    pub total: u64,
}

pub trait BatchStore: Send + Sync {
    fn clone_box(&self) -> Box<dyn BatchStore>;

    fn insert<'a>(&'a self, batch: &'a Batch) -> BoxFuture<'a, StoreResult<()>>;

    fn get(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Batch>>>;
}

impl Clone for Box<dyn BatchStore> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

pub trait ExecutionStore: Send + Sync {
    fn clone_box(&self) -> Box<dyn ExecutionStore>;

    fn insert<'a>(&'a self, execution: &'a Execution) -> BoxFuture<'a, StoreResult<()>>;

    fn get(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Execution>>>;

    /// Persist `updated` only if the stored version still equals
    /// `expected_version`; on success the stored version is
    /// `expected_version + 1`. The `version` field of `updated` is ignored.
    fn compare_and_swap<'a>(
        &'a self,
        updated: &'a Execution,
        expected_version: u64,
    ) -> BoxFuture<'a, StoreResult<CasOutcome>>;

    /// Bounded page of a tenant's executions whose current status is one of
    /// `statuses`, ordered by creation time.
    fn find_by_status<'a>(
        &'a self,
        tenant: &'a str,
        statuses: &'a [ExecutionStatus],
        page: PageRequest,
    ) -> BoxFuture<'a, StoreResult<Page<Execution>>>;

    /// Executions whose current status is non-terminal and whose last step
    /// is older than their timeout budget, bounded by `limit`.
    fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> BoxFuture<'_, StoreResult<Vec<Execution>>>;

    /// Number of non-terminal executions for `(user, process)`.
    fn count_active<'a>(
        &'a self,
        user_email: &'a str,
        process_business_id: Uuid,
    ) -> BoxFuture<'a, StoreResult<u64>>;
}

impl Clone for Box<dyn ExecutionStore> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

pub trait OutputFileStore: Send + Sync {
    fn clone_box(&self) -> Box<dyn OutputFileStore>;

    fn insert<'a>(&'a self, file: &'a OutputFile) -> BoxFuture<'a, StoreResult<()>>;

    fn get(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<OutputFile>>>;

    /// Idempotent.
    fn set_downloaded(&self, id: Uuid) -> BoxFuture<'_, StoreResult<()>>;

    /// Idempotent; only ever called after the physical artifact is gone.
    fn set_deleted(&self, id: Uuid) -> BoxFuture<'_, StoreResult<()>>;

    /// Selection predicate of the deletion sweep: downloaded and not yet
    /// deleted, for one tenant, ordered by creation time.
    fn find_downloaded_not_deleted<'a>(
        &'a self,
        tenant: &'a str,
        page: PageRequest,
    ) -> BoxFuture<'a, StoreResult<Page<OutputFile>>>;

    fn find_by_exec_id(&self, exec_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<OutputFile>>>;

    /// Sum of `size_bytes` over not-deleted files belonging to executions of
    /// the given process.
    fn live_bytes_for_process(&self, process_business_id: Uuid)
    -> BoxFuture<'_, StoreResult<u64>>;
}

impl Clone for Box<dyn OutputFileStore> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
