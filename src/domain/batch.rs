//! Batch: one user submission describing a job, immutable after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-dataset file statistics captured at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSetStats {
    pub dataset: String,
    pub file_count: u64,
    pub total_bytes: u64,
}

/// A user submission describing one job (process + parameters). May yield
/// multiple executions over time; everything but the `persisted` flag is
/// immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    /// Caller-supplied idempotency token.
    pub correlation_id: String,
    pub process_business_id: Uuid,
    pub process_name: String,
    pub tenant: String,
    pub user_email: String,
    pub user_role: String,
    pub parameters: Value,
    pub file_set_stats: Vec<FileSetStats>,
    pub persisted: bool,
    pub created: DateTime<Utc>,
}

impl Batch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: String,
        process_business_id: Uuid,
        process_name: String,
        tenant: String,
        user_email: String,
        user_role: String,
        parameters: Value,
        file_set_stats: Vec<FileSetStats>,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            process_business_id,
            process_name,
            tenant,
            user_email,
            user_role,
            parameters,
            file_set_stats,
            persisted: false,
            created,
        }
    }

    pub fn persisted(mut self) -> Self {
        self.persisted = true;
        self
    }
}
