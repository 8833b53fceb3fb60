//! Quota enforcement: per-user parallelism (hard admission check) and
//! per-process cache bytes (reported, never blocking; the deletion sweep
//! is the release valve).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::domain::ProcessQuota;
use crate::store::{ExecutionStore, OutputFileStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error(
        "parallel execution quota exceeded for {user_email} on process \
         {process_business_id}: {active} active, limit {limit}"
    )]
    Exceeded {
        user_email: String,
        process_business_id: Uuid,
        active: u64,
        limit: u32,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct QuotaEnforcer {
    executions: Box<dyn ExecutionStore>,
    files: Box<dyn OutputFileStore>,
    quotas: Arc<HashMap<Uuid, ProcessQuota>>,
    default_quota: ProcessQuota,
}

impl QuotaEnforcer {
    pub fn new(
        executions: Box<dyn ExecutionStore>,
        files: Box<dyn OutputFileStore>,
        quotas: HashMap<Uuid, ProcessQuota>,
        default_quota: ProcessQuota,
    ) -> Self {
        Self {
            executions,
            files,
            quotas: Arc::new(quotas),
            default_quota,
        }
    }

    pub fn quota_for(&self, process_business_id: Uuid) -> ProcessQuota {
        self.quotas
            .get(&process_business_id)
            .copied()
            .unwrap_or(self.default_quota)
    }

    /// Admission check, run both at batch submission and again at
    /// execution-creation time so back-to-back submissions cannot slip past
    /// the ceiling together.
    pub async fn check_parallel_quota(
        &self,
        user_email: &str,
        process_business_id: Uuid,
    ) -> Result<(), QuotaError> {
        let limit = self.quota_for(process_business_id).max_parallel_executions_per_user;
        let active = self
            .executions
            .count_active(user_email, process_business_id)
            .await?;
        if active >= u64::from(limit) {
            return Err(QuotaError::Exceeded {
                user_email: user_email.to_string(),
                process_business_id,
                active,
                limit,
            });
        }
        debug!(%user_email, %process_business_id, active, limit, "parallel quota ok");
        Ok(())
    }

    /// Summed size of not-deleted output files for the process.
    pub async fn cached_bytes(&self, process_business_id: Uuid) -> Result<u64, QuotaError> {
        Ok(self.files.live_bytes_for_process(process_business_id).await?)
    }

    /// Cache pressure report. Exceeding the limit never blocks admission.
    pub async fn cache_over_quota(&self, process_business_id: Uuid) -> Result<bool, QuotaError> {
        let used = self.cached_bytes(process_business_id).await?;
        Ok(used > self.quota_for(process_business_id).max_bytes_in_cache)
    }
}
