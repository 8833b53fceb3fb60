//! Per-process quota configuration, consumed (not owned) by the enforcer.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_PARALLEL_EXECUTIONS_PER_USER: u32 = 5;
pub const DEFAULT_MAX_BYTES_IN_CACHE: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessQuota {
    /// Ceiling on concurrently active (non-terminal) executions per user.
    pub max_parallel_executions_per_user: u32,
    /// Ceiling on the summed size of not-yet-deleted output files of the
    /// process. Exceeding it never blocks admission; the deletion sweep is
    /// the release valve.
    pub max_bytes_in_cache: u64,
}

impl Default for ProcessQuota {
    fn default() -> Self {
        Self {
            max_parallel_executions_per_user: DEFAULT_MAX_PARALLEL_EXECUTIONS_PER_USER,
            max_bytes_in_cache: DEFAULT_MAX_BYTES_IN_CACHE,
        }
    }
}
