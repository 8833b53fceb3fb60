//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `CONVEYOR_DATABASE_URL`: PostgreSQL connection string (required for the pg backend)
//! - `CONVEYOR_TIMEOUT_SCAN_INTERVAL_MS`: Timeout sweep interval (default: 5000)
//! - `CONVEYOR_FILE_SWEEP_INTERVAL_MS`: Deletion sweep interval (default: 60000)
//! - `CONVEYOR_SWEEP_PAGE_SIZE`: Max items per sweep page (default: 100)
//! - `CONVEYOR_MAX_RETRIES_ON_CONFLICT`: Optimistic retry budget (default: 3)
//! - `CONVEYOR_MAX_PARALLEL_EXECUTIONS_PER_USER`: Default parallelism quota (default: 5)
//! - `CONVEYOR_MAX_BYTES_IN_CACHE`: Default per-process cache quota (default: 10 GiB)
//! - `CONVEYOR_TENANTS`: Comma-separated tenants for the deletion sweep (default: empty)

use std::{
    env,
    sync::{OnceLock, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};

use crate::domain::ProcessQuota;
use crate::domain::quota::{DEFAULT_MAX_BYTES_IN_CACHE, DEFAULT_MAX_PARALLEL_EXECUTIONS_PER_USER};
use crate::sweep::SweepConfig;

/// Global configuration cache
static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: Option<String>,

    /// Timeout sweep interval (milliseconds)
    pub timeout_scan_interval_ms: u64,

    /// Deletion sweep interval (milliseconds)
    pub file_sweep_interval_ms: u64,

    /// Maximum items per sweep page
    pub sweep_page_size: u64,

    /// Bounded retry budget for optimistic version conflicts
    pub max_retries_on_conflict: u32,

    /// Default per-user parallelism quota
    pub max_parallel_executions_per_user: u32,

    /// Default per-process cache quota in bytes
    pub max_bytes_in_cache: u64,

    /// Tenants covered by the deletion sweep
    pub tenants: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("CONVEYOR_DATABASE_URL").ok();

        let timeout_scan_interval_ms = env::var("CONVEYOR_TIMEOUT_SCAN_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let file_sweep_interval_ms = env::var("CONVEYOR_FILE_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60_000);

        let sweep_page_size = env::var("CONVEYOR_SWEEP_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let max_retries_on_conflict = env::var("CONVEYOR_MAX_RETRIES_ON_CONFLICT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let max_parallel_executions_per_user = env::var("CONVEYOR_MAX_PARALLEL_EXECUTIONS_PER_USER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_PARALLEL_EXECUTIONS_PER_USER);

        let max_bytes_in_cache = env::var("CONVEYOR_MAX_BYTES_IN_CACHE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_BYTES_IN_CACHE);

        let tenants = env::var("CONVEYOR_TENANTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url,
            timeout_scan_interval_ms,
            file_sweep_interval_ms,
            sweep_page_size,
            max_retries_on_conflict,
            max_parallel_executions_per_user,
            max_bytes_in_cache,
            tenants,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("CONVEYOR_DATABASE_URL environment variable is required")
    }

    /// Sweep settings for the timeout detector.
    pub fn timeout_sweep(&self) -> SweepConfig {
        SweepConfig {
            scan_interval: Duration::from_millis(self.timeout_scan_interval_ms),
            page_size: self.sweep_page_size,
            tenants: self.tenants.clone(),
        }
    }

    /// Sweep settings for the file deletion sweep.
    pub fn file_sweep(&self) -> SweepConfig {
        SweepConfig {
            scan_interval: Duration::from_millis(self.file_sweep_interval_ms),
            page_size: self.sweep_page_size,
            tenants: self.tenants.clone(),
        }
    }

    /// Quota handed to the enforcer for processes with no explicit override.
    pub fn default_quota(&self) -> ProcessQuota {
        ProcessQuota {
            max_parallel_executions_per_user: self.max_parallel_executions_per_user,
            max_bytes_in_cache: self.max_bytes_in_cache,
        }
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            database_url: None,
            timeout_scan_interval_ms: 50,
            file_sweep_interval_ms: 50,
            sweep_page_size: 10,
            max_retries_on_conflict: 3,
            max_parallel_executions_per_user: DEFAULT_MAX_PARALLEL_EXECUTIONS_PER_USER,
            max_bytes_in_cache: DEFAULT_MAX_BYTES_IN_CACHE,
            tenants: vec!["default".to_string()],
        }
    }
}

/// Get the global configuration, loading from environment if not yet
/// initialized. Returns a clone of the cached value.
///
/// # Panics
///
/// Panics if configuration loading fails.
pub fn get_config() -> Config {
    CONFIG
        .get_or_init(|| {
            let config = Config::from_env().expect("failed to load configuration from environment");
            RwLock::new(config)
        })
        .read()
        .expect("config lock poisoned")
        .clone()
}

/// Like `get_config()` but returns a Result instead of panicking.
pub fn try_get_config() -> Result<Config> {
    match CONFIG.get() {
        Some(lock) => Ok(lock.read().expect("config lock poisoned").clone()),
        None => {
            let config = Config::from_env()?;
            let lock = CONFIG.get_or_init(|| RwLock::new(config.clone()));
            Ok(lock.read().expect("config lock poisoned").clone())
        }
    }
}
