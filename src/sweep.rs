//! Periodic sweeps: timeout detection and output file deletion.
//!
//! Both sweeps share the same shape: a spawned task with a watch-channel
//! shutdown handle, ticking on a fixed interval, doing bounded-page work
//! per cycle. Every item is processed independently: one failure is
//! logged and counted, never aborting the rest of the page. The cycle
//! bodies (`run_once`) are public so tests can drive them with a manual
//! clock instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::domain::ExecutionStatus;
use crate::outputs::OutputFileManager;
use crate::store::PageRequest;
use crate::tracker::ExecutionTracker;

pub const TIMEOUT_STEP_MESSAGE: &str = "deadline exceeded";

#[derive(Clone, Debug)]
pub struct SweepConfig {
    pub scan_interval: Duration,
    pub page_size: u64,
    /// Tenants covered by the deletion sweep.
    pub tenants: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5),
            page_size: 100,
            tenants: Vec::new(),
        }
    }
}

/// Counters for one sweep cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: u64,
    pub acted: u64,
    pub skipped: u64,
    pub failures: u64,
}

/// Shutdown handle for a spawned sweep task.
pub struct SweepHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweepHandle {
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        self.handle
            .await
            .map_err(|err| anyhow!("sweep task panicked: {err}"))
    }
}

/// Finds executions past their deadline and terminates them.
#[derive(Clone)]
pub struct TimeoutDetector {
    tracker: ExecutionTracker,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
}

impl TimeoutDetector {
    pub fn new(tracker: ExecutionTracker, clock: Arc<dyn Clock>, config: SweepConfig) -> Self {
        Self {
            tracker,
            clock,
            config,
        }
    }

    pub fn start(self) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(
                scan_interval_ms = self.config.scan_interval.as_millis(),
                page_size = self.config.page_size,
                "starting timeout detector",
            );
            let mut ticker = interval(self.config.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = self.clock.now();
                        match self.run_once(now).await {
                            Ok(stats) if stats.acted > 0 => {
                                info!(timed_out = stats.acted, "timeout sweep cycle done");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                metrics::counter!("conveyor_sweep_errors_total").increment(1);
                                error!(?err, "timeout sweep cycle failed");
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() && *shutdown_rx.borrow() {
                            info!("timeout detector shutting down");
                            break;
                        }
                    }
                }
            }
        });
        SweepHandle {
            shutdown_tx,
            handle,
        }
    }

    /// One sweep cycle. A candidate that turned terminal between the query
    /// and the append is counted as skipped, not failed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        loop {
            let candidates = self.tracker.find_timed_out(now, self.config.page_size).await?;
            if candidates.is_empty() {
                break;
            }
            let page_len = candidates.len() as u64;
            let mut acted_this_page = 0u64;
            for execution in candidates {
                stats.examined += 1;
                match self
                    .tracker
                    .append_step(execution.id, ExecutionStatus::TimedOut, TIMEOUT_STEP_MESSAGE)
                    .await
                {
                    Ok(crate::tracker::AppendOutcome::Appended(_)) => {
                        stats.acted += 1;
                        acted_this_page += 1;
                        metrics::counter!("conveyor_executions_timed_out_total").increment(1);
                        warn!(
                            execution_id = %execution.id,
                            timeout_after_millis = execution.timeout_after_millis,
                            "execution timed out",
                        );
                    }
                    Ok(crate::tracker::AppendOutcome::AlreadyTerminal(status)) => {
                        stats.skipped += 1;
                        debug!(
                            execution_id = %execution.id,
                            status = status.as_str(),
                            "candidate finished before timeout append",
                        );
                    }
                    Err(err) => {
                        stats.failures += 1;
                        metrics::counter!("conveyor_sweep_errors_total").increment(1);
                        warn!(execution_id = %execution.id, ?err, "failed to time out execution");
                    }
                }
            }
            // Anything still matching after a cycle with no progress is
            // failing persistently; leave it for the next cycle.
            if page_len < self.config.page_size || acted_this_page == 0 {
                break;
            }
        }
        Ok(stats)
    }
}

/// Deletes downloaded-but-not-deleted output files, tenant by tenant.
#[derive(Clone)]
pub struct FileDeletionSweep {
    manager: OutputFileManager,
    config: SweepConfig,
}

impl FileDeletionSweep {
    pub fn new(manager: OutputFileManager, config: SweepConfig) -> Self {
        Self { manager, config }
    }

    pub fn start(self) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(
                scan_interval_ms = self.config.scan_interval.as_millis(),
                page_size = self.config.page_size,
                tenants = ?self.config.tenants,
                "starting file deletion sweep",
            );
            let mut ticker = interval(self.config.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for tenant in &self.config.tenants {
                            match self.run_once(tenant).await {
                                Ok(stats) if stats.acted > 0 => {
                                    info!(%tenant, deleted = stats.acted, "deletion sweep cycle done");
                                }
                                Ok(_) => {}
                                Err(err) => {
                                    metrics::counter!("conveyor_sweep_errors_total").increment(1);
                                    error!(%tenant, ?err, "deletion sweep cycle failed");
                                }
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() && *shutdown_rx.borrow() {
                            info!("file deletion sweep shutting down");
                            break;
                        }
                    }
                }
            }
        });
        SweepHandle {
            shutdown_tx,
            handle,
        }
    }

    /// One cycle for one tenant. Always asks for page zero: successful
    /// deletions shrink the selection, and anything still selected after a
    /// failure is retried next cycle.
    pub async fn run_once(&self, tenant: &str) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        loop {
            let page = self
                .manager
                .find_downloaded_not_deleted(tenant, PageRequest::of(0, self.config.page_size))
                .await?;
            if page.items.is_empty() {
                break;
            }
            let mut deleted_this_page = 0u64;
            for file in page.items {
                stats.examined += 1;
                match self.manager.delete_file(file.id).await {
                    Ok(()) => {
                        stats.acted += 1;
                        deleted_this_page += 1;
                    }
                    Err(err) => {
                        stats.failures += 1;
                        metrics::counter!("conveyor_sweep_errors_total").increment(1);
                        warn!(file_id = %file.id, ?err, "failed to delete output file");
                    }
                }
            }
            // Nothing deleted means everything left is failing; stop and
            // let the next cycle retry.
            if deleted_this_page == 0 {
                break;
            }
        }
        Ok(stats)
    }
}
