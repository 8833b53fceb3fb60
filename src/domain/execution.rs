//! Execution, its append-only step log, and the status state machine.
//!
//! The step sequence is the source of truth: `current_status` is a
//! denormalized copy of the last step's status, kept in sync by the only
//! mutation path, [`Execution::with_step`]. Step times are non-decreasing
//! in sequence order, and a terminal status is absorbing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status carried by each step of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Registered,
    Running,
    Success,
    Failure,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses admit no outgoing transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failure
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
        )
    }

    /// Statuses counted against the per-user parallelism quota.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether a step with status `next` may follow a step with status `self`.
    ///
    /// Running -> Running is allowed as a progress heartbeat; a terminal
    /// status admits nothing.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Registered, Running) => true,
            (Registered, Failure | TimedOut | Cancelled) => true,
            (Running, Running) => true,
            (Running, Success | Failure | TimedOut | Cancelled) => true,
            _ => false,
        }
    }

    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Registered,
        ExecutionStatus::Running,
        ExecutionStatus::Success,
        ExecutionStatus::Failure,
        ExecutionStatus::TimedOut,
        ExecutionStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Registered => "REGISTERED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failure => "FAILURE",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown execution status: {s}"))
    }
}

/// Immutable record in an execution's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub status: ExecutionStatus,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl Step {
    pub fn new(status: ExecutionStatus, time: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status,
            time,
            message: message.into(),
        }
    }
}

/// Rejected step append, before any write is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The execution already reached a terminal status. Callers treat this
    /// as a benign no-op rather than a failure.
    #[error("execution is terminal in status {current:?}")]
    AlreadyTerminal { current: ExecutionStatus },
    /// The requested status does not follow from the current one.
    #[error("illegal transition {from:?} -> {to:?}")]
    Illegal {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

/// One concrete run of a batch against the workload engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub correlation_id: String,
    pub batch_correlation_id: String,
    pub tenant: String,
    pub user_email: String,
    pub process_name: String,
    pub process_business_id: Uuid,
    /// Input file urls handed to the workload engine.
    pub input_files: Vec<String>,
    pub expected_duration_millis: i64,
    pub timeout_after_millis: i64,
    pub current_status: ExecutionStatus,
    pub steps: Vec<Step>,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Execution {
    /// New execution whose step log is exactly `[REGISTERED @ created]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        batch_id: Uuid,
        correlation_id: String,
        batch_correlation_id: String,
        tenant: String,
        user_email: String,
        process_name: String,
        process_business_id: Uuid,
        input_files: Vec<String>,
        expected_duration_millis: i64,
        timeout_after_millis: i64,
        created: DateTime<Utc>,
    ) -> Self {
        let initial = Step::new(ExecutionStatus::Registered, created, "registered");
        Self {
            id: Uuid::new_v4(),
            batch_id,
            correlation_id,
            batch_correlation_id,
            tenant,
            user_email,
            process_name,
            process_business_id,
            input_files,
            expected_duration_millis,
            timeout_after_millis,
            current_status: ExecutionStatus::Registered,
            steps: vec![initial],
            version: 0,
            created,
            last_updated: created,
        }
    }

    pub fn last_step(&self) -> &Step {
        self.steps.last().expect("execution has at least one step")
    }

    /// Copy of this execution with one more step, validated against the
    /// state machine. Step time is clamped to keep the log non-decreasing.
    /// Does not touch `version`; the store's compare-and-swap owns that.
    pub fn with_step(
        &self,
        status: ExecutionStatus,
        time: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Result<Execution, TransitionError> {
        let current = self.current_status;
        if current.is_terminal() {
            return Err(TransitionError::AlreadyTerminal { current });
        }
        if !current.can_transition_to(status) {
            return Err(TransitionError::Illegal {
                from: current,
                to: status,
            });
        }
        let time = time.max(self.last_step().time);
        let mut next = self.clone();
        next.steps.push(Step::new(status, time, message));
        next.current_status = status;
        next.last_updated = time;
        Ok(next)
    }

    /// Deadline test used by the timeout sweep: non-terminal and no progress
    /// observed for longer than `timeout_after_millis`. The deadline basis
    /// is the time of the last step, not execution creation.
    pub fn timed_out_at(&self, now: DateTime<Utc>) -> bool {
        !self.current_status.is_terminal()
            && now - self.last_updated > Duration::milliseconds(self.timeout_after_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fresh() -> Execution {
        Execution::new(
            Uuid::new_v4(),
            "exec-corr".into(),
            "batch-corr".into(),
            "default".into(),
            "user@example.com".into(),
            "resample".into(),
            Uuid::new_v4(),
            Vec::new(),
            60_000,
            1_000,
            Utc::now(),
        )
    }

    #[test]
    fn new_execution_starts_registered_with_single_step() {
        let exec = fresh();
        assert_eq!(exec.steps.len(), 1);
        assert_eq!(exec.current_status, ExecutionStatus::Registered);
        assert_eq!(exec.version, 0);
        assert_eq!(exec.last_step().time, exec.created);
    }

    #[test]
    fn terminal_statuses_are_absorbing() {
        for terminal in [
            ExecutionStatus::Success,
            ExecutionStatus::Failure,
            ExecutionStatus::TimedOut,
            ExecutionStatus::Cancelled,
        ] {
            for next in [
                ExecutionStatus::Registered,
                ExecutionStatus::Running,
                ExecutionStatus::Success,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn registered_cannot_jump_to_success() {
        let exec = fresh();
        let err = exec
            .with_step(ExecutionStatus::Success, Utc::now(), "done")
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: ExecutionStatus::Registered,
                to: ExecutionStatus::Success,
            }
        );
    }

    #[test]
    fn append_after_terminal_reports_already_terminal() {
        let exec = fresh();
        let exec = exec
            .with_step(ExecutionStatus::Running, Utc::now(), "started")
            .unwrap();
        let exec = exec
            .with_step(ExecutionStatus::Success, Utc::now(), "done")
            .unwrap();
        let err = exec
            .with_step(ExecutionStatus::Running, Utc::now(), "late heartbeat")
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::AlreadyTerminal {
                current: ExecutionStatus::Success,
            }
        );
        assert_eq!(exec.steps.len(), 3);
        assert_eq!(exec.current_status, ExecutionStatus::Success);
    }

    #[test]
    fn running_heartbeats_are_allowed() {
        let exec = fresh();
        let exec = exec
            .with_step(ExecutionStatus::Running, Utc::now(), "started")
            .unwrap();
        let exec = exec
            .with_step(ExecutionStatus::Running, Utc::now(), "50%")
            .unwrap();
        assert_eq!(exec.steps.len(), 3);
        assert_eq!(exec.current_status, ExecutionStatus::Running);
    }

    #[test]
    fn step_time_is_clamped_to_keep_log_monotonic() {
        let exec = fresh();
        let earlier = exec.created - chrono::Duration::seconds(10);
        let exec = exec
            .with_step(ExecutionStatus::Running, earlier, "clock skew")
            .unwrap();
        assert_eq!(exec.last_step().time, exec.created);
    }

    #[test]
    fn timed_out_uses_last_step_time() {
        let mut exec = fresh();
        exec.timeout_after_millis = 1_000;
        let now = exec.last_updated + chrono::Duration::milliseconds(500);
        assert!(!exec.timed_out_at(now));
        let later = exec.last_updated + chrono::Duration::milliseconds(2_000);
        assert!(exec.timed_out_at(later));
    }

    #[test]
    fn terminal_execution_is_never_timed_out() {
        let exec = fresh();
        let exec = exec
            .with_step(ExecutionStatus::Running, Utc::now(), "started")
            .unwrap();
        let exec = exec
            .with_step(ExecutionStatus::Success, Utc::now(), "done")
            .unwrap();
        let far_future = exec.last_updated + chrono::Duration::days(365);
        assert!(!exec.timed_out_at(far_future));
    }

    proptest! {
        /// Whatever (possibly skewed) times a writer supplies, the persisted
        /// step log stays non-decreasing.
        #[test]
        fn step_log_is_monotonic(offsets in proptest::collection::vec(-5_000i64..5_000, 1..20)) {
            let mut exec = fresh();
            for offset in offsets {
                let t = exec.created + chrono::Duration::milliseconds(offset);
                if let Ok(next) = exec.with_step(ExecutionStatus::Running, t, "hb") {
                    exec = next;
                }
            }
            for pair in exec.steps.windows(2) {
                prop_assert!(pair[0].time <= pair[1].time);
            }
        }
    }
}
