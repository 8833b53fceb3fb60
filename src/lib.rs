//! Conveyor - tracking for long-running, externally-executed processing
//! jobs: batches, executions with append-only step logs, output files, and
//! the background sweeps that time executions out and reclaim cache space.

pub mod clock;
pub mod config;
pub mod domain;
pub mod events;
pub mod observability;
pub mod outputs;
pub mod quota;
pub mod registry;
pub mod store;
pub mod sweep;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use domain::{
    Batch, Checksum, Execution, ExecutionStatus, FileSetStats, OutputFile, ProcessQuota, Step,
};
pub use events::{StatusChanged, StatusNotifier};
pub use observability::init_tracing;
pub use outputs::{ArtifactError, ArtifactStorage, DeleteError, OutputFileManager};
pub use quota::{QuotaEnforcer, QuotaError};
pub use registry::{BatchRegistry, SubmitError, SubmitReceipt, SubmitRequest};
pub use store::{
    BatchStore, CasOutcome, ExecutionStore, OutputFileStore, Page, PageRequest, StoreError,
    memory::MemoryStore, postgres::PgStore,
};
pub use sweep::{FileDeletionSweep, SweepConfig, SweepHandle, SweepStats, TimeoutDetector};
pub use tracker::{AppendOutcome, ExecutionTracker, TrackerError};
