//! Pure domain model: value types and transition rules. No I/O.

pub mod batch;
pub mod execution;
pub mod output_file;
pub mod quota;

pub use batch::{Batch, FileSetStats};
pub use execution::{Execution, ExecutionStatus, Step, TransitionError};
pub use output_file::{Checksum, OutputFile};
pub use quota::ProcessQuota;
