pub mod pipeline;
pub mod pool;
pub mod session;
pub mod steps;

pub use pipeline::{SubmissionFailure, SubmissionPipeline, SubmissionRequest, SubmissionResult};
pub use pool::{AcquireError, PoolStatus, SessionLease, SessionPool};
pub use session::{AutomationSession, DiagnosticSnapshot, FormField, SessionFactory, StepAction};
pub use steps::{default_steps, RetryPolicy, Step, StepKind};
