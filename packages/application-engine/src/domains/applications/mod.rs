pub mod models;
pub mod service;
pub mod state_machine;
pub mod worker;

pub use models::*;
pub use service::{ApplicationService, ApplyQueue, ApplyQueueReceiver};
pub use state_machine::{can_delete, can_transition, decide_apply, ApplyDecision};
pub use worker::{ApplyWorker, ApplyWorkerConfig, RecoveryReport};
