//! Staged validation pipeline
//!
//! - [`stage`]: stage identifiers, results and the [`StageExecutor`] trait
//! - [`stages`]: the seven executors
//! - [`orchestrator`]: per-candidate stage state machine
//! - [`scheduler`]: bounded worker pool and candidate queue

pub mod orchestrator;
pub mod scheduler;
pub mod stage;
pub mod stages;

pub use orchestrator::{CandidateRecord, Orchestrator, RecordVerdict};
pub use scheduler::{DroppedCandidate, RunOutput, Scheduler};
pub use stage::{
    MetricValue, Metrics, StageContext, StageExecutor, StageId, StageOutput, StageResult, StageStatus,
};
pub use stages::build_stages;
