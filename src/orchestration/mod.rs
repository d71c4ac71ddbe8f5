//! Orchestration layer.
//!
//! Worker matching and pooling, the executor seam, output verification,
//! remediation policy, prompt building, the outbound event bus and the
//! scheduler that ties them together.

pub mod events;
pub mod executor;
pub mod matcher;
pub mod pool;
pub mod prompt;
pub mod remediation;
pub mod scheduler;
pub mod verifier;

pub use events::{EngineEvent, EventBus, EventPublisher, EventSink, MemorySink, TracingSink};
pub use executor::{
    CommandExecutor, ExecutionOutcome, ExecutionRequest, TaskExecutor, TimeoutPolicy,
};
pub use matcher::{
    Assignment, CapabilityMatcher, ExperienceTier, MatchBreakdown, SkillCapability, TaskPattern,
    WorkerProfile,
};
pub use pool::WorkerPool;
pub use remediation::{RemediationAction, RemediationPlan, RemediationPolicy, RetryBackoff, Severity};
pub use scheduler::{PauseMode, RunReport, Scheduler, SchedulerControl};
pub use verifier::{OutputVerifier, QualityReport, QualityVerifier};
