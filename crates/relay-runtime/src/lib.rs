//! Background scheduling and self-healing for the Relay orchestrator.
//!
//! [`Scheduler`] runs recurring maintenance tasks in isolation from each other.
//! [`AutoHealer`] classifies failures, bounds reconnection attempts, and
//! relieves memory pressure.

pub mod auto_healer;
pub mod panic_scope;
pub mod scheduler;

pub use auto_healer::{
    classify_error, AutoHealer, ErrorDisposition, HealerSnapshot, MemoryOptimizationReport,
    RecordedError, RecoveryAttempt, RecoveryDecision, RecoveryPolicy, Severity,
    RECENT_ERROR_CAPACITY,
};
pub use panic_scope::{contain_panics, contained_panic_scope};
pub use scheduler::{ScheduledTask, Scheduler, SchedulerHandle, TaskStats};
