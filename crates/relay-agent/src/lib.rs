//! Lifecycle orchestration for the Relay bot.
//!
//! [`LifecycleController`] brings collaborators up in a fixed order, serves
//! transport traffic through the risk gate, hands transport failures to the
//! auto-healer, and tears everything down again with an exit code.

pub mod control;
pub mod controller;
pub mod dispatch;
pub mod lifecycle_state;
pub mod maintenance_tasks;

pub use control::{control_channel, ControlReceiver, ControlSender, ControlSignal, FaultReporter};
pub use controller::{
    goodbye_text, startup_notification_text, Collaborators, LifecycleController, ShutdownKind,
};
pub use dispatch::{
    parse_command, DispatchJob, DispatchOutcome, DispatchRecord, DispatchSettings,
    MessageDispatcher, ParsedCommand, TransportSlot,
};
pub use lifecycle_state::{LifecycleState, LifecycleTracker};
pub use maintenance_tasks::{HealthMonitor, HealthSnapshot, HEALTH_SNAPSHOT_FILE};
