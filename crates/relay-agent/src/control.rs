use tokio::sync::mpsc;
use tracing::error;

pub const CONTROL_QUEUE_CAPACITY: usize = 64;
pub const REASON_MEMORY_PRESSURE: &str = "memory_pressure";
pub const REASON_UNHANDLED_FAULT: &str = "unhandled_fault";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Requests sent to the controller by background tasks and fault hooks.
/// Only the controller acts on them.
pub enum ControlSignal {
    Degraded { reason_code: String },
    Healthy,
    Fault { detail: String },
}

pub type ControlSender = mpsc::Sender<ControlSignal>;
pub type ControlReceiver = mpsc::Receiver<ControlSignal>;

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    mpsc::channel(CONTROL_QUEUE_CAPACITY)
}

#[derive(Debug, Clone)]
/// Routes uncaught faults (panics, fatal background errors) to emergency shutdown.
pub struct FaultReporter {
    control: ControlSender,
}

impl FaultReporter {
    pub fn new(control: ControlSender) -> Self {
        Self { control }
    }

    /// Never blocks; safe to call from a panic hook.
    pub fn report(&self, detail: impl Into<String>) -> bool {
        let detail = detail.into();
        error!(reason_code = REASON_UNHANDLED_FAULT, detail = %detail, "fault reported");
        self.control
            .try_send(ControlSignal::Fault { detail })
            .is_ok()
    }
}
