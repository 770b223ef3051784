use std::fmt;

use relay_contract::LifecycleError;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

pub const REASON_LIFECYCLE_TRANSITION: &str = "lifecycle_transition";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
/// Process-wide lifecycle state, in declared order.
pub enum LifecycleState {
    Bootstrapping,
    ConnectingSecurity,
    ConnectingTransport,
    Running,
    Degraded,
    Recovering,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrapping => "bootstrapping",
            Self::ConnectingSecurity => "connecting_security",
            Self::ConnectingTransport => "connecting_transport",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Recovering => "recovering",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        }
    }

    /// Forward moves may skip states. The only backward moves are
    /// `Degraded -> Running` and `Recovering -> ConnectingTransport`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == Self::Terminated {
            return false;
        }
        next > self
            || matches!(
                (self, next),
                (Self::Degraded, Self::Running) | (Self::Recovering, Self::ConnectingTransport)
            )
    }

    /// States in which inbound traffic is dispatched.
    pub fn accepts_traffic(self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }

    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
/// Holds the current state and publishes every change on a watch channel.
pub struct LifecycleTracker {
    state_tx: watch::Sender<LifecycleState>,
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleTracker {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Bootstrapping);
        Self { state_tx }
    }

    pub fn current(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Applies `next`. Returns `Ok(false)` for a self-transition.
    pub fn transition(&self, next: LifecycleState) -> Result<bool, LifecycleError> {
        let current = self.current();
        if current == next {
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            error!(
                from = current.as_str(),
                to = next.as_str(),
                "illegal lifecycle transition refused"
            );
            return Err(LifecycleError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.state_tx.send_replace(next);
        info!(
            reason_code = REASON_LIFECYCLE_TRANSITION,
            from = current.as_str(),
            to = next.as_str(),
            "lifecycle state changed"
        );
        Ok(true)
    }
}
