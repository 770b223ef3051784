use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use relay_contract::{LifecycleError, StorageOperation, TransportError};
use relay_session::SessionStore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

pub const RECENT_ERROR_CAPACITY: usize = 32;
const RECENT_ERRORS_KEPT_AFTER_OPTIMIZE: usize = 8;
const MAX_BACKOFF_EXPONENT: u32 = 10;

pub const REASON_RECOVERY_SCHEDULED: &str = "recovery_scheduled";
pub const REASON_RECOVERY_EXHAUSTED: &str = "recovery_exhausted";
pub const REASON_RECOVERY_SUCCEEDED: &str = "recovery_succeeded";
pub const REASON_MEMORY_OPTIMIZED: &str = "memory_optimized";

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `Severity` values.
pub enum Severity {
    /// Process cannot continue.
    Fatal,
    /// Routed to a recovery attempt.
    Recoverable,
    /// Logged; at most degrades the running state.
    Transient,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Recoverable => "recoverable",
            Self::Transient => "transient",
        }
    }
}

pub fn classify_error(error: &LifecycleError) -> Severity {
    match error {
        LifecycleError::Configuration(_)
        | LifecycleError::SecurityInit(_)
        | LifecycleError::SecurityCheck(_)
        | LifecycleError::InvalidTransition { .. }
        | LifecycleError::RecoveryExhausted { .. }
        | LifecycleError::Fault(_) => Severity::Fatal,
        LifecycleError::Transport(TransportError::Disconnected { .. })
        | LifecycleError::Transport(TransportError::Initialization(_)) => Severity::Recoverable,
        LifecycleError::Storage(storage) if storage.operation == StorageOperation::Connect => {
            Severity::Recoverable
        }
        LifecycleError::Transport(TransportError::Fault(_))
        | LifecycleError::Storage(_)
        | LifecycleError::Send(_)
        | LifecycleError::Plugin(_)
        | LifecycleError::Command(_)
        | LifecycleError::Collaborator(_) => Severity::Transient,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Bounded exponential backoff for reconnection.
pub struct RecoveryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(60_000),
            jitter: Duration::ZERO,
        }
    }
}

impl RecoveryPolicy {
    /// `min(base * 2^(attempt-1), cap)` plus a jitter derived from `seed` and
    /// `attempt`, so the same inputs always give the same delay.
    pub fn delay_for_attempt(&self, attempt: usize, seed: &str) -> Duration {
        let base_ms = duration_ms(self.base_delay);
        let cap_ms = duration_ms(self.max_delay);
        let exponent = (attempt.saturating_sub(1) as u32).min(MAX_BACKOFF_EXPONENT);
        let backoff_ms = base_ms.saturating_mul(1_u64 << exponent).min(cap_ms);
        let jitter_ms = deterministic_jitter_ms(duration_ms(self.jitter), attempt, seed);
        Duration::from_millis(backoff_ms.saturating_add(jitter_ms))
    }
}

fn deterministic_jitter_ms(max_jitter_ms: u64, attempt: usize, seed: &str) -> u64 {
    if max_jitter_ms == 0 {
        return 0;
    }
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update((attempt as u64).to_le_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix) % max_jitter_ms.saturating_add(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// In-flight recovery. Exists only while the controller is recovering.
pub struct RecoveryAttempt {
    pub trigger: LifecycleError,
    pub attempts: usize,
    pub started_unix_ms: u64,
    pub backoff_deadline_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `RecoveryDecision` values.
pub enum RecoveryDecision {
    Retry { attempt: usize, delay: Duration },
    Exhausted { attempts: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What the controller should do about a reported error.
pub enum ErrorDisposition {
    Shutdown,
    Recover(RecoveryDecision),
    Degrade,
    Logged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Public struct `RecordedError` used across Relay components.
pub struct RecordedError {
    pub reason_code: String,
    pub message: String,
    pub severity: Severity,
    pub recorded_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Outcome of [`AutoHealer::optimize_memory`].
pub struct MemoryOptimizationReport {
    pub expired_cooldowns: usize,
    pub sessions_retained: usize,
    pub errors_trimmed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Public struct `HealerSnapshot` used across Relay components.
pub struct HealerSnapshot {
    pub recovering: bool,
    pub current_attempts: usize,
    pub exhausted: bool,
    pub recoveries_succeeded: u64,
    pub errors_recorded: u64,
    pub memory_optimizations: u64,
    pub recent_errors: Vec<RecordedError>,
}

#[derive(Debug, Default)]
struct HealerState {
    current: Option<RecoveryAttempt>,
    exhausted: bool,
    recoveries_succeeded: u64,
    errors_recorded: u64,
    memory_optimizations: u64,
    recent_errors: VecDeque<RecordedError>,
}

#[derive(Debug)]
/// Classifies errors, tracks recovery attempts, and mitigates memory pressure.
pub struct AutoHealer {
    policy: RecoveryPolicy,
    state: Mutex<HealerState>,
}

impl AutoHealer {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(HealerState::default()),
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    fn state(&self) -> MutexGuard<'_, HealerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(state: &mut HealerState, error: &LifecycleError, severity: Severity, now_unix_ms: u64) {
        state.errors_recorded = state.errors_recorded.saturating_add(1);
        if state.recent_errors.len() >= RECENT_ERROR_CAPACITY {
            state.recent_errors.pop_front();
        }
        state.recent_errors.push_back(RecordedError {
            reason_code: error.reason_code().to_string(),
            message: error.to_string(),
            severity,
            recorded_unix_ms: now_unix_ms,
        });
    }

    /// Records `error` and decides by severity what the controller does next.
    pub fn handle_error(&self, error: &LifecycleError, now_unix_ms: u64) -> ErrorDisposition {
        let severity = classify_error(error);
        match severity {
            Severity::Fatal => {
                Self::record(&mut self.state(), error, severity, now_unix_ms);
                error!(
                    reason_code = error.reason_code(),
                    severity = severity.as_str(),
                    error = %error,
                    "fatal error reported"
                );
                ErrorDisposition::Shutdown
            }
            Severity::Recoverable => {
                ErrorDisposition::Recover(self.attempt_recovery(error, now_unix_ms))
            }
            Severity::Transient => {
                Self::record(&mut self.state(), error, severity, now_unix_ms);
                warn!(
                    reason_code = error.reason_code(),
                    severity = severity.as_str(),
                    error = %error,
                    "transient error reported"
                );
                if matches!(error, LifecycleError::Transport(TransportError::Fault(_))) {
                    ErrorDisposition::Degrade
                } else {
                    ErrorDisposition::Logged
                }
            }
        }
    }

    /// Counts one more recovery attempt for `error`. Once the maximum is
    /// exceeded every later call reports exhaustion.
    pub fn attempt_recovery(&self, error: &LifecycleError, now_unix_ms: u64) -> RecoveryDecision {
        let mut state = self.state();
        Self::record(&mut state, error, classify_error(error), now_unix_ms);
        if state.exhausted {
            return RecoveryDecision::Exhausted {
                attempts: self.policy.max_attempts,
            };
        }
        let attempt = state
            .current
            .as_ref()
            .map(|current| current.attempts)
            .unwrap_or(0)
            .saturating_add(1);
        if attempt > self.policy.max_attempts {
            state.exhausted = true;
            state.current = None;
            error!(
                reason_code = REASON_RECOVERY_EXHAUSTED,
                attempts = self.policy.max_attempts,
                trigger = error.reason_code(),
                "recovery attempts exhausted"
            );
            return RecoveryDecision::Exhausted {
                attempts: self.policy.max_attempts,
            };
        }
        let delay = self.policy.delay_for_attempt(attempt, error.reason_code());
        let started_unix_ms = state
            .current
            .as_ref()
            .map(|current| current.started_unix_ms)
            .unwrap_or(now_unix_ms);
        state.current = Some(RecoveryAttempt {
            trigger: error.clone(),
            attempts: attempt,
            started_unix_ms,
            backoff_deadline_unix_ms: now_unix_ms.saturating_add(duration_ms(delay)),
        });
        warn!(
            reason_code = REASON_RECOVERY_SCHEDULED,
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = duration_ms(delay),
            trigger = error.reason_code(),
            "recovery attempt scheduled"
        );
        RecoveryDecision::Retry { attempt, delay }
    }

    /// Discards the in-flight attempt after a successful reconnection.
    pub fn record_success(&self) {
        let mut state = self.state();
        if let Some(attempt) = state.current.take() {
            state.recoveries_succeeded = state.recoveries_succeeded.saturating_add(1);
            info!(
                reason_code = REASON_RECOVERY_SUCCEEDED,
                attempts = attempt.attempts,
                trigger = attempt.trigger.reason_code(),
                "recovery succeeded"
            );
        }
    }

    pub fn current_attempt(&self) -> Option<RecoveryAttempt> {
        self.state().current.clone()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state().exhausted
    }

    pub fn recent_errors(&self) -> Vec<RecordedError> {
        self.state().recent_errors.iter().cloned().collect()
    }

    /// Best-effort relief under memory pressure. Never fails.
    pub fn optimize_memory(
        &self,
        sessions: &SessionStore,
        cooldown_window: Duration,
        now_unix_ms: u64,
    ) -> MemoryOptimizationReport {
        let compaction = sessions.compact(cooldown_window, now_unix_ms);
        let mut state = self.state();
        let errors_trimmed = state
            .recent_errors
            .len()
            .saturating_sub(RECENT_ERRORS_KEPT_AFTER_OPTIMIZE);
        state.recent_errors.drain(..errors_trimmed);
        state.recent_errors.shrink_to_fit();
        state.memory_optimizations = state.memory_optimizations.saturating_add(1);
        let report = MemoryOptimizationReport {
            expired_cooldowns: compaction.expired_cooldowns,
            sessions_retained: compaction.sessions_retained,
            errors_trimmed,
        };
        debug!(
            reason_code = REASON_MEMORY_OPTIMIZED,
            expired_cooldowns = report.expired_cooldowns,
            sessions_retained = report.sessions_retained,
            errors_trimmed = report.errors_trimmed,
            "memory optimization completed"
        );
        report
    }

    pub fn snapshot(&self) -> HealerSnapshot {
        let state = self.state();
        HealerSnapshot {
            recovering: state.current.is_some(),
            current_attempts: state
                .current
                .as_ref()
                .map(|current| current.attempts)
                .unwrap_or(0),
            exhausted: state.exhausted,
            recoveries_succeeded: state.recoveries_succeeded,
            errors_recorded: state.errors_recorded,
            memory_optimizations: state.memory_optimizations,
            recent_errors: state.recent_errors.iter().cloned().collect(),
        }
    }
}
