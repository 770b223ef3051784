//! Admission control for inbound messages and commands.
//!
//! Messages are scored by content heuristics and dropped at or above the
//! configured maximum. Commands are classified by a static table, refused above
//! the maximum, then checked against the per-identity cooldown window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_contract::InboundMessage;
use relay_session::SessionStore;
use tracing::{debug, warn};

pub mod command_risk;
pub mod command_stats;
pub mod message_risk;

pub use command_risk::{
    risk_label, CommandRiskTable, RiskAssessment, DEFAULT_COMMAND_RISK_LEVEL,
    REASON_BLOCKED_IDENTITY, REASON_UNCLASSIFIED_COMMAND,
};
pub use command_stats::{CommandCounters, CommandStatistics};
pub use message_risk::{
    assess_message_risk, message_signals, MessageRiskPolicy, MessageSignals, MAX_RISK_LEVEL,
    MIN_RISK_LEVEL,
};

pub const REASON_MESSAGE_ADMITTED: &str = "message_admitted";
pub const REASON_MESSAGE_DROPPED_RISK: &str = "message_dropped_risk";
pub const REASON_COMMAND_ALLOWED: &str = "command_allowed";
pub const REASON_COMMAND_RISK_BLOCKED: &str = "command_risk_blocked";
pub const REASON_COMMAND_COOLDOWN_BLOCKED: &str = "command_cooldown_blocked";

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Thresholds and tables the gate evaluates against.
pub struct RiskGateConfig {
    pub max_risk_level: u8,
    pub cooldown: Duration,
    pub message_policy: MessageRiskPolicy,
    pub command_table: CommandRiskTable,
}

impl Default for RiskGateConfig {
    fn default() -> Self {
        Self {
            max_risk_level: 3,
            cooldown: Duration::from_millis(2_000),
            message_policy: MessageRiskPolicy {
                block_links: true,
                block_spam: true,
                ..MessageRiskPolicy::default()
            },
            command_table: CommandRiskTable::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `MessageAdmission` values.
pub enum MessageAdmission {
    Admit { risk_level: u8 },
    Drop { risk_level: u8, reason_code: String },
}

impl MessageAdmission {
    pub fn reason_code(&self) -> &str {
        match self {
            Self::Admit { .. } => REASON_MESSAGE_ADMITTED,
            Self::Drop { reason_code, .. } => reason_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `CommandAdmission` values.
pub enum CommandAdmission {
    Allow {
        assessment: RiskAssessment,
    },
    RiskBlocked {
        assessment: RiskAssessment,
    },
    CooldownBlocked {
        assessment: RiskAssessment,
        retry_after_ms: u64,
    },
}

impl CommandAdmission {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Allow { .. } => REASON_COMMAND_ALLOWED,
            Self::RiskBlocked { .. } => REASON_COMMAND_RISK_BLOCKED,
            Self::CooldownBlocked { .. } => REASON_COMMAND_COOLDOWN_BLOCKED,
        }
    }

    pub fn assessment(&self) -> &RiskAssessment {
        match self {
            Self::Allow { assessment }
            | Self::RiskBlocked { assessment }
            | Self::CooldownBlocked { assessment, .. } => assessment,
        }
    }
}

#[derive(Debug)]
/// Risk gate bound to the shared session store.
pub struct RiskGate {
    config: RiskGateConfig,
    sessions: Arc<SessionStore>,
    statistics: CommandStatistics,
    dropped_messages: AtomicU64,
}

impl RiskGate {
    pub fn new(config: RiskGateConfig, sessions: Arc<SessionStore>) -> Self {
        Self {
            config,
            sessions,
            statistics: CommandStatistics::new(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RiskGateConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn statistics(&self) -> &CommandStatistics {
        &self.statistics
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn assess_message_risk(&self, message: &InboundMessage) -> u8 {
        assess_message_risk(&self.config.message_policy, message)
    }

    /// Drops messages scored at or above the maximum. Drops are counted and
    /// logged, never answered.
    pub fn admit_message(&self, message: &InboundMessage) -> MessageAdmission {
        let risk_level = self.assess_message_risk(message);
        if risk_level >= self.config.max_risk_level {
            return self.drop_inbound(&message.from, &message.id, risk_level);
        }
        MessageAdmission::Admit { risk_level }
    }

    /// Admission for payloads without text to score, such as voice notes. Only
    /// the sender is judged: blocked identities are dropped at the maximum level.
    pub fn admit_sender(&self, identity: &str, message_id: &str) -> MessageAdmission {
        if self.config.message_policy.is_blocked_identity(identity) {
            return self.drop_inbound(identity, message_id, MAX_RISK_LEVEL);
        }
        MessageAdmission::Admit {
            risk_level: MIN_RISK_LEVEL,
        }
    }

    fn drop_inbound(&self, identity: &str, message_id: &str, risk_level: u8) -> MessageAdmission {
        let dropped = self
            .dropped_messages
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        warn!(
            reason_code = REASON_MESSAGE_DROPPED_RISK,
            identity,
            message_id,
            risk_level,
            max_risk_level = self.config.max_risk_level,
            dropped_total = dropped,
            "high risk message dropped"
        );
        MessageAdmission::Drop {
            risk_level,
            reason_code: REASON_MESSAGE_DROPPED_RISK.to_string(),
        }
    }

    pub fn assess_command_risk(&self, command: &str, identity: &str) -> RiskAssessment {
        let blocked = self.config.message_policy.is_blocked_identity(identity);
        self.config.command_table.assess(command, blocked)
    }

    /// True while `now - last_invocation < cooldown`. Elapsed time equal to the
    /// window is no longer on cooldown.
    pub fn is_on_cooldown(&self, identity: &str, command: &str, now_unix_ms: u64) -> bool {
        self.cooldown_remaining_ms(identity, command, now_unix_ms)
            .is_some()
    }

    fn cooldown_remaining_ms(&self, identity: &str, command: &str, now_unix_ms: u64) -> Option<u64> {
        let last = self.sessions.last_invocation(identity, command)?;
        let window_ms = duration_ms(self.config.cooldown);
        let elapsed = now_unix_ms.saturating_sub(last);
        (elapsed < window_ms).then(|| window_ms - elapsed)
    }

    /// Runs the risk check, then the cooldown check. An allowed command has its
    /// cooldown stamp refreshed; blocked attempts leave it untouched.
    pub fn admit_command(&self, identity: &str, command: &str, now_unix_ms: u64) -> CommandAdmission {
        let assessment = self.assess_command_risk(command, identity);
        if assessment.risk_level > self.config.max_risk_level {
            warn!(
                reason_code = REASON_COMMAND_RISK_BLOCKED,
                identity,
                command,
                risk_level = assessment.risk_level,
                reason = %assessment.reason,
                "command refused by risk gate"
            );
            return CommandAdmission::RiskBlocked { assessment };
        }
        if let Some(retry_after_ms) = self.cooldown_remaining_ms(identity, command, now_unix_ms) {
            debug!(
                reason_code = REASON_COMMAND_COOLDOWN_BLOCKED,
                identity,
                command,
                retry_after_ms,
                "command on cooldown"
            );
            return CommandAdmission::CooldownBlocked {
                assessment,
                retry_after_ms,
            };
        }
        self.sessions
            .record_invocation(identity, command, now_unix_ms);
        CommandAdmission::Allow { assessment }
    }

    pub fn record_command_result(&self, command: &str, success: bool) {
        self.statistics.record(command, success);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn gate(max_risk_level: u8) -> RiskGate {
        let config = RiskGateConfig {
            max_risk_level,
            command_table: CommandRiskTable::new(BTreeMap::from([
                ("ping".to_string(), 1),
                ("broadcast".to_string(), 4),
            ])),
            ..RiskGateConfig::default()
        };
        RiskGate::new(config, Arc::new(SessionStore::new()))
    }

    #[test]
    fn functional_level_four_message_is_dropped_and_counted() {
        let gate = gate(3);
        let message = InboundMessage::new("u1", "@a @b @c @d @e FREE!!!!!!!!!!!!!! www.example.com");

        let admission = gate.admit_message(&message);

        assert_eq!(
            admission,
            MessageAdmission::Drop {
                risk_level: 4,
                reason_code: REASON_MESSAGE_DROPPED_RISK.to_string(),
            }
        );
        assert_eq!(gate.dropped_messages(), 1);
    }

    #[test]
    fn unit_sender_admission_drops_blocked_identities_only() {
        let config = RiskGateConfig {
            message_policy: MessageRiskPolicy {
                blocked_identities: std::collections::BTreeSet::from(["troll".to_string()]),
                ..MessageRiskPolicy::default()
            },
            ..RiskGateConfig::default()
        };
        let gate = RiskGate::new(config, Arc::new(SessionStore::new()));

        assert_eq!(
            gate.admit_sender("troll", "v1"),
            MessageAdmission::Drop {
                risk_level: MAX_RISK_LEVEL,
                reason_code: REASON_MESSAGE_DROPPED_RISK.to_string(),
            }
        );
        assert_eq!(
            gate.admit_sender("u1", "v2"),
            MessageAdmission::Admit {
                risk_level: MIN_RISK_LEVEL,
            }
        );
        assert_eq!(gate.dropped_messages(), 1);
    }

    #[test]
    fn unit_message_at_max_level_is_dropped_below_is_admitted() {
        let gate = gate(2);
        let link = InboundMessage::new("u1", "https://example.com");
        let plain = InboundMessage::new("u1", "hello");
        assert!(matches!(gate.admit_message(&link), MessageAdmission::Drop { .. }));
        assert_eq!(
            gate.admit_message(&plain),
            MessageAdmission::Admit { risk_level: 1 }
        );
        assert_eq!(gate.dropped_messages(), 1);
    }

    #[test]
    fn functional_cooldown_blocks_inside_window_and_allows_after() {
        let gate = gate(3);
        assert!(matches!(
            gate.admit_command("U1", "ping", 0),
            CommandAdmission::Allow { .. }
        ));
        assert_eq!(
            gate.admit_command("U1", "ping", 1_000),
            CommandAdmission::CooldownBlocked {
                assessment: gate.assess_command_risk("ping", "U1"),
                retry_after_ms: 1_000,
            }
        );
        assert!(matches!(
            gate.admit_command("U1", "ping", 2_100),
            CommandAdmission::Allow { .. }
        ));
        assert_eq!(gate.sessions().last_invocation("U1", "ping"), Some(2_100));
    }

    #[test]
    fn unit_cooldown_boundary_is_inclusive_of_elapsed_window() {
        let gate = gate(3);
        gate.admit_command("U1", "ping", 0);
        assert!(gate.is_on_cooldown("U1", "ping", 1_999));
        assert!(!gate.is_on_cooldown("U1", "ping", 2_000));
        assert!(!gate.is_on_cooldown("U2", "ping", 1));
        assert!(!gate.is_on_cooldown("U1", "help", 1));
    }

    #[test]
    fn unit_risk_blocked_command_does_not_stamp_cooldown() {
        let gate = gate(3);
        let admission = gate.admit_command("U1", "broadcast", 0);
        assert_eq!(admission.reason_code(), REASON_COMMAND_RISK_BLOCKED);
        assert_eq!(admission.assessment().risk_level, 4);
        assert_eq!(gate.sessions().last_invocation("U1", "broadcast"), None);
    }

    #[test]
    fn regression_command_at_max_level_is_still_allowed() {
        let gate = gate(2);
        let admission = gate.admit_command("U1", "unknown", 0);
        assert_eq!(admission.assessment().risk_level, DEFAULT_COMMAND_RISK_LEVEL);
        assert_eq!(admission.reason_code(), REASON_COMMAND_ALLOWED);
    }
}
