use std::collections::BTreeMap;

use serde::Serialize;

use crate::message_risk::{MAX_RISK_LEVEL, MIN_RISK_LEVEL};

pub const DEFAULT_COMMAND_RISK_LEVEL: u8 = 2;
pub const REASON_UNCLASSIFIED_COMMAND: &str = "unclassified command";
pub const REASON_BLOCKED_IDENTITY: &str = "identity is blocked";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Transient risk verdict for one command or message.
pub struct RiskAssessment {
    pub command: String,
    pub risk_level: u8,
    pub reason: String,
}

pub fn risk_label(level: u8) -> &'static str {
    match level {
        0 | 1 => "low",
        2 => "medium",
        3 => "high",
        4 => "extreme",
        _ => "critical",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Static per-command classification loaded from configuration.
pub struct CommandRiskTable {
    levels: BTreeMap<String, u8>,
}

impl CommandRiskTable {
    pub fn new(levels: BTreeMap<String, u8>) -> Self {
        let levels = levels
            .into_iter()
            .map(|(command, level)| {
                (
                    command.to_ascii_lowercase(),
                    level.clamp(MIN_RISK_LEVEL, MAX_RISK_LEVEL),
                )
            })
            .collect();
        Self { levels }
    }

    pub fn level_for(&self, command: &str) -> Option<u8> {
        self.levels.get(command).copied()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Classifies `command`. Unknown commands fall back to the medium level.
    pub fn assess(&self, command: &str, identity_blocked: bool) -> RiskAssessment {
        if identity_blocked {
            return RiskAssessment {
                command: command.to_string(),
                risk_level: MAX_RISK_LEVEL,
                reason: REASON_BLOCKED_IDENTITY.to_string(),
            };
        }
        match self.level_for(command) {
            Some(level) => RiskAssessment {
                command: command.to_string(),
                risk_level: level,
                reason: format!("classified as {} risk", risk_label(level)),
            },
            None => RiskAssessment {
                command: command.to_string(),
                risk_level: DEFAULT_COMMAND_RISK_LEVEL,
                reason: REASON_UNCLASSIFIED_COMMAND.to_string(),
            },
        }
    }
}
