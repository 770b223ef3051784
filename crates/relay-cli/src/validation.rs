use std::time::Duration;

use relay_contract::ConfigurationError;

use crate::bot_config::{BotConfig, DEFAULT_SECRET_KEY};

pub const MIN_RISK_LEVEL: u8 = 1;
pub const MAX_RISK_LEVEL: u8 = 5;

fn risk_level_in_range(level: u8) -> bool {
    (MIN_RISK_LEVEL..=MAX_RISK_LEVEL).contains(&level)
}

/// Collects every violated configuration rule. Returns `Ok(())` only when none fire.
pub fn validate_bot_config(config: &BotConfig) -> Result<(), ConfigurationError> {
    let mut violations = Vec::new();

    if config.operator.trim().is_empty() {
        violations.push("operator identity is required".to_string());
    }
    if config.session_id.trim().is_empty() {
        violations.push("session identifier is required".to_string());
    }
    if config.secret_key.trim().is_empty() {
        violations.push("secret key is required".to_string());
    } else if config.secret_key == DEFAULT_SECRET_KEY {
        violations.push("secret key must be changed from default".to_string());
    }
    if config.prefix.trim().is_empty() {
        violations.push("command prefix must not be empty".to_string());
    }
    if !risk_level_in_range(config.max_risk_level) {
        violations.push(format!(
            "max risk level must be between {MIN_RISK_LEVEL} and {MAX_RISK_LEVEL} (got {})",
            config.max_risk_level
        ));
    }
    for (command, level) in &config.command_risk {
        if !risk_level_in_range(*level) {
            violations.push(format!(
                "risk level for command '{command}' must be between {MIN_RISK_LEVEL} and {MAX_RISK_LEVEL} (got {level})"
            ));
        }
    }
    for entry in &config.malformed_command_risk {
        violations.push(format!(
            "command risk entry '{entry}' must use name=level form"
        ));
    }
    if config.memory_ceiling_bytes == 0 {
        violations.push("memory ceiling must be greater than 0".to_string());
    }
    if !(1..=100).contains(&config.memory_pressure_percent) {
        violations.push(format!(
            "memory pressure percent must be between 1 and 100 (got {})",
            config.memory_pressure_percent
        ));
    }

    let periods: [(&str, Duration); 6] = [
        ("backup interval", config.backup_interval),
        ("update interval", config.update_interval),
        ("health interval", config.health_interval),
        ("sweep interval", config.sweep_interval),
        ("idle session threshold", config.idle_session_threshold),
        ("backoff base", config.backoff_base),
    ];
    for (label, period) in periods {
        if period.is_zero() {
            violations.push(format!("{label} must be greater than 0"));
        }
    }
    if config.backoff_cap < config.backoff_base {
        violations.push("backoff cap must be at least the backoff base".to_string());
    }
    if config.max_recovery_attempts == 0 {
        violations.push("max recovery attempts must be greater than 0".to_string());
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConfigurationError::new(violations))
    }
}
