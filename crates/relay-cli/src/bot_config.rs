use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use relay_contract::ConfigurationError;
use relay_core::current_unix_timestamp_ms;

use crate::cli_args::Cli;
use crate::validation::validate_bot_config;

/// Shipped placeholder secret. Startup refuses to run with it.
pub const DEFAULT_SECRET_KEY: &str = "default-insecure-key-change-immediately";
pub const DEFAULT_MAX_RISK_LEVEL: u8 = 3;
pub const DEFAULT_COOLDOWN_MS: u64 = 2_000;
pub const DEFAULT_MEMORY_CEILING_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_MEMORY_PRESSURE_PERCENT: u8 = 80;
pub const DEFAULT_BACKUP_INTERVAL_MS: u64 = 3_600_000;
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 3_600_000;
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_800_000;
pub const DEFAULT_IDLE_SESSION_MS: u64 = 3_600_000;
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: usize = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Generates a session identifier of the form `relay_session_<unix_ms>`.
pub fn generated_session_id() -> String {
    format!("relay_session_{}", current_unix_timestamp_ms())
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Orchestrator configuration. Built from [`Cli`], checked by [`BotConfig::validate`].
pub struct BotConfig {
    pub operator: String,
    pub session_id: String,
    pub secret_key: String,
    pub bot_name: String,
    pub prefix: String,
    pub security_mode: String,
    pub max_risk_level: u8,
    pub command_risk: BTreeMap<String, u8>,
    /// Raw `--command-risk` entries that did not parse as `name=level`.
    pub malformed_command_risk: Vec<String>,
    pub blocked_identities: Vec<String>,
    pub block_links: bool,
    pub block_spam: bool,
    pub cooldown: Duration,
    pub voice_mode: bool,
    pub ai_responder: bool,
    pub memory_ceiling_bytes: u64,
    pub memory_pressure_percent: u8,
    pub backup_interval: Duration,
    pub update_interval: Duration,
    pub health_interval: Duration,
    pub sweep_interval: Duration,
    pub idle_session_threshold: Duration,
    pub max_recovery_attempts: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub backoff_jitter: Duration,
    pub shutdown_grace: Duration,
    pub state_dir: Option<PathBuf>,
    pub update_manifest_url: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            operator: String::new(),
            session_id: generated_session_id(),
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            bot_name: "relay-bot".to_string(),
            prefix: "/".to_string(),
            security_mode: "high".to_string(),
            max_risk_level: DEFAULT_MAX_RISK_LEVEL,
            command_risk: BTreeMap::new(),
            malformed_command_risk: Vec::new(),
            blocked_identities: Vec::new(),
            block_links: true,
            block_spam: true,
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            voice_mode: true,
            ai_responder: true,
            memory_ceiling_bytes: DEFAULT_MEMORY_CEILING_BYTES,
            memory_pressure_percent: DEFAULT_MEMORY_PRESSURE_PERCENT,
            backup_interval: Duration::from_millis(DEFAULT_BACKUP_INTERVAL_MS),
            update_interval: Duration::from_millis(DEFAULT_UPDATE_INTERVAL_MS),
            health_interval: Duration::from_millis(DEFAULT_HEALTH_INTERVAL_MS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            idle_session_threshold: Duration::from_millis(DEFAULT_IDLE_SESSION_MS),
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            backoff_jitter: Duration::ZERO,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            state_dir: None,
            update_manifest_url: None,
        }
    }
}

impl BotConfig {
    /// Checks every rule and reports all violations at once.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_bot_config(self)
    }

    /// Memory usage above which the health check asks for optimization.
    pub fn memory_pressure_threshold_bytes(&self) -> u64 {
        let percent = u64::from(self.memory_pressure_percent.min(100));
        self.memory_ceiling_bytes / 100 * percent
            + (self.memory_ceiling_bytes % 100) * percent / 100
    }
}

impl From<&Cli> for BotConfig {
    fn from(cli: &Cli) -> Self {
        let (command_risk, malformed_command_risk) = parse_command_risk_entries(&cli.command_risk);
        Self {
            operator: cli.operator.trim().to_string(),
            session_id: cli
                .session_id
                .as_deref()
                .map(str::trim)
                .map(str::to_string)
                .unwrap_or_else(generated_session_id),
            secret_key: cli.secret_key.clone(),
            bot_name: cli.bot_name.trim().to_string(),
            prefix: cli.prefix.clone(),
            security_mode: cli.security_mode.trim().to_string(),
            max_risk_level: cli.max_risk_level,
            command_risk,
            malformed_command_risk,
            blocked_identities: cli
                .blocked_identity
                .iter()
                .map(|identity| identity.trim())
                .filter(|identity| !identity.is_empty())
                .map(str::to_string)
                .collect(),
            block_links: cli.block_links,
            block_spam: cli.block_spam,
            cooldown: Duration::from_millis(cli.cooldown_ms),
            voice_mode: cli.voice_mode,
            ai_responder: cli.ai_responder,
            memory_ceiling_bytes: cli.memory_ceiling_mb.saturating_mul(1024 * 1024),
            memory_pressure_percent: cli.memory_pressure_percent,
            backup_interval: Duration::from_millis(cli.backup_interval_ms),
            update_interval: Duration::from_millis(cli.update_interval_ms),
            health_interval: Duration::from_millis(cli.health_interval_ms),
            sweep_interval: Duration::from_millis(cli.sweep_interval_ms),
            idle_session_threshold: Duration::from_millis(cli.idle_session_ms),
            max_recovery_attempts: cli.max_recovery_attempts,
            backoff_base: Duration::from_millis(cli.backoff_base_ms),
            backoff_cap: Duration::from_millis(cli.backoff_cap_ms),
            backoff_jitter: Duration::from_millis(cli.backoff_jitter_ms),
            shutdown_grace: Duration::from_millis(cli.shutdown_grace_ms),
            state_dir: cli.state_dir.clone(),
            update_manifest_url: cli
                .update_manifest_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
        }
    }
}

/// Splits `name=level` entries into a lowercase name table and the raw
/// entries that failed to parse. Later entries win on duplicate names.
pub fn parse_command_risk_entries(raw: &[String]) -> (BTreeMap<String, u8>, Vec<String>) {
    let mut table = BTreeMap::new();
    let mut malformed = Vec::new();
    for entry in raw {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed = trimmed.split_once('=').and_then(|(name, level)| {
            let name = name.trim().to_ascii_lowercase();
            let level = level.trim().parse::<u8>().ok()?;
            (!name.is_empty()).then_some((name, level))
        });
        match parsed {
            Some((name, level)) => {
                table.insert(name, level);
            }
            None => malformed.push(trimmed.to_string()),
        }
    }
    (table, malformed)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn unit_parse_command_risk_entries_normalizes_and_reports_malformed() {
        let (table, malformed) = parse_command_risk_entries(&[
            "Ban=5".to_string(),
            " broadcast = 4 ".to_string(),
            "ban=4".to_string(),
            "nolevel".to_string(),
            "=3".to_string(),
            "kick=high".to_string(),
            String::new(),
        ]);
        assert_eq!(table.get("ban"), Some(&4));
        assert_eq!(table.get("broadcast"), Some(&4));
        assert_eq!(malformed, vec!["nolevel", "=3", "kick=high"]);
    }

    #[test]
    fn functional_cli_maps_into_bot_config_with_documented_defaults() {
        let cli = Cli::try_parse_from([
            "relay-bot",
            "--operator",
            " owner@chat ",
            "--session-id",
            "session-7",
            "--command-risk",
            "ban=5,ping=1",
            "--blocked-identity",
            "spammer, ,troll",
            "--block-links=false",
        ])
        .expect("parse cli");
        let config = BotConfig::from(&cli);

        assert_eq!(config.operator, "owner@chat");
        assert_eq!(config.session_id, "session-7");
        assert_eq!(config.prefix, "/");
        assert_eq!(config.max_risk_level, 3);
        assert_eq!(config.cooldown, Duration::from_millis(2_000));
        assert_eq!(config.memory_ceiling_bytes, 512 * 1024 * 1024);
        assert_eq!(config.command_risk.get("ban"), Some(&5));
        assert_eq!(config.blocked_identities, vec!["spammer", "troll"]);
        assert!(!config.block_links);
        assert!(config.block_spam);
        assert_eq!(config.health_interval, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(1_800));
    }

    #[test]
    fn unit_missing_session_id_is_generated() {
        let cli = Cli::try_parse_from(["relay-bot"]).expect("parse cli");
        let config = BotConfig::from(&cli);
        assert!(config.session_id.starts_with("relay_session_"));
    }

    #[test]
    fn unit_memory_pressure_threshold_uses_percent_of_ceiling() {
        let config = BotConfig {
            memory_ceiling_bytes: 1_000,
            memory_pressure_percent: 80,
            ..BotConfig::default()
        };
        assert_eq!(config.memory_pressure_threshold_bytes(), 800);
    }
}
