use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::bot_config::DEFAULT_SECRET_KEY;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "relay-bot",
    about = "Resilient chat automation agent with risk-gated command dispatch",
    version
)]
/// Public struct `Cli` used across Relay components.
pub struct Cli {
    #[arg(
        long,
        env = "RELAY_OPERATOR",
        default_value = "",
        help = "Identity of the operator that receives startup and shutdown notices"
    )]
    pub operator: String,

    #[arg(
        long = "session-id",
        env = "RELAY_SESSION_ID",
        help = "Transport session identifier. Generated from the current time when omitted"
    )]
    pub session_id: Option<String>,

    #[arg(
        long = "secret-key",
        env = "RELAY_SECRET_KEY",
        default_value = DEFAULT_SECRET_KEY,
        hide_default_value = true,
        hide_env_values = true,
        help = "Secret key used by the credential store. Must differ from the shipped default"
    )]
    pub secret_key: String,

    #[arg(
        long = "bot-name",
        env = "RELAY_BOT_NAME",
        default_value = "relay-bot",
        help = "Display name used as watermark on AI replies and in operator notices"
    )]
    pub bot_name: String,

    #[arg(
        long,
        env = "RELAY_PREFIX",
        default_value = "/",
        help = "Prefix that marks an inbound message as a command"
    )]
    pub prefix: String,

    #[arg(
        long = "security-mode",
        env = "RELAY_SECURITY_MODE",
        default_value = "high",
        help = "Security mode label reported in the startup notice"
    )]
    pub security_mode: String,

    #[arg(
        long = "max-risk-level",
        env = "RELAY_MAX_RISK_LEVEL",
        default_value_t = 3,
        help = "Messages scored at or above this level are dropped; commands above it are refused (1-5)"
    )]
    pub max_risk_level: u8,

    #[arg(
        long = "command-risk",
        env = "RELAY_COMMAND_RISK",
        value_delimiter = ',',
        help = "Static command risk classification entries in name=level form"
    )]
    pub command_risk: Vec<String>,

    #[arg(
        long = "blocked-identity",
        env = "RELAY_BLOCKED_IDENTITIES",
        value_delimiter = ',',
        help = "Identities whose messages and commands always score the maximum risk"
    )]
    pub blocked_identity: Vec<String>,

    #[arg(
        long = "block-links",
        env = "RELAY_BLOCK_LINKS",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Raise message risk when the body carries a link"
    )]
    pub block_links: bool,

    #[arg(
        long = "block-spam",
        env = "RELAY_BLOCK_SPAM",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Raise message risk when spam heuristics fire"
    )]
    pub block_spam: bool,

    #[arg(
        long = "cooldown-ms",
        env = "RELAY_COOLDOWN_MS",
        default_value_t = 2_000,
        help = "Minimum milliseconds between two invocations of one command by one identity"
    )]
    pub cooldown_ms: u64,

    #[arg(
        long = "voice-mode",
        env = "RELAY_VOICE_MODE",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Route voice notes to the voice-command processor"
    )]
    pub voice_mode: bool,

    #[arg(
        long = "ai-responder",
        env = "RELAY_AI_RESPONDER",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Answer non-command messages through the AI responder"
    )]
    pub ai_responder: bool,

    #[arg(
        long = "memory-ceiling-mb",
        env = "RELAY_MEMORY_CEILING_MB",
        default_value_t = 512,
        help = "Memory ceiling in MiB used by the health check"
    )]
    pub memory_ceiling_mb: u64,

    #[arg(
        long = "memory-pressure-percent",
        env = "RELAY_MEMORY_PRESSURE_PERCENT",
        default_value_t = 80,
        help = "Fraction of the ceiling (1-100) above which memory optimization runs"
    )]
    pub memory_pressure_percent: u8,

    #[arg(
        long = "backup-interval-ms",
        env = "RELAY_BACKUP_INTERVAL_MS",
        default_value_t = 3_600_000,
        help = "Period of the persistent backup task"
    )]
    pub backup_interval_ms: u64,

    #[arg(
        long = "update-interval-ms",
        env = "RELAY_UPDATE_INTERVAL_MS",
        default_value_t = 3_600_000,
        help = "Period of the update check task"
    )]
    pub update_interval_ms: u64,

    #[arg(
        long = "health-interval-ms",
        env = "RELAY_HEALTH_INTERVAL_MS",
        default_value_t = 300_000,
        help = "Period of the health check task"
    )]
    pub health_interval_ms: u64,

    #[arg(
        long = "sweep-interval-ms",
        env = "RELAY_SWEEP_INTERVAL_MS",
        default_value_t = 1_800_000,
        help = "Period of the idle-session sweep task"
    )]
    pub sweep_interval_ms: u64,

    #[arg(
        long = "idle-session-ms",
        env = "RELAY_IDLE_SESSION_MS",
        default_value_t = 3_600_000,
        help = "Sessions idle longer than this are removed by the sweep"
    )]
    pub idle_session_ms: u64,

    #[arg(
        long = "max-recovery-attempts",
        env = "RELAY_MAX_RECOVERY_ATTEMPTS",
        default_value_t = 3,
        help = "Recovery attempts before an emergency shutdown"
    )]
    pub max_recovery_attempts: usize,

    #[arg(
        long = "backoff-base-ms",
        env = "RELAY_BACKOFF_BASE_MS",
        default_value_t = 5_000,
        help = "Initial recovery backoff; doubles per attempt"
    )]
    pub backoff_base_ms: u64,

    #[arg(
        long = "backoff-cap-ms",
        env = "RELAY_BACKOFF_CAP_MS",
        default_value_t = 60_000,
        help = "Upper bound for the recovery backoff"
    )]
    pub backoff_cap_ms: u64,

    #[arg(
        long = "backoff-jitter-ms",
        env = "RELAY_BACKOFF_JITTER_MS",
        default_value_t = 0,
        help = "Deterministic jitter added to each recovery backoff"
    )]
    pub backoff_jitter_ms: u64,

    #[arg(
        long = "shutdown-grace-ms",
        env = "RELAY_SHUTDOWN_GRACE_MS",
        default_value_t = 5_000,
        help = "Time in-flight work gets to finish during a graceful shutdown"
    )]
    pub shutdown_grace_ms: u64,

    #[arg(
        long = "state-dir",
        env = "RELAY_STATE_DIR",
        help = "Directory for storage backups and the persisted health snapshot"
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long = "update-manifest-url",
        env = "RELAY_UPDATE_MANIFEST_URL",
        help = "Release manifest URL polled by the update check. Disabled when omitted"
    )]
    pub update_manifest_url: Option<String>,

    #[arg(
        long = "log-level",
        env = "RELAY_LOG_LEVEL",
        default_value = "info",
        help = "Default tracing directive; RUST_LOG takes precedence"
    )]
    pub log_level: String,
}
