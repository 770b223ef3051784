//! CLI argument models and configuration validation for Relay binaries.
//!
//! Every option is overridable through a `RELAY_*` environment variable.
//! [`BotConfig`] is the validated value object the orchestrator consumes.

pub mod bot_config;
pub mod cli_args;
pub mod validation;

pub use bot_config::*;
pub use cli_args::Cli;
pub use validation::*;
