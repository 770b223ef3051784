mod bootstrap_helpers;
mod builtin_commands;
mod file_storage;
mod keyed_security;
mod line_transport;
mod process_memory;
mod release_check;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use relay_agent::{Collaborators, LifecycleController};
use relay_cli::{BotConfig, Cli};
use relay_core::SystemClock;
use tokio::sync::Notify;
use tracing::info;

use crate::bootstrap_helpers::{init_tracing, install_fault_hook, shutdown_signal};
use crate::builtin_commands::{BuiltinCommands, MentionResponder, TranscriptAcknowledger};
use crate::file_storage::FileStorage;
use crate::keyed_security::KeyedSecurity;
use crate::line_transport::StdioConnector;
use crate::process_memory::ProcessMemoryProbe;
use crate::release_check::ReleaseManifestChecker;

pub(crate) const DEFAULT_STATE_DIR: &str = ".relay";

pub(crate) fn build_collaborators(
    config: &BotConfig,
    state_dir: &Path,
    input_closed: Arc<Notify>,
) -> Collaborators {
    Collaborators {
        security: Arc::new(KeyedSecurity::new(
            config.secret_key.clone(),
            config.session_id.clone(),
        )),
        storage: Arc::new(FileStorage::new(state_dir, config.session_id.clone())),
        plugins: Arc::new(BuiltinCommands::new(config.prefix.clone())),
        ai: Arc::new(MentionResponder::new(
            config.bot_name.clone(),
            config.prefix.clone(),
        )),
        voice: Arc::new(TranscriptAcknowledger),
        updates: Arc::new(ReleaseManifestChecker::new(
            config.update_manifest_url.clone(),
            env!("CARGO_PKG_VERSION"),
        )),
        memory: Arc::new(ProcessMemoryProbe::new()),
        connector: Arc::new(StdioConnector::new(input_closed)),
        clock: Arc::new(SystemClock),
    }
}

#[tokio::main]
async fn run(cli: Cli) -> i32 {
    let mut config = BotConfig::from(&cli);
    let state_dir = config
        .state_dir
        .get_or_insert_with(|| PathBuf::from(DEFAULT_STATE_DIR))
        .clone();
    let input_closed = Arc::new(Notify::new());
    let collaborators = build_collaborators(&config, &state_dir, Arc::clone(&input_closed));

    info!(
        bot = %config.bot_name,
        session_id = %config.session_id,
        state_dir = %state_dir.display(),
        "starting relay bot"
    );
    let mut controller = LifecycleController::new(config, collaborators);
    install_fault_hook(controller.fault_reporter());
    controller.run(shutdown_signal(input_closed)).await
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let exit_code = run(cli);
    std::process::exit(exit_code);
}
