use std::sync::Arc;

use relay_agent::FaultReporter;
use relay_runtime::contained_panic_scope;
use tokio::sync::Notify;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub(crate) fn default_level_filter(log_level: &str) -> LevelFilter {
    match log_level.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Logs go to stderr; stdout carries the line transport.
pub(crate) fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level_filter(log_level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn panic_summary(
    location: Option<&std::panic::Location<'_>>,
    payload: &(dyn std::any::Any + Send),
) -> String {
    let location = location
        .map(|location| format!("{}:{}", location.file(), location.line()))
        .unwrap_or_else(|| "unknown location".to_string());
    let payload = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("panic at {location}: {payload}")
}

/// Routes uncontained panics to the controller's fault channel after the
/// default hook has printed them. Panics raised inside a containment scope
/// (scheduled task runs, dispatch jobs) are left to their owner.
pub(crate) fn install_fault_hook(reporter: FaultReporter) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        let summary = panic_summary(panic_info.location(), panic_info.payload());
        if let Some(scope) = contained_panic_scope() {
            warn!(scope, detail = %summary, "panic contained by its owner");
            return;
        }
        reporter.report(summary);
    }));
}

async fn interrupt_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(error) => {
            warn!(error = %error, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// Resolves on Ctrl-C, SIGTERM, or when the line transport reports end of input.
pub(crate) async fn shutdown_signal(input_closed: Arc<Notify>) {
    tokio::select! {
        _ = interrupt_signal() => {
            info!(signal = "interrupt", "shutdown requested");
        }
        _ = terminate_signal() => {
            info!(signal = "terminate", "shutdown requested");
        }
        _ = input_closed.notified() => {
            info!("input stream closed; shutting down");
        }
    }
}
