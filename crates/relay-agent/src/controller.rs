use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_cli::BotConfig;
use relay_contract::{
    transport_event_channel, AiResponder, CollaboratorError, LifecycleError,
    MemoryProbe, OutboundPayload, PersistentStorage, PluginHost, SecurityProvider,
    TransportConnector, TransportError, TransportEvent, TransportEventReceiver, UpdateChecker,
    VoiceCommandProcessor,
};
use relay_core::{format_uptime, Clock};
use relay_gate::{CommandRiskTable, MessageRiskPolicy, RiskGate, RiskGateConfig};
use relay_runtime::{
    AutoHealer, ErrorDisposition, RecoveryDecision, RecoveryPolicy, ScheduledTask, Scheduler,
    SchedulerHandle, TaskStats,
};
use relay_session::SessionStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::control::{control_channel, ControlReceiver, ControlSender, ControlSignal, FaultReporter};
use crate::dispatch::{
    dispatch_channel, spawn_dispatch_worker, DispatchJob, DispatchSettings, MessageDispatcher,
    TransportSlot,
};
use crate::lifecycle_state::{LifecycleState, LifecycleTracker};
use crate::maintenance_tasks::{
    check_for_updates_logged, BackupTask, HealthCheckTask, HealthMonitor, SessionSweepTask,
    UpdateCheckTask,
};

pub const REASON_INITIALIZATION_FAILED: &str = "initialization_failed";
pub const REASON_STARTUP_FAILED: &str = "startup_failed";
pub const REASON_GRACEFUL_SHUTDOWN: &str = "graceful_shutdown";
pub const REASON_EMERGENCY_SHUTDOWN: &str = "emergency_shutdown";
pub const REASON_TEARDOWN_STEP_FAILED: &str = "teardown_step_failed";
pub const REASON_TRAFFIC_REJECTED: &str = "traffic_rejected_not_running";

/// External collaborators the controller drives. All are shared trait objects.
#[derive(Clone)]
pub struct Collaborators {
    pub security: Arc<dyn SecurityProvider>,
    pub storage: Arc<dyn PersistentStorage>,
    pub plugins: Arc<dyn PluginHost>,
    pub ai: Arc<dyn AiResponder>,
    pub voice: Arc<dyn VoiceCommandProcessor>,
    pub updates: Arc<dyn UpdateChecker>,
    pub memory: Arc<dyn MemoryProbe>,
    pub connector: Arc<dyn TransportConnector>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `ShutdownKind` values.
pub enum ShutdownKind {
    Graceful,
    Emergency,
}

impl ShutdownKind {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Graceful => 0,
            Self::Emergency => 1,
        }
    }
}

#[derive(Debug, Default)]
struct StartupProgress {
    security: bool,
    storage: bool,
    plugins: bool,
    ai: bool,
}

enum LoopStep {
    Shutdown,
    Control(Option<ControlSignal>),
    Reconnect,
    Event(Option<TransportEvent>),
}

async fn next_event(events: &mut Option<TransportEventReceiver>) -> Option<TransportEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}


pub fn startup_notification_text(config: &BotConfig) -> String {
    format!(
        "{} started\nSecurity mode: {}\nVoice mode: {}\nAI responder: {}",
        config.bot_name,
        config.security_mode,
        if config.voice_mode { "enabled" } else { "disabled" },
        if config.ai_responder { "active" } else { "inactive" },
    )
}

pub fn goodbye_text(bot_name: &str, uptime: Duration) -> String {
    format!(
        "{bot_name} shutting down\nUptime: {}\nGoodbye!",
        format_uptime(uptime)
    )
}

/// Owns the lifecycle state machine and is the only component that orders
/// startup and teardown or decides the process exit code.
pub struct LifecycleController {
    config: BotConfig,
    collaborators: Collaborators,
    lifecycle: LifecycleTracker,
    gate: Arc<RiskGate>,
    healer: Arc<AutoHealer>,
    transport: Arc<TransportSlot>,
    dispatcher: Arc<MessageDispatcher>,
    control_tx: ControlSender,
    control_rx: ControlReceiver,
    events_rx: Option<TransportEventReceiver>,
    reconnect_at: Option<Instant>,
    dispatch_tx: Option<mpsc::Sender<DispatchJob>>,
    dispatch_worker: Option<JoinHandle<()>>,
    health_monitor: Option<SchedulerHandle>,
    background: Option<SchedulerHandle>,
    progress: StartupProgress,
    started_at: Instant,
    shutdown: Option<ShutdownKind>,
}

impl LifecycleController {
    pub fn new(config: BotConfig, collaborators: Collaborators) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let gate = Arc::new(RiskGate::new(
            RiskGateConfig {
                max_risk_level: config.max_risk_level,
                cooldown: config.cooldown,
                message_policy: MessageRiskPolicy {
                    block_links: config.block_links,
                    block_spam: config.block_spam,
                    blocked_identities: config
                        .blocked_identities
                        .iter()
                        .cloned()
                        .collect::<BTreeSet<_>>(),
                },
                command_table: CommandRiskTable::new(config.command_risk.clone()),
            },
            sessions,
        ));
        let healer = Arc::new(AutoHealer::new(RecoveryPolicy {
            max_attempts: config.max_recovery_attempts,
            base_delay: config.backoff_base,
            max_delay: config.backoff_cap,
            jitter: config.backoff_jitter,
        }));
        let transport = Arc::new(TransportSlot::new());
        let dispatcher = Arc::new(MessageDispatcher::new(
            DispatchSettings {
                prefix: config.prefix.clone(),
                bot_name: config.bot_name.clone(),
                ai_responder: config.ai_responder,
                voice_mode: config.voice_mode,
            },
            Arc::clone(&gate),
            Arc::clone(&transport),
            Arc::clone(&collaborators.plugins),
            Arc::clone(&collaborators.ai),
            Arc::clone(&collaborators.voice),
            Arc::clone(&collaborators.clock),
        ));
        let (control_tx, control_rx) = control_channel();
        Self {
            config,
            collaborators,
            lifecycle: LifecycleTracker::new(),
            gate,
            healer,
            transport,
            dispatcher,
            control_tx,
            control_rx,
            events_rx: None,
            reconnect_at: None,
            dispatch_tx: None,
            dispatch_worker: None,
            health_monitor: None,
            background: None,
            progress: StartupProgress::default(),
            started_at: Instant::now(),
            shutdown: None,
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn gate(&self) -> &Arc<RiskGate> {
        &self.gate
    }

    pub fn healer(&self) -> &Arc<AutoHealer> {
        &self.healer
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn fault_reporter(&self) -> FaultReporter {
        FaultReporter::new(self.control_tx.clone())
    }

    pub fn control_sender(&self) -> ControlSender {
        self.control_tx.clone()
    }

    pub fn shutdown_kind(&self) -> Option<ShutdownKind> {
        self.shutdown
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn background_task_stats(&self) -> Vec<(&'static str, TaskStats)> {
        self.health_monitor
            .iter()
            .chain(self.background.iter())
            .flat_map(|handle| handle.stats())
            .collect()
    }

    fn transition(&self, next: LifecycleState) -> Result<(), LifecycleError> {
        self.lifecycle.transition(next).map(|_| ())
    }

    fn now_unix_ms(&self) -> u64 {
        self.collaborators.clock.now_unix_ms()
    }

    /// Full lifecycle: initialize, start, then serve until `shutdown` resolves or a
    /// fatal condition forces an emergency shutdown. Returns the exit code.
    pub async fn run<F>(&mut self, shutdown: F) -> i32
    where
        F: Future<Output = ()>,
    {
        if let Err(error) = self.initialize().await {
            error!(
                reason_code = REASON_INITIALIZATION_FAILED,
                cause = error.reason_code(),
                error = %error,
                "initialization failed"
            );
            return self.emergency_shutdown().await;
        }
        if let Err(error) = self.start().await {
            error!(
                reason_code = REASON_STARTUP_FAILED,
                cause = error.reason_code(),
                error = %error,
                "startup failed"
            );
            return self.emergency_shutdown().await;
        }
        self.run_until_shutdown(shutdown).await
    }

    /// Starts collaborators in fixed order: security, storage, plugins, AI,
    /// health monitor, update check. The first failure aborts the rest.
    pub async fn initialize(&mut self) -> Result<(), LifecycleError> {
        info!(
            bot = %self.config.bot_name,
            version = env!("CARGO_PKG_VERSION"),
            "initializing"
        );
        self.transition(LifecycleState::ConnectingSecurity)?;

        self.collaborators.security.initialize().await?;
        self.progress.security = true;
        info!("security initialized");

        self.collaborators.storage.connect().await?;
        self.progress.storage = true;
        info!("storage connected");

        let plugins = self.collaborators.plugins.load_plugins().await?;
        self.progress.plugins = true;
        info!(plugins, "plugins loaded");

        if self.config.ai_responder {
            self.collaborators.ai.initialize().await?;
            self.progress.ai = true;
            info!("ai responder initialized");
        }

        self.start_health_monitor()?;

        check_for_updates_logged(self.collaborators.updates.as_ref())
            .await
            .map_err(|error| CollaboratorError::new("update checker", format!("{error:#}")))?;

        self.transition(LifecycleState::ConnectingTransport)?;
        info!("initialization completed");
        Ok(())
    }

    /// Validates configuration, runs the pre-launch check, and connects the
    /// transport. Recoverable connection failures are retried through the healer.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        self.config.validate()?;
        self.collaborators.security.pre_launch_check().await?;
        self.transition(LifecycleState::ConnectingTransport)?;
        self.ensure_dispatch_worker();

        loop {
            let error = match self.connect_transport().await {
                Ok(()) => break,
                Err(error) => error,
            };
            match self.healer.handle_error(&error, self.now_unix_ms()) {
                ErrorDisposition::Recover(RecoveryDecision::Retry { attempt, delay }) => {
                    self.transition(LifecycleState::Recovering)?;
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transport startup failed; retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    self.transition(LifecycleState::ConnectingTransport)?;
                }
                ErrorDisposition::Recover(RecoveryDecision::Exhausted { attempts }) => {
                    return Err(LifecycleError::RecoveryExhausted { attempts });
                }
                _ => return Err(error),
            }
        }

        self.healer.record_success();
        self.transition(LifecycleState::Running)?;
        info!(
            operator = %self.config.operator,
            session_id = %self.config.session_id,
            "bot started"
        );
        self.send_to_operator(startup_notification_text(&self.config))
            .await;
        self.start_background_services()?;
        Ok(())
    }

    /// A refused registration is a configuration problem only when the
    /// configuration itself is invalid; then every violation is reported.
    fn scheduler_error(&self, error: anyhow::Error) -> LifecycleError {
        match self.config.validate() {
            Err(violations) => violations.into(),
            Ok(()) => CollaboratorError::new("scheduler", format!("{error:#}")).into(),
        }
    }

    fn start_health_monitor(&mut self) -> Result<(), LifecycleError> {
        if self.health_monitor.is_some() {
            return Ok(());
        }
        let monitor = HealthMonitor {
            memory: Arc::clone(&self.collaborators.memory),
            memory_ceiling_bytes: self.config.memory_ceiling_bytes,
            pressure_threshold_bytes: self.config.memory_pressure_threshold_bytes(),
            cooldown: self.config.cooldown,
            healer: Arc::clone(&self.healer),
            gate: Arc::clone(&self.gate),
            transport: Arc::clone(&self.transport),
            state: self.lifecycle.subscribe(),
            clock: Arc::clone(&self.collaborators.clock),
            started_at: self.started_at,
            snapshot_path: HealthMonitor::snapshot_path_for(self.config.state_dir.as_deref()),
            control: self.control_tx.clone(),
        };
        let mut scheduler = Scheduler::new();
        scheduler
            .register(
                Arc::new(HealthCheckTask::new(monitor)),
                self.config.health_interval,
            )
            .map_err(|error| self.scheduler_error(error))?;
        self.health_monitor = Some(scheduler.start());
        info!(
            interval_ms = self.config.health_interval.as_millis() as u64,
            "health monitor started"
        );
        Ok(())
    }

    fn start_background_services(&mut self) -> Result<(), LifecycleError> {
        if self.background.is_some() {
            return Ok(());
        }
        let tasks: [(Arc<dyn ScheduledTask>, Duration); 3] = [
            (
                Arc::new(UpdateCheckTask::new(Arc::clone(&self.collaborators.updates))),
                self.config.update_interval,
            ),
            (
                Arc::new(BackupTask::new(Arc::clone(&self.collaborators.storage))),
                self.config.backup_interval,
            ),
            (
                Arc::new(SessionSweepTask::new(
                    Arc::clone(&self.gate),
                    self.config.idle_session_threshold,
                    Arc::clone(&self.collaborators.clock),
                )),
                self.config.sweep_interval,
            ),
        ];
        let mut scheduler = Scheduler::new();
        for (task, period) in tasks {
            scheduler
                .register(task, period)
                .map_err(|error| self.scheduler_error(error))?;
        }
        self.background = Some(scheduler.start());
        info!("background services started");
        Ok(())
    }

    fn ensure_dispatch_worker(&mut self) {
        if self.dispatch_tx.is_some() {
            return;
        }
        let (jobs_tx, jobs_rx) = dispatch_channel();
        self.dispatch_worker = Some(spawn_dispatch_worker(
            Arc::clone(&self.dispatcher),
            jobs_rx,
        ));
        self.dispatch_tx = Some(jobs_tx);
    }

    async fn connect_transport(&mut self) -> Result<(), LifecycleError> {
        let transport = self.collaborators.connector.build();
        let (events_tx, events_rx) = transport_event_channel();
        transport.initialize(events_tx).await?;
        self.transport.replace(Some(transport));
        self.events_rx = Some(events_rx);
        info!("transport connected");
        Ok(())
    }

    /// Detaches the current transport and shuts it down. Failures are logged.
    async fn release_transport(&mut self) {
        self.events_rx = None;
        if let Some(transport) = self.transport.take() {
            if let Err(error) = transport.clean_shutdown().await {
                warn!(
                    reason_code = REASON_TEARDOWN_STEP_FAILED,
                    step = "transport_clean_shutdown",
                    error = %error,
                    "transport shutdown failed"
                );
            }
        }
    }

    async fn send_to_operator(&self, text: String) {
        if self.config.operator.is_empty() {
            return;
        }
        self.transport
            .send_logged(&self.config.operator, OutboundPayload::text(text))
            .await;
    }

    /// Serves transport events and control signals until shutdown.
    pub async fn run_until_shutdown<F>(&mut self, shutdown: F) -> i32
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            if let Some(kind) = self.shutdown {
                return kind.exit_code();
            }
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => LoopStep::Shutdown,
                signal = self.control_rx.recv() => LoopStep::Control(signal),
                _ = reconnect_due(self.reconnect_at) => LoopStep::Reconnect,
                event = next_event(&mut self.events_rx) => LoopStep::Event(event),
            };
            let exit = match step {
                LoopStep::Shutdown => Some(self.graceful_shutdown().await),
                LoopStep::Control(Some(signal)) => self.handle_control(signal).await,
                LoopStep::Control(None) => None,
                LoopStep::Reconnect => self.reconnect().await,
                LoopStep::Event(Some(event)) => self.handle_transport_event(event).await,
                LoopStep::Event(None) => {
                    self.handle_error(TransportError::Disconnected {
                        reason: "transport event stream closed".to_string(),
                    }
                    .into())
                    .await
                }
            };
            if let Some(code) = exit {
                return code;
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Option<i32> {
        match event {
            TransportEvent::Connected => {
                info!("transport reported connected");
                None
            }
            TransportEvent::Message(message) => {
                self.enqueue(DispatchJob::Message(message)).await;
                None
            }
            TransportEvent::VoiceMessage(voice) => {
                self.enqueue(DispatchJob::Voice(voice)).await;
                None
            }
            TransportEvent::Disconnected { reason } => {
                warn!(reason = %reason, "transport disconnected");
                self.handle_error(TransportError::Disconnected { reason }.into())
                    .await
            }
            TransportEvent::Error(error) => self.handle_error(error.into()).await,
        }
    }

    async fn enqueue(&self, job: DispatchJob) {
        let state = self.state();
        if !state.accepts_traffic() {
            debug!(
                reason_code = REASON_TRAFFIC_REJECTED,
                state = state.as_str(),
                "inbound traffic ignored"
            );
            return;
        }
        if let Some(jobs) = &self.dispatch_tx {
            if jobs.send(job).await.is_err() {
                warn!("dispatch worker is gone; inbound job discarded");
            }
        }
    }

    async fn handle_control(&mut self, signal: ControlSignal) -> Option<i32> {
        match signal {
            ControlSignal::Degraded { reason_code } => {
                if self.state() == LifecycleState::Running {
                    warn!(reason_code = %reason_code, "entering degraded mode");
                    let _ = self.transition(LifecycleState::Degraded);
                }
                None
            }
            ControlSignal::Healthy => {
                if self.state() == LifecycleState::Degraded {
                    info!("health restored");
                    let _ = self.transition(LifecycleState::Running);
                }
                None
            }
            ControlSignal::Fault { detail } => {
                self.handle_error(LifecycleError::Fault(detail)).await
            }
        }
    }

    /// Routes a runtime error through the healer and acts on its verdict.
    async fn handle_error(&mut self, error: LifecycleError) -> Option<i32> {
        match self.healer.handle_error(&error, self.now_unix_ms()) {
            ErrorDisposition::Shutdown => Some(self.emergency_shutdown().await),
            ErrorDisposition::Recover(decision) => self.schedule_reconnect(decision).await,
            ErrorDisposition::Degrade => {
                if self.state() == LifecycleState::Running {
                    let _ = self.transition(LifecycleState::Degraded);
                }
                None
            }
            ErrorDisposition::Logged => None,
        }
    }

    async fn schedule_reconnect(&mut self, decision: RecoveryDecision) -> Option<i32> {
        match decision {
            RecoveryDecision::Retry { attempt, delay } => {
                if let Err(error) = self.transition(LifecycleState::Recovering) {
                    error!(error = %error, "cannot enter recovery");
                    return Some(self.emergency_shutdown().await);
                }
                self.release_transport().await;
                self.reconnect_at = Some(Instant::now() + delay);
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnection scheduled"
                );
                None
            }
            RecoveryDecision::Exhausted { attempts } => {
                error!(attempts, "recovery exhausted; shutting down");
                Some(self.emergency_shutdown().await)
            }
        }
    }

    async fn reconnect(&mut self) -> Option<i32> {
        self.reconnect_at = None;
        if let Err(error) = self.transition(LifecycleState::ConnectingTransport) {
            error!(error = %error, "cannot reconnect from current state");
            return Some(self.emergency_shutdown().await);
        }
        match self.connect_transport().await {
            Ok(()) => {
                self.healer.record_success();
                if self.transition(LifecycleState::Running).is_err() {
                    return Some(self.emergency_shutdown().await);
                }
                None
            }
            Err(error) => self.handle_error(error).await,
        }
    }

    async fn drain_dispatch(&mut self, grace: Duration) {
        self.dispatch_tx = None;
        if let Some(mut worker) = self.dispatch_worker.take() {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                worker.abort();
                warn!(
                    reason_code = REASON_TEARDOWN_STEP_FAILED,
                    step = "dispatch_drain",
                    "in-flight dispatch exceeded shutdown grace"
                );
            }
        }
    }

    /// Idempotent. Lets in-flight work finish within the grace period, says
    /// goodbye, then tears down in reverse startup order. Returns exit code 0
    /// unless an emergency shutdown already ran.
    pub async fn graceful_shutdown(&mut self) -> i32 {
        if let Some(kind) = self.shutdown {
            return kind.exit_code();
        }
        self.shutdown = Some(ShutdownKind::Graceful);
        info!(reason_code = REASON_GRACEFUL_SHUTDOWN, "graceful shutdown initiated");
        let _ = self.transition(LifecycleState::ShuttingDown);
        let grace = self.config.shutdown_grace;

        if let Some(mut background) = self.background.take() {
            background.shutdown(grace).await;
        }
        self.drain_dispatch(grace).await;
        self.reconnect_at = None;

        if self.transport.get().is_some() {
            self.send_to_operator(goodbye_text(&self.config.bot_name, self.uptime()))
                .await;
        }
        self.release_transport().await;

        if self.progress.storage {
            if let Err(error) = self.collaborators.storage.backup().await {
                warn!(reason_code = REASON_TEARDOWN_STEP_FAILED, step = "storage_backup", error = %error, "shutdown backup failed");
            }
            if let Err(error) = self.collaborators.storage.disconnect().await {
                warn!(reason_code = REASON_TEARDOWN_STEP_FAILED, step = "storage_disconnect", error = %error, "storage disconnect failed");
            }
        }
        if let Some(mut health_monitor) = self.health_monitor.take() {
            health_monitor.shutdown(grace).await;
        }

        let _ = self.transition(LifecycleState::Terminated);
        info!(uptime = %format_uptime(self.uptime()), "shutdown completed");
        ShutdownKind::Graceful.exit_code()
    }

    /// Idempotent. Best-effort teardown without waiting for in-flight work.
    /// Returns exit code 1 unless a graceful shutdown already ran.
    pub async fn emergency_shutdown(&mut self) -> i32 {
        if let Some(kind) = self.shutdown {
            return kind.exit_code();
        }
        self.shutdown = Some(ShutdownKind::Emergency);
        warn!(
            reason_code = REASON_EMERGENCY_SHUTDOWN,
            state = self.state().as_str(),
            security_ready = self.progress.security,
            storage_connected = self.progress.storage,
            plugins_loaded = self.progress.plugins,
            ai_ready = self.progress.ai,
            "emergency shutdown initiated"
        );
        let _ = self.transition(LifecycleState::ShuttingDown);

        if let Some(mut background) = self.background.take() {
            background.abort();
        }
        self.dispatch_tx = None;
        if let Some(worker) = self.dispatch_worker.take() {
            worker.abort();
        }
        self.reconnect_at = None;
        self.release_transport().await;
        if self.progress.storage {
            if let Err(error) = self.collaborators.storage.disconnect().await {
                warn!(reason_code = REASON_TEARDOWN_STEP_FAILED, step = "storage_disconnect", error = %error, "storage disconnect failed");
            }
        }
        if let Some(mut health_monitor) = self.health_monitor.take() {
            health_monitor.abort();
        }

        let _ = self.transition(LifecycleState::Terminated);
        warn!("emergency shutdown completed");
        ShutdownKind::Emergency.exit_code()
    }
}
