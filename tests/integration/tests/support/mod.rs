#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_agent::{
    Collaborators, ControlSender, DispatchRecord, FaultReporter, LifecycleController,
    LifecycleState,
};
use relay_cli::BotConfig;
use relay_contract::{
    CallJournal, FixedMemoryProbe, InMemoryStorage, InboundMessage, LoopbackConnector,
    LoopbackTransport, ScriptedAiResponder, ScriptedPlugins, StaticSecurity, StaticUpdateChecker,
    TranscriptVoiceProcessor, TransportEvent, UpdateStatus,
};
use relay_core::ManualClock;
use relay_gate::RiskGate;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

pub const OPERATOR: &str = "operator@relay";
pub const START_UNIX_MS: u64 = 1_700_000_000_000;
pub const DAY: Duration = Duration::from_secs(86_400);

pub fn base_config() -> BotConfig {
    BotConfig {
        operator: OPERATOR.to_string(),
        session_id: "relay_session_test".to_string(),
        secret_key: "integration-secret-key".to_string(),
        backup_interval: DAY,
        update_interval: DAY,
        health_interval: DAY,
        sweep_interval: DAY,
        ..BotConfig::default()
    }
}

pub struct Harness {
    pub journal: CallJournal,
    pub connector: Arc<LoopbackConnector>,
    pub plugins: Arc<ScriptedPlugins>,
    pub ai: Arc<ScriptedAiResponder>,
    pub memory: Arc<FixedMemoryProbe>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_plan(Vec::new())
    }

    pub fn with_plan(plan: Vec<Option<String>>) -> Self {
        let journal = CallJournal::default();
        Self {
            connector: Arc::new(LoopbackConnector::with_plan(journal.clone(), plan)),
            plugins: Arc::new(
                ScriptedPlugins::new(journal.clone())
                    .reply("ping", "pong")
                    .reply("ban", "banned")
                    .fail("deploy", "pipeline offline"),
            ),
            ai: Arc::new(ScriptedAiResponder::new(journal.clone(), Some("hello there"))),
            memory: Arc::new(FixedMemoryProbe::new(4 * 1024 * 1024)),
            clock: Arc::new(ManualClock::new(START_UNIX_MS)),
            journal,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            security: Arc::new(StaticSecurity::new(self.journal.clone())),
            storage: Arc::new(InMemoryStorage::new(self.journal.clone())),
            plugins: self.plugins.clone(),
            ai: self.ai.clone(),
            voice: Arc::new(TranscriptVoiceProcessor),
            updates: Arc::new(StaticUpdateChecker::new(
                self.journal.clone(),
                UpdateStatus::UpToDate {
                    current: "0.1.0".to_string(),
                },
            )),
            memory: self.memory.clone(),
            connector: self.connector.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn transport(&self) -> Arc<LoopbackTransport> {
        self.connector.latest().expect("a transport was built")
    }
}

pub struct RunningBot {
    pub stop: oneshot::Sender<()>,
    pub handle: JoinHandle<i32>,
    pub states: watch::Receiver<LifecycleState>,
    pub records: broadcast::Receiver<DispatchRecord>,
    pub gate: Arc<RiskGate>,
    pub control: ControlSender,
    pub faults: FaultReporter,
}

impl RunningBot {
    pub async fn wait_for(&mut self, target: LifecycleState) {
        self.states
            .wait_for(|state| *state == target)
            .await
            .expect("controller stopped before reaching state");
    }

    pub async fn next_record(&mut self) -> DispatchRecord {
        self.records.recv().await.expect("dispatch record")
    }

    pub async fn stop(self) -> i32 {
        let _ = self.stop.send(());
        self.handle.await.expect("controller task")
    }
}

/// Spawns the full lifecycle and returns once the bot is running.
pub async fn launch(config: BotConfig, harness: &Harness) -> RunningBot {
    let mut bot = spawn(config, harness);
    bot.wait_for(LifecycleState::Running).await;
    bot
}

pub fn spawn(config: BotConfig, harness: &Harness) -> RunningBot {
    let mut controller = LifecycleController::new(config, harness.collaborators());
    let states = controller.subscribe_state();
    let records = controller.dispatcher().subscribe();
    let gate = Arc::clone(controller.gate());
    let control = controller.control_sender();
    let faults = controller.fault_reporter();
    let (stop, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        controller
            .run(async move {
                let _ = stop_rx.await;
            })
            .await
    });
    RunningBot {
        stop,
        handle,
        states,
        records,
        gate,
        control,
        faults,
    }
}

pub async fn say(harness: &Harness, from: &str, body: &str) {
    let delivered = harness
        .transport()
        .emit(TransportEvent::Message(InboundMessage::new(from, body)))
        .await;
    assert!(delivered, "transport event channel closed");
}
