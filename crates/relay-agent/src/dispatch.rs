use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use relay_contract::{
    AiResponder, CommandInvocation, InboundMessage, MessagingTransport, OutboundPayload,
    PluginHost, VoiceCommandProcessor, VoiceMessage,
};
use relay_core::Clock;
use relay_gate::{CommandAdmission, MessageAdmission, RiskAssessment, RiskGate};
use relay_runtime::contain_panics;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DISPATCH_QUEUE_CAPACITY: usize = 256;
const OUTCOME_BROADCAST_CAPACITY: usize = 256;

pub const REASON_SEND_FAILED: &str = "send_failed";
pub const REASON_SEND_NO_TRANSPORT: &str = "send_no_transport";
pub const REASON_COMMAND_EXECUTION_FAILED: &str = "command_execution_failed";
pub const REASON_AI_RESPONSE_FAILED: &str = "ai_response_failed";
pub const REASON_VOICE_COMMAND_FAILED: &str = "voice_command_failed";
pub const REASON_DISPATCH_PANICKED: &str = "dispatch_job_panicked";

pub const DISPATCH_PANIC_SCOPE: &str = "dispatch";

pub const COOLDOWN_NOTICE: &str = "Please wait before using this command again.";
pub const COMMAND_FAILURE_NOTICE: &str = "Command failed. Please try again later.";
pub const VOICE_FAILURE_NOTICE: &str = "Voice command could not be processed.";

/// Holds the transport currently in use. Replaced on every reconnection.
#[derive(Default)]
pub struct TransportSlot {
    current: RwLock<Option<Arc<dyn MessagingTransport>>>,
}

impl TransportSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<dyn MessagingTransport>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(
        &self,
        transport: Option<Arc<dyn MessagingTransport>>,
    ) -> Option<Arc<dyn MessagingTransport>> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *current, transport)
    }

    pub fn take(&self) -> Option<Arc<dyn MessagingTransport>> {
        self.replace(None)
    }

    /// Sends through the current transport. Failures are logged, never raised.
    pub async fn send_logged(&self, identity: &str, payload: OutboundPayload) -> bool {
        let Some(transport) = self.get() else {
            warn!(reason_code = REASON_SEND_NO_TRANSPORT, identity, "no transport available for reply");
            return false;
        };
        match transport.send_message(identity, payload).await {
            Ok(()) => true,
            Err(error) => {
                warn!(reason_code = REASON_SEND_FAILED, identity, error = %error, "reply delivery failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Work item handed from the controller to the dispatch worker.
pub enum DispatchJob {
    Message(InboundMessage),
    Voice(VoiceMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
/// Terminal branch reached by one inbound message.
pub enum DispatchOutcome {
    Dropped { risk_level: u8 },
    Ignored,
    AiResponded,
    AiSkipped,
    CooldownBlocked,
    RiskBlocked,
    Executed { success: bool },
    VoiceHandled,
    VoiceDisabled,
}

impl DispatchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dropped { .. } => "dropped",
            Self::Ignored => "ignored",
            Self::AiResponded => "ai_responded",
            Self::AiSkipped => "ai_skipped",
            Self::CooldownBlocked => "cooldown_blocked",
            Self::RiskBlocked => "risk_blocked",
            Self::Executed { success: true } => "executed_success",
            Self::Executed { success: false } => "executed_failure",
            Self::VoiceHandled => "voice_handled",
            Self::VoiceDisabled => "voice_disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `DispatchRecord` used across Relay components.
pub struct DispatchRecord {
    pub message_id: String,
    pub identity: String,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Command name and arguments split out of a prefixed message body.
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
}

/// Strips `prefix`, lowercases the first token as the command name, and keeps the
/// remaining tokens as arguments. Returns `None` for non-commands and a bare prefix.
pub fn parse_command(prefix: &str, body: &str) -> Option<ParsedCommand> {
    if prefix.is_empty() {
        return None;
    }
    let rest = body.strip_prefix(prefix)?;
    let mut tokens = rest.split_whitespace();
    let name = tokens.next()?.to_lowercase();
    Some(ParsedCommand {
        name,
        args: tokens.map(str::to_string).collect(),
    })
}

pub fn risk_warning_text(assessment: &RiskAssessment) -> String {
    format!(
        "Command risk warning\nCommand: {}\nRisk level: {}/5\nReason: {}\nThe command was not executed.",
        assessment.command, assessment.risk_level, assessment.reason
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Feature switches for the message path.
pub struct DispatchSettings {
    pub prefix: String,
    pub bot_name: String,
    pub ai_responder: bool,
    pub voice_mode: bool,
}

/// Runs the per-message path: risk gate, session activity, then command, AI, or voice.
pub struct MessageDispatcher {
    settings: DispatchSettings,
    gate: Arc<RiskGate>,
    transport: Arc<TransportSlot>,
    plugins: Arc<dyn PluginHost>,
    ai: Arc<dyn AiResponder>,
    voice: Arc<dyn VoiceCommandProcessor>,
    clock: Arc<dyn Clock>,
    outcomes: broadcast::Sender<DispatchRecord>,
    outcome_counts: Mutex<BTreeMap<&'static str, u64>>,
}

impl MessageDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: DispatchSettings,
        gate: Arc<RiskGate>,
        transport: Arc<TransportSlot>,
        plugins: Arc<dyn PluginHost>,
        ai: Arc<dyn AiResponder>,
        voice: Arc<dyn VoiceCommandProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_BROADCAST_CAPACITY);
        Self {
            settings,
            gate,
            transport,
            plugins,
            ai,
            voice,
            clock,
            outcomes,
            outcome_counts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn gate(&self) -> &Arc<RiskGate> {
        &self.gate
    }

    /// Receives one record per dispatched job, in processing order.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchRecord> {
        self.outcomes.subscribe()
    }

    pub fn outcome_counts(&self) -> BTreeMap<&'static str, u64> {
        self.outcome_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, message_id: &str, identity: &str, outcome: DispatchOutcome) {
        {
            let mut counts = self
                .outcome_counts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let count = counts.entry(outcome.as_str()).or_insert(0);
            *count = count.saturating_add(1);
        }
        debug!(
            message_id,
            identity,
            outcome = outcome.as_str(),
            "dispatch completed"
        );
        let _ = self.outcomes.send(DispatchRecord {
            message_id: message_id.to_string(),
            identity: identity.to_string(),
            outcome,
        });
    }

    pub async fn dispatch(&self, job: DispatchJob) -> DispatchOutcome {
        match job {
            DispatchJob::Message(message) => {
                let outcome = self.handle_message(&message).await;
                self.publish(&message.id, &message.from, outcome);
                outcome
            }
            DispatchJob::Voice(voice) => {
                let outcome = self.handle_voice(&voice).await;
                self.publish(&voice.id, &voice.from, outcome);
                outcome
            }
        }
    }

    pub async fn handle_message(&self, message: &InboundMessage) -> DispatchOutcome {
        let now_unix_ms = self.clock.now_unix_ms();
        if let MessageAdmission::Drop { risk_level, .. } = self.gate.admit_message(message) {
            return DispatchOutcome::Dropped { risk_level };
        }
        self.gate
            .sessions()
            .record_activity(&message.from, now_unix_ms);

        if let Some(command) = parse_command(&self.settings.prefix, &message.body) {
            return self.handle_command(message, command, now_unix_ms).await;
        }
        if !self.settings.ai_responder || !self.ai.should_respond(message) {
            return DispatchOutcome::Ignored;
        }
        match self.ai.generate_response(message).await {
            Ok(Some(text)) => {
                let payload = OutboundPayload::text(text).with_watermark(&self.settings.bot_name);
                self.transport.send_logged(&message.from, payload).await;
                DispatchOutcome::AiResponded
            }
            Ok(None) => DispatchOutcome::AiSkipped,
            Err(error) => {
                warn!(
                    reason_code = REASON_AI_RESPONSE_FAILED,
                    identity = %message.from,
                    error = %error,
                    "ai response generation failed"
                );
                DispatchOutcome::AiSkipped
            }
        }
    }

    async fn handle_command(
        &self,
        message: &InboundMessage,
        command: ParsedCommand,
        now_unix_ms: u64,
    ) -> DispatchOutcome {
        let identity = message.from.as_str();
        match self.gate.admit_command(identity, &command.name, now_unix_ms) {
            CommandAdmission::RiskBlocked { assessment } => {
                self.transport
                    .send_logged(identity, OutboundPayload::text(risk_warning_text(&assessment)))
                    .await;
                DispatchOutcome::RiskBlocked
            }
            CommandAdmission::CooldownBlocked { .. } => {
                self.transport
                    .send_logged(identity, OutboundPayload::text(COOLDOWN_NOTICE))
                    .await;
                DispatchOutcome::CooldownBlocked
            }
            CommandAdmission::Allow { assessment } => {
                let invocation = CommandInvocation {
                    name: command.name,
                    args: command.args,
                    identity: identity.to_string(),
                    message: message.clone(),
                };
                match self.plugins.execute_command(&invocation).await {
                    Ok(reply) => {
                        self.gate.record_command_result(&invocation.name, true);
                        info!(
                            identity,
                            command = %invocation.name,
                            risk_level = assessment.risk_level,
                            "command executed"
                        );
                        if let Some(text) = reply.text {
                            self.transport
                                .send_logged(identity, OutboundPayload::text(text))
                                .await;
                        }
                        DispatchOutcome::Executed { success: true }
                    }
                    Err(error) => {
                        self.gate.record_command_result(&invocation.name, false);
                        warn!(
                            reason_code = REASON_COMMAND_EXECUTION_FAILED,
                            identity,
                            command = %invocation.name,
                            error = %error,
                            "command execution failed"
                        );
                        self.transport
                            .send_logged(identity, OutboundPayload::text(COMMAND_FAILURE_NOTICE))
                            .await;
                        DispatchOutcome::Executed { success: false }
                    }
                }
            }
        }
    }

    /// Settles a job whose handler panicked the way a failed handler would:
    /// commands count as failed executions, voice gets the failure notice.
    pub async fn fail_panicked(&self, job: &DispatchJob) -> DispatchOutcome {
        match job {
            DispatchJob::Message(message) => {
                let outcome = match parse_command(&self.settings.prefix, &message.body) {
                    Some(command) => {
                        self.gate.record_command_result(&command.name, false);
                        self.transport
                            .send_logged(&message.from, OutboundPayload::text(COMMAND_FAILURE_NOTICE))
                            .await;
                        DispatchOutcome::Executed { success: false }
                    }
                    None => DispatchOutcome::AiSkipped,
                };
                self.publish(&message.id, &message.from, outcome);
                outcome
            }
            DispatchJob::Voice(voice) => {
                self.transport
                    .send_logged(&voice.from, OutboundPayload::text(VOICE_FAILURE_NOTICE))
                    .await;
                let outcome = DispatchOutcome::VoiceHandled;
                self.publish(&voice.id, &voice.from, outcome);
                outcome
            }
        }
    }

    pub async fn handle_voice(&self, voice: &VoiceMessage) -> DispatchOutcome {
        if let MessageAdmission::Drop { risk_level, .. } =
            self.gate.admit_sender(&voice.from, &voice.id)
        {
            return DispatchOutcome::Dropped { risk_level };
        }
        if !self.settings.voice_mode {
            return DispatchOutcome::VoiceDisabled;
        }
        self.gate
            .sessions()
            .record_activity(&voice.from, self.clock.now_unix_ms());
        match self.voice.process_voice_command(voice).await {
            Ok(Some(text)) => {
                self.transport
                    .send_logged(&voice.from, OutboundPayload::text(text))
                    .await;
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    reason_code = REASON_VOICE_COMMAND_FAILED,
                    identity = %voice.from,
                    error = %error,
                    "voice command failed"
                );
                self.transport
                    .send_logged(&voice.from, OutboundPayload::text(VOICE_FAILURE_NOTICE))
                    .await;
            }
        }
        DispatchOutcome::VoiceHandled
    }
}

/// Creates the bounded job queue feeding the dispatch worker.
pub fn dispatch_channel() -> (mpsc::Sender<DispatchJob>, mpsc::Receiver<DispatchJob>) {
    mpsc::channel(DISPATCH_QUEUE_CAPACITY)
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn job_ids(job: &DispatchJob) -> (&str, &str) {
    match job {
        DispatchJob::Message(message) => (&message.id, &message.from),
        DispatchJob::Voice(voice) => (&voice.id, &voice.from),
    }
}

/// Single consumer, so jobs are handled one at a time in arrival order. Each
/// job runs in its own task; a panic fails that job only.
pub fn spawn_dispatch_worker(
    dispatcher: Arc<MessageDispatcher>,
    mut jobs: mpsc::Receiver<DispatchJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let handler = Arc::clone(&dispatcher);
            let attempt = job.clone();
            let mut run = AbortOnDrop(tokio::spawn(contain_panics(
                DISPATCH_PANIC_SCOPE,
                async move {
                    handler.dispatch(attempt).await;
                },
            )));
            match (&mut run.0).await {
                Ok(()) => {}
                Err(join_error) if join_error.is_panic() => {
                    let (message_id, identity) = job_ids(&job);
                    error!(
                        reason_code = REASON_DISPATCH_PANICKED,
                        message_id,
                        identity,
                        "dispatch handler panicked"
                    );
                    dispatcher.fail_panicked(&job).await;
                }
                Err(_) => {}
            }
        }
        debug!("dispatch worker drained");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use async_trait::async_trait;
    use relay_contract::{
        CallJournal, CommandExecutionError, CommandInvocation, CommandReply, LoopbackTransport,
        PluginHost, PluginLoadError, ScriptedAiResponder, ScriptedPlugins,
        TranscriptVoiceProcessor,
    };
    use relay_core::ManualClock;
    use relay_gate::{CommandCounters, CommandRiskTable, MessageRiskPolicy, RiskGateConfig};
    use relay_session::SessionStore;

    use super::*;

    struct Fixture {
        dispatcher: MessageDispatcher,
        transport: Arc<LoopbackTransport>,
        plugins: Arc<ScriptedPlugins>,
        clock: Arc<ManualClock>,
    }

    fn fixture(settings: DispatchSettings) -> Fixture {
        let journal = CallJournal::default();
        let transport = Arc::new(LoopbackTransport::new(journal.clone()));
        let slot = Arc::new(TransportSlot::new());
        slot.replace(Some(transport.clone()));
        let plugins = Arc::new(
            ScriptedPlugins::new(journal.clone())
                .reply("ping", "pong")
                .fail("explode", "stack trace with secrets"),
        );
        let clock = Arc::new(ManualClock::new(0));
        let gate = Arc::new(RiskGate::new(
            RiskGateConfig {
                command_table: CommandRiskTable::new(BTreeMap::from([(
                    "broadcast".to_string(),
                    5,
                )])),
                ..RiskGateConfig::default()
            },
            Arc::new(SessionStore::new()),
        ));
        let dispatcher = MessageDispatcher::new(
            settings,
            gate,
            slot,
            plugins.clone(),
            Arc::new(ScriptedAiResponder::new(journal, Some("ai says hi"))),
            Arc::new(TranscriptVoiceProcessor),
            clock.clone(),
        );
        Fixture {
            dispatcher,
            transport,
            plugins,
            clock,
        }
    }

    struct CrashingPlugins;

    #[async_trait]
    impl PluginHost for CrashingPlugins {
        async fn load_plugins(&self) -> Result<usize, PluginLoadError> {
            Ok(1)
        }

        async fn execute_command(
            &self,
            invocation: &CommandInvocation,
        ) -> Result<CommandReply, CommandExecutionError> {
            if invocation.name == "crash" {
                panic!("plugin state corrupted");
            }
            Ok(CommandReply::text("pong"))
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            prefix: "/".to_string(),
            bot_name: "relay-bot".to_string(),
            ai_responder: true,
            voice_mode: true,
        }
    }

    #[test]
    fn unit_parse_command_lowercases_name_and_splits_args() {
        assert_eq!(
            parse_command("/", "/PING  now please"),
            Some(ParsedCommand {
                name: "ping".to_string(),
                args: vec!["now".to_string(), "please".to_string()],
            })
        );
        assert_eq!(parse_command("/", "hello"), None);
        assert_eq!(parse_command("/", "/"), None);
        assert_eq!(parse_command("", "/ping"), None);
    }

    #[tokio::test]
    async fn functional_command_executes_and_replies_once() {
        let fixture = fixture(settings());
        let outcome = fixture
            .dispatcher
            .handle_message(&InboundMessage::new("u1", "/ping"))
            .await;

        assert_eq!(outcome, DispatchOutcome::Executed { success: true });
        assert_eq!(fixture.transport.sent_texts_to("u1"), vec!["pong"]);
        let session = fixture
            .dispatcher
            .gate()
            .sessions()
            .session("u1")
            .expect("session");
        assert_eq!(session.message_count, 1);
        assert_eq!(session.last_invocation("ping"), Some(0));
    }

    #[tokio::test]
    async fn functional_cooldown_scenario_blocks_then_allows() {
        let fixture = fixture(settings());
        let ping = InboundMessage::new("U1", "/ping");

        let first = fixture.dispatcher.handle_message(&ping).await;
        fixture.clock.set(1_000);
        let second = fixture.dispatcher.handle_message(&ping).await;
        fixture.clock.set(2_100);
        let third = fixture.dispatcher.handle_message(&ping).await;

        assert_eq!(first, DispatchOutcome::Executed { success: true });
        assert_eq!(second, DispatchOutcome::CooldownBlocked);
        assert_eq!(third, DispatchOutcome::Executed { success: true });
        assert_eq!(
            fixture.transport.sent_texts_to("U1"),
            vec!["pong", COOLDOWN_NOTICE, "pong"]
        );
        assert_eq!(fixture.plugins.executed().len(), 2);
    }

    #[tokio::test]
    async fn functional_risky_command_gets_warning_instead_of_execution() {
        let fixture = fixture(settings());
        let outcome = fixture
            .dispatcher
            .handle_message(&InboundMessage::new("u1", "/broadcast hello"))
            .await;

        assert_eq!(outcome, DispatchOutcome::RiskBlocked);
        assert!(fixture.plugins.executed().is_empty());
        let replies = fixture.transport.sent_texts_to("u1");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("Risk level: 5/5"));
    }

    #[tokio::test]
    async fn regression_command_failure_reply_does_not_leak_error_detail() {
        let fixture = fixture(settings());
        let outcome = fixture
            .dispatcher
            .handle_message(&InboundMessage::new("u1", "/explode"))
            .await;

        assert_eq!(outcome, DispatchOutcome::Executed { success: false });
        assert_eq!(
            fixture.transport.sent_texts_to("u1"),
            vec![COMMAND_FAILURE_NOTICE]
        );
        let counters = fixture
            .dispatcher
            .gate()
            .statistics()
            .get("explode")
            .expect("counters");
        assert_eq!((counters.total, counters.successful), (1, 0));
    }

    #[tokio::test]
    async fn functional_dropped_message_reaches_no_dispatch_and_no_session() {
        let fixture = fixture(settings());
        let outcome = fixture
            .dispatcher
            .handle_message(&InboundMessage::new(
                "u1",
                "/ping @a @b @c @d @e FREE!!!!!!!!!!!!!! www.example.com",
            ))
            .await;

        assert_eq!(outcome, DispatchOutcome::Dropped { risk_level: 4 });
        assert!(fixture.plugins.executed().is_empty());
        assert!(fixture.transport.sent_messages().is_empty());
        assert!(fixture.dispatcher.gate().sessions().session("u1").is_none());
        assert_eq!(fixture.dispatcher.gate().dropped_messages(), 1);
    }

    #[tokio::test]
    async fn unit_ai_reply_carries_watermark_and_respects_toggle() {
        let enabled = fixture(settings());
        let outcome = enabled
            .dispatcher
            .handle_message(&InboundMessage::new("u1", "hello bot"))
            .await;
        assert_eq!(outcome, DispatchOutcome::AiResponded);
        let sent = enabled.transport.sent_messages();
        assert_eq!(sent[0].1.watermark.as_deref(), Some("relay-bot"));

        let disabled = fixture(DispatchSettings {
            ai_responder: false,
            ..settings()
        });
        let outcome = disabled
            .dispatcher
            .handle_message(&InboundMessage::new("u1", "hello bot"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Ignored);
    }

    #[tokio::test]
    async fn unit_voice_path_respects_voice_mode() {
        let voice = VoiceMessage {
            id: "v1".to_string(),
            from: "u1".to_string(),
            mime_type: "audio/ogg".to_string(),
            audio: b"status".to_vec(),
        };
        let enabled = fixture(settings());
        assert_eq!(
            enabled.dispatcher.handle_voice(&voice).await,
            DispatchOutcome::VoiceHandled
        );
        assert_eq!(enabled.transport.sent_texts_to("u1"), vec!["heard: status"]);

        let disabled = fixture(DispatchSettings {
            voice_mode: false,
            ..settings()
        });
        assert_eq!(
            disabled.dispatcher.handle_voice(&voice).await,
            DispatchOutcome::VoiceDisabled
        );
        assert!(disabled.transport.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn integration_worker_processes_jobs_in_order_and_publishes_records() {
        let fixture = fixture(settings());
        let dispatcher = Arc::new(fixture.dispatcher);
        let mut records = dispatcher.subscribe();
        let (jobs_tx, jobs_rx) = dispatch_channel();
        let worker = spawn_dispatch_worker(Arc::clone(&dispatcher), jobs_rx);

        for (index, body) in ["/ping", "/ping", "hello"].iter().enumerate() {
            let mut message = InboundMessage::new("u1", *body);
            message.id = format!("m{index}");
            jobs_tx
                .send(DispatchJob::Message(message))
                .await
                .expect("queue job");
        }
        drop(jobs_tx);
        worker.await.expect("worker join");

        let mut outcomes = Vec::new();
        while let Ok(record) = records.try_recv() {
            outcomes.push((record.message_id, record.outcome));
        }
        assert_eq!(
            outcomes,
            vec![
                ("m0".to_string(), DispatchOutcome::Executed { success: true }),
                ("m1".to_string(), DispatchOutcome::CooldownBlocked),
                ("m2".to_string(), DispatchOutcome::AiResponded),
            ]
        );
        assert_eq!(dispatcher.outcome_counts().get("cooldown_blocked"), Some(&1));
    }

    #[tokio::test]
    async fn regression_blocked_voice_sender_is_dropped_counted_and_not_answered() {
        let journal = CallJournal::default();
        let transport = Arc::new(LoopbackTransport::new(journal.clone()));
        let slot = Arc::new(TransportSlot::new());
        slot.replace(Some(transport.clone()));
        let gate = Arc::new(RiskGate::new(
            RiskGateConfig {
                message_policy: MessageRiskPolicy {
                    blocked_identities: BTreeSet::from(["troll".to_string()]),
                    ..MessageRiskPolicy::default()
                },
                ..RiskGateConfig::default()
            },
            Arc::new(SessionStore::new()),
        ));
        let dispatcher = MessageDispatcher::new(
            settings(),
            gate,
            slot,
            Arc::new(ScriptedPlugins::new(journal.clone())),
            Arc::new(ScriptedAiResponder::new(journal, None)),
            Arc::new(TranscriptVoiceProcessor),
            Arc::new(ManualClock::new(0)),
        );
        let voice = VoiceMessage {
            id: "v9".to_string(),
            from: "troll".to_string(),
            mime_type: "audio/ogg".to_string(),
            audio: b"status".to_vec(),
        };

        assert_eq!(
            dispatcher.handle_voice(&voice).await,
            DispatchOutcome::Dropped {
                risk_level: relay_gate::MAX_RISK_LEVEL,
            }
        );
        assert_eq!(dispatcher.gate().dropped_messages(), 1);
        assert!(dispatcher.gate().sessions().session("troll").is_none());
        assert!(transport.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn regression_panicking_handler_fails_one_job_and_worker_keeps_serving() {
        let journal = CallJournal::default();
        let transport = Arc::new(LoopbackTransport::new(journal.clone()));
        let slot = Arc::new(TransportSlot::new());
        slot.replace(Some(transport.clone()));
        let gate = Arc::new(RiskGate::new(
            RiskGateConfig::default(),
            Arc::new(SessionStore::new()),
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            settings(),
            gate,
            slot,
            Arc::new(CrashingPlugins),
            Arc::new(ScriptedAiResponder::new(journal, None)),
            Arc::new(TranscriptVoiceProcessor),
            Arc::new(ManualClock::new(0)),
        ));
        let mut records = dispatcher.subscribe();
        let (jobs_tx, jobs_rx) = dispatch_channel();
        let worker = spawn_dispatch_worker(Arc::clone(&dispatcher), jobs_rx);

        for (id, body) in [("m0", "/crash"), ("m1", "/ping")] {
            let mut message = InboundMessage::new("u1", body);
            message.id = id.to_string();
            jobs_tx
                .send(DispatchJob::Message(message))
                .await
                .expect("queue job");
        }
        drop(jobs_tx);
        worker.await.expect("worker survives a panicking handler");

        let mut outcomes = Vec::new();
        while let Ok(record) = records.try_recv() {
            outcomes.push((record.message_id, record.outcome));
        }
        assert_eq!(
            outcomes,
            vec![
                ("m0".to_string(), DispatchOutcome::Executed { success: false }),
                ("m1".to_string(), DispatchOutcome::Executed { success: true }),
            ]
        );
        assert_eq!(
            transport.sent_texts_to("u1"),
            vec![COMMAND_FAILURE_NOTICE.to_string(), "pong".to_string()]
        );
        assert_eq!(
            dispatcher.gate().statistics().get("crash"),
            Some(CommandCounters {
                total: 1,
                successful: 0,
            })
        );
    }
}
