//! Deterministic in-memory collaborators.
//!
//! Every collaborator records its calls into a shared [`CallJournal`] so the
//! ordering of startup and teardown side effects can be asserted. Failures are
//! injected per operation through builder methods.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::collaborators::{
    AiResponder, CommandInvocation, CommandReply, MemoryProbe, PersistentStorage, PluginHost,
    SecurityProvider, UpdateChecker, UpdateStatus, VoiceCommandProcessor,
};
use crate::errors::{
    CollaboratorError, CommandExecutionError, PluginLoadError, SecurityCheckError,
    SecurityInitError, SendError, StorageError, StorageOperation, TransportError,
};
use crate::transport::{
    ConnectionStats, InboundMessage, MessagingTransport, OutboundPayload, TransportConnector,
    TransportEvent, TransportEventSender, VoiceMessage,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default)]
/// Ordered log of collaborator calls shared between test doubles.
pub struct CallJournal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallJournal {
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|recorded| recorded.as_str() == entry)
            .count()
    }
}

#[derive(Debug, Clone, Default)]
/// Security collaborator with optional injected failures.
pub struct StaticSecurity {
    journal: CallJournal,
    init_failure: Option<String>,
    check_failure: Option<String>,
}

impl StaticSecurity {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn failing_initialize(mut self, detail: impl Into<String>) -> Self {
        self.init_failure = Some(detail.into());
        self
    }

    pub fn failing_check(mut self, detail: impl Into<String>) -> Self {
        self.check_failure = Some(detail.into());
        self
    }
}

#[async_trait]
impl SecurityProvider for StaticSecurity {
    async fn initialize(&self) -> Result<(), SecurityInitError> {
        self.journal.record("security.initialize");
        match &self.init_failure {
            Some(detail) => Err(SecurityInitError(detail.clone())),
            None => Ok(()),
        }
    }

    async fn pre_launch_check(&self) -> Result<(), SecurityCheckError> {
        self.journal.record("security.pre_launch_check");
        match &self.check_failure {
            Some(detail) => Err(SecurityCheckError(detail.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
/// Storage collaborator that only counts calls.
pub struct InMemoryStorage {
    journal: CallJournal,
    failures: HashMap<&'static str, String>,
    backups: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            journal,
            failures: HashMap::new(),
            backups: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, operation: StorageOperation, detail: impl Into<String>) -> Self {
        self.failures.insert(operation.as_str(), detail.into());
        self
    }

    pub fn backup_count(&self) -> usize {
        self.backups.load(Ordering::SeqCst)
    }

    fn run(&self, operation: StorageOperation) -> Result<(), StorageError> {
        self.journal
            .record(format!("storage.{}", operation.as_str()));
        match self.failures.get(operation.as_str()) {
            Some(detail) => Err(StorageError::new(operation, detail.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PersistentStorage for InMemoryStorage {
    async fn connect(&self) -> Result<(), StorageError> {
        self.run(StorageOperation::Connect)
    }

    async fn backup(&self) -> Result<(), StorageError> {
        self.run(StorageOperation::Backup)?;
        self.backups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.run(StorageOperation::Disconnect)
    }
}

#[derive(Debug, Default)]
/// Transport double that keeps sent payloads and lets callers inject events.
pub struct LoopbackTransport {
    journal: CallJournal,
    init_failure: Option<String>,
    events: Mutex<Option<TransportEventSender>>,
    sent: Mutex<Vec<(String, OutboundPayload)>>,
    failing_recipients: Mutex<HashSet<String>>,
    stats: Mutex<ConnectionStats>,
}

impl LoopbackTransport {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn failing_initialize(journal: CallJournal, detail: impl Into<String>) -> Self {
        Self {
            journal,
            init_failure: Some(detail.into()),
            ..Self::default()
        }
    }

    /// Publishes an event as if it came from the network. Returns false once the
    /// receiving side is gone or the transport was never initialized.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let sender = lock(&self.events).clone();
        let Some(sender) = sender else {
            return false;
        };
        if let TransportEvent::Message(_) | TransportEvent::VoiceMessage(_) = &event {
            let mut stats = lock(&self.stats);
            stats.messages_received = stats.messages_received.saturating_add(1);
        }
        if let TransportEvent::Disconnected { .. } = &event {
            lock(&self.stats).connected = false;
        }
        sender.send(event).await.is_ok()
    }

    pub fn fail_sends_to(&self, identity: impl Into<String>) {
        lock(&self.failing_recipients).insert(identity.into());
    }

    pub fn sent_messages(&self) -> Vec<(String, OutboundPayload)> {
        lock(&self.sent).clone()
    }

    pub fn sent_texts_to(&self, identity: &str) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .filter(|(recipient, _)| recipient == identity)
            .map(|(_, payload)| payload.text.clone())
            .collect()
    }
}

#[async_trait]
impl MessagingTransport for LoopbackTransport {
    async fn initialize(&self, events: TransportEventSender) -> Result<(), TransportError> {
        self.journal.record("transport.initialize");
        if let Some(detail) = &self.init_failure {
            return Err(TransportError::Initialization(detail.clone()));
        }
        *lock(&self.events) = Some(events.clone());
        lock(&self.stats).connected = true;
        let _ = events.send(TransportEvent::Connected).await;
        Ok(())
    }

    async fn send_message(
        &self,
        identity: &str,
        payload: OutboundPayload,
    ) -> Result<(), SendError> {
        if lock(&self.failing_recipients).contains(identity) {
            let mut stats = lock(&self.stats);
            stats.send_failures = stats.send_failures.saturating_add(1);
            return Err(SendError::new(identity, "recipient unreachable"));
        }
        lock(&self.sent).push((identity.to_string(), payload));
        let mut stats = lock(&self.stats);
        stats.messages_sent = stats.messages_sent.saturating_add(1);
        Ok(())
    }

    async fn clean_shutdown(&self) -> Result<(), TransportError> {
        self.journal.record("transport.clean_shutdown");
        lock(&self.events).take();
        lock(&self.stats).connected = false;
        Ok(())
    }

    fn connection_stats(&self) -> ConnectionStats {
        lock(&self.stats).clone()
    }
}

#[derive(Debug, Default)]
/// Connector that hands out loopback transports following a scripted plan.
///
/// Each `build` pops the next planned outcome: `None` connects, `Some(detail)`
/// fails initialization. An exhausted plan connects.
pub struct LoopbackConnector {
    journal: CallJournal,
    plan: Mutex<VecDeque<Option<String>>>,
    built: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl LoopbackConnector {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn with_plan(journal: CallJournal, plan: Vec<Option<String>>) -> Self {
        Self {
            journal,
            plan: Mutex::new(plan.into_iter().collect()),
            built: Mutex::new(Vec::new()),
        }
    }

    /// Appends outcomes for future builds.
    pub fn push_plan(&self, outcome: Option<String>) {
        lock(&self.plan).push_back(outcome);
    }

    pub fn latest(&self) -> Option<Arc<LoopbackTransport>> {
        lock(&self.built).last().cloned()
    }

    pub fn build_count(&self) -> usize {
        lock(&self.built).len()
    }
}

impl TransportConnector for LoopbackConnector {
    fn build(&self) -> Arc<dyn MessagingTransport> {
        let outcome = lock(&self.plan).pop_front().flatten();
        let transport = Arc::new(match outcome {
            Some(detail) => LoopbackTransport::failing_initialize(self.journal.clone(), detail),
            None => LoopbackTransport::new(self.journal.clone()),
        });
        lock(&self.built).push(Arc::clone(&transport));
        transport
    }
}

#[derive(Debug, Default)]
/// Plugin host with a fixed reply table.
pub struct ScriptedPlugins {
    journal: CallJournal,
    replies: HashMap<String, Result<CommandReply, String>>,
    load_failure: Option<String>,
    executed: Mutex<Vec<CommandInvocation>>,
}

impl ScriptedPlugins {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn reply(mut self, command: &str, text: &str) -> Self {
        self.replies
            .insert(command.to_string(), Ok(CommandReply::text(text)));
        self
    }

    pub fn fail(mut self, command: &str, detail: &str) -> Self {
        self.replies
            .insert(command.to_string(), Err(detail.to_string()));
        self
    }

    pub fn failing_load(mut self, detail: impl Into<String>) -> Self {
        self.load_failure = Some(detail.into());
        self
    }

    pub fn executed(&self) -> Vec<CommandInvocation> {
        lock(&self.executed).clone()
    }
}

#[async_trait]
impl PluginHost for ScriptedPlugins {
    async fn load_plugins(&self) -> Result<usize, PluginLoadError> {
        self.journal.record("plugins.load");
        match &self.load_failure {
            Some(detail) => Err(PluginLoadError(detail.clone())),
            None => Ok(self.replies.len()),
        }
    }

    async fn execute_command(
        &self,
        invocation: &CommandInvocation,
    ) -> Result<CommandReply, CommandExecutionError> {
        lock(&self.executed).push(invocation.clone());
        match self.replies.get(&invocation.name) {
            Some(Ok(reply)) => Ok(reply.clone()),
            Some(Err(detail)) => Err(CommandExecutionError::new(&invocation.name, detail)),
            None => Err(CommandExecutionError::new(
                &invocation.name,
                "unknown command",
            )),
        }
    }
}

#[derive(Debug, Default)]
/// AI responder that answers every eligible message with a fixed reply.
pub struct ScriptedAiResponder {
    journal: CallJournal,
    reply: Option<String>,
    responded: AtomicUsize,
}

impl ScriptedAiResponder {
    pub fn new(journal: CallJournal, reply: Option<&str>) -> Self {
        Self {
            journal,
            reply: reply.map(str::to_string),
            responded: AtomicUsize::new(0),
        }
    }

    pub fn responded(&self) -> usize {
        self.responded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiResponder for ScriptedAiResponder {
    async fn initialize(&self) -> Result<(), CollaboratorError> {
        self.journal.record("ai.initialize");
        Ok(())
    }

    fn should_respond(&self, message: &InboundMessage) -> bool {
        !message.body.trim().is_empty()
    }

    async fn generate_response(
        &self,
        _message: &InboundMessage,
    ) -> Result<Option<String>, CollaboratorError> {
        self.responded.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

#[derive(Debug, Clone, Default)]
/// Voice processor that treats the audio bytes as an utf-8 transcript.
pub struct TranscriptVoiceProcessor;

#[async_trait]
impl VoiceCommandProcessor for TranscriptVoiceProcessor {
    async fn process_voice_command(
        &self,
        message: &VoiceMessage,
    ) -> Result<Option<String>, CollaboratorError> {
        let transcript = String::from_utf8(message.audio.clone()).map_err(|_| {
            CollaboratorError::new("voice", "audio bytes must decode as utf-8 text")
        })?;
        let trimmed = transcript.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!("heard: {trimmed}")))
    }
}

#[derive(Debug)]
/// Update checker returning a fixed status.
pub struct StaticUpdateChecker {
    journal: CallJournal,
    status: UpdateStatus,
}

impl StaticUpdateChecker {
    pub fn new(journal: CallJournal, status: UpdateStatus) -> Self {
        Self { journal, status }
    }
}

#[async_trait]
impl UpdateChecker for StaticUpdateChecker {
    async fn check_for_updates(&self) -> Result<UpdateStatus, CollaboratorError> {
        self.journal.record("updates.check");
        Ok(self.status.clone())
    }
}

#[derive(Debug, Default)]
/// Memory probe whose reading is set by the caller.
pub struct FixedMemoryProbe {
    used_bytes: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(used_bytes: u64) -> Self {
        Self {
            used_bytes: AtomicU64::new(used_bytes),
        }
    }

    pub fn set(&self, used_bytes: u64) {
        self.used_bytes.store(used_bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn used_bytes(&self) -> Option<u64> {
        Some(self.used_bytes.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::transport_event_channel;

    #[tokio::test]
    async fn functional_loopback_transport_publishes_connected_then_injected_events() {
        let journal = CallJournal::default();
        let transport = LoopbackTransport::new(journal.clone());
        let (events_tx, mut events_rx) = transport_event_channel();
        transport.initialize(events_tx).await.expect("initialize");
        assert!(
            transport
                .emit(TransportEvent::Message(InboundMessage::new("u1", "hi")))
                .await
        );

        assert_eq!(events_rx.recv().await, Some(TransportEvent::Connected));
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::Message(InboundMessage::new("u1", "hi")))
        );
        assert_eq!(transport.connection_stats().messages_received, 1);
        assert_eq!(journal.entries(), vec!["transport.initialize"]);
    }

    #[tokio::test]
    async fn unit_loopback_connector_follows_plan_then_connects() {
        let journal = CallJournal::default();
        let connector =
            LoopbackConnector::with_plan(journal, vec![Some("refused".to_string()), None]);
        let (events_tx, _events_rx) = transport_event_channel();

        let first = connector.build();
        assert!(first.initialize(events_tx.clone()).await.is_err());
        let second = connector.build();
        assert!(second.initialize(events_tx.clone()).await.is_ok());
        let third = connector.build();
        assert!(third.initialize(events_tx).await.is_ok());
        assert_eq!(connector.build_count(), 3);
    }

    #[tokio::test]
    async fn unit_loopback_transport_reports_send_failures() {
        let transport = LoopbackTransport::new(CallJournal::default());
        transport.fail_sends_to("blocked");
        let error = transport
            .send_message("blocked", OutboundPayload::text("hello"))
            .await
            .expect_err("send must fail");
        assert_eq!(error.identity, "blocked");
        assert!(transport
            .send_message("ok", OutboundPayload::text("hello"))
            .await
            .is_ok());
        let stats = transport.connection_stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.send_failures, 1);
    }

    #[tokio::test]
    async fn unit_transcript_voice_processor_rejects_non_utf8_audio() {
        let processor = TranscriptVoiceProcessor;
        let message = VoiceMessage {
            id: "v1".to_string(),
            from: "u1".to_string(),
            mime_type: "audio/ogg".to_string(),
            audio: vec![0xff, 0xfe],
        };
        assert!(processor.process_voice_command(&message).await.is_err());
    }
}
