use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::{SendError, TransportError};

/// Queue depth for transport events awaiting the controller.
pub const TRANSPORT_EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Text message received from a remote identity.
pub struct InboundMessage {
    #[serde(default)]
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub timestamp_unix_ms: u64,
}

impl InboundMessage {
    pub fn new(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            from: from.into(),
            body: body.into(),
            timestamp_unix_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Voice note received from a remote identity.
pub struct VoiceMessage {
    #[serde(default)]
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub audio: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Payload handed to the transport for delivery.
pub struct OutboundPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<String>,
}

impl OutboundPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            watermark: None,
        }
    }

    pub fn with_watermark(mut self, watermark: impl Into<String>) -> Self {
        self.watermark = Some(watermark.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Connection counters reported by the transport.
pub struct ConnectionStats {
    pub connected: bool,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
}

/// Events emitted by the transport. Replaces callback registration with a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Message(InboundMessage),
    VoiceMessage(VoiceMessage),
    Error(TransportError),
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Message(_) => "message",
            Self::VoiceMessage(_) => "voice_message",
            Self::Error(_) => "error",
        }
    }
}

pub type TransportEventSender = mpsc::Sender<TransportEvent>;
pub type TransportEventReceiver = mpsc::Receiver<TransportEvent>;

/// Creates the bounded event channel a transport publishes into.
pub fn transport_event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::channel(TRANSPORT_EVENT_QUEUE_CAPACITY)
}

#[async_trait]
/// Trait contract for the chat-network client.
pub trait MessagingTransport: Send + Sync {
    /// Connects and starts publishing events into `events`.
    async fn initialize(&self, events: TransportEventSender) -> Result<(), TransportError>;

    async fn send_message(&self, identity: &str, payload: OutboundPayload)
        -> Result<(), SendError>;

    async fn clean_shutdown(&self) -> Result<(), TransportError>;

    fn connection_stats(&self) -> ConnectionStats;
}

/// Builds a fresh transport client. Called on start and on every reconnection.
pub trait TransportConnector: Send + Sync {
    fn build(&self) -> Arc<dyn MessagingTransport>;
}
