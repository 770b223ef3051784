use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{
    CollaboratorError, CommandExecutionError, PluginLoadError, SecurityCheckError,
    SecurityInitError, StorageError,
};
use crate::transport::{InboundMessage, VoiceMessage};

#[async_trait]
/// Trait contract for the credential/encryption store.
pub trait SecurityProvider: Send + Sync {
    async fn initialize(&self) -> Result<(), SecurityInitError>;

    async fn pre_launch_check(&self) -> Result<(), SecurityCheckError>;
}

#[async_trait]
/// Trait contract for durable storage owned outside the core.
pub trait PersistentStorage: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError>;

    async fn backup(&self) -> Result<(), StorageError>;

    async fn disconnect(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A parsed command about to be handed to the plugin host.
pub struct CommandInvocation {
    pub name: String,
    pub args: Vec<String>,
    pub identity: String,
    pub message: InboundMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Result of a command execution. `text` is sent back to the caller when present.
pub struct CommandReply {
    pub text: Option<String>,
}

impl CommandReply {
    pub fn silent() -> Self {
        Self { text: None }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

#[async_trait]
/// Trait contract for the plugin loader and command executor.
pub trait PluginHost: Send + Sync {
    /// Loads plugins and returns how many are available.
    async fn load_plugins(&self) -> Result<usize, PluginLoadError>;

    async fn execute_command(
        &self,
        invocation: &CommandInvocation,
    ) -> Result<CommandReply, CommandExecutionError>;
}

#[async_trait]
/// Trait contract for the AI response generator.
pub trait AiResponder: Send + Sync {
    async fn initialize(&self) -> Result<(), CollaboratorError>;

    fn should_respond(&self, message: &InboundMessage) -> bool;

    async fn generate_response(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<String>, CollaboratorError>;
}

#[async_trait]
/// Trait contract for the voice-command processor.
pub trait VoiceCommandProcessor: Send + Sync {
    /// Processes a voice note; returns an optional text reply.
    async fn process_voice_command(
        &self,
        message: &VoiceMessage,
    ) -> Result<Option<String>, CollaboratorError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Outcome of an update check.
pub enum UpdateStatus {
    UpToDate { current: String },
    Available { current: String, latest: String },
    Disabled,
}

#[async_trait]
/// Trait contract for the release/update checker.
pub trait UpdateChecker: Send + Sync {
    async fn check_for_updates(&self) -> Result<UpdateStatus, CollaboratorError>;
}

/// Reports the resident memory of the current process.
pub trait MemoryProbe: Send + Sync {
    /// Returns `None` when the platform cannot report usage.
    fn used_bytes(&self) -> Option<u64>;
}
