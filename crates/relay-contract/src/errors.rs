use thiserror::Error;

/// Startup configuration rejected. Carries every violated rule, not just the first.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("configuration errors: {}", violations.join(", "))]
pub struct ConfigurationError {
    pub violations: Vec<String>,
}

impl ConfigurationError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("security initialization failed: {0}")]
/// Credential/encryption store failed to initialize.
pub struct SecurityInitError(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("pre-launch security check failed: {0}")]
/// Pre-launch security check refused the launch.
pub struct SecurityCheckError(pub String);

/// Enumerates the persistent-storage operations that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    Connect,
    Backup,
    Disconnect,
}

impl StorageOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Backup => "backup",
            Self::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("storage {} failed: {detail}", operation.as_str())]
pub struct StorageError {
    pub operation: StorageOperation,
    pub detail: String,
}

impl StorageError {
    pub fn new(operation: StorageOperation, detail: impl Into<String>) -> Self {
        Self {
            operation,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("send to '{identity}' failed: {detail}")]
pub struct SendError {
    pub identity: String,
    pub detail: String,
}

impl SendError {
    pub fn new(identity: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            detail: detail.into(),
        }
    }
}

/// Enumerates supported `TransportError` values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport disconnected: {reason}")]
    Disconnected { reason: String },
    #[error("transport initialization failed: {0}")]
    Initialization(String),
    #[error("transport fault: {0}")]
    Fault(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("command '{command}' failed: {detail}")]
pub struct CommandExecutionError {
    pub command: String,
    pub detail: String,
}

impl CommandExecutionError {
    pub fn new(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("plugin load failed: {0}")]
pub struct PluginLoadError(pub String);

/// Failure reported by an opaque collaborator (AI responder, voice processor, update checker).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{collaborator} failed: {detail}")]
pub struct CollaboratorError {
    pub collaborator: String,
    pub detail: String,
}

impl CollaboratorError {
    pub fn new(collaborator: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            collaborator: collaborator.into(),
            detail: detail.into(),
        }
    }
}

/// Errors that reach the lifecycle controller from startup, recovery, or shutdown.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    SecurityInit(#[from] SecurityInitError),
    #[error(transparent)]
    SecurityCheck(#[from] SecurityCheckError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Plugin(#[from] PluginLoadError),
    #[error(transparent)]
    Command(#[from] CommandExecutionError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("illegal lifecycle transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: usize },
    #[error("unhandled fault: {0}")]
    Fault(String),
}

impl LifecycleError {
    /// Stable snake_case code used in logs and health snapshots.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_invalid",
            Self::SecurityInit(_) => "security_init_failed",
            Self::SecurityCheck(_) => "security_check_failed",
            Self::Storage(error) => match error.operation {
                StorageOperation::Connect => "storage_connect_failed",
                StorageOperation::Backup => "storage_backup_failed",
                StorageOperation::Disconnect => "storage_disconnect_failed",
            },
            Self::Transport(TransportError::Disconnected { .. }) => "transport_disconnected",
            Self::Transport(TransportError::Initialization(_)) => "transport_init_failed",
            Self::Transport(TransportError::Fault(_)) => "transport_fault",
            Self::Send(_) => "send_failed",
            Self::Plugin(_) => "plugin_load_failed",
            Self::Command(_) => "command_execution_failed",
            Self::Collaborator(_) => "collaborator_failed",
            Self::InvalidTransition { .. } => "lifecycle_transition_invalid",
            Self::RecoveryExhausted { .. } => "recovery_exhausted",
            Self::Fault(_) => "unhandled_fault",
        }
    }
}
