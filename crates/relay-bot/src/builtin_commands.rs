use async_trait::async_trait;
use relay_contract::{
    AiResponder, CollaboratorError, CommandExecutionError, CommandInvocation, CommandReply,
    InboundMessage, PluginHost, PluginLoadError, VoiceCommandProcessor, VoiceMessage,
};
use relay_core::format_uptime;
use tokio::time::Instant;

pub(crate) const BUILTIN_COMMANDS: &[(&str, &str)] = &[
    ("ping", "check that the bot is responsive"),
    ("help", "list available commands"),
    ("uptime", "show how long the bot has been running"),
    ("echo", "repeat the given text"),
];

/// Plugin host serving the builtin command set.
pub(crate) struct BuiltinCommands {
    prefix: String,
    started_at: Instant,
}

impl BuiltinCommands {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            started_at: Instant::now(),
        }
    }

    fn help_text(&self) -> String {
        let mut lines = vec!["Available commands:".to_string()];
        for (name, summary) in BUILTIN_COMMANDS {
            lines.push(format!("{}{name} - {summary}", self.prefix));
        }
        lines.join("\n")
    }
}

#[async_trait]
impl PluginHost for BuiltinCommands {
    async fn load_plugins(&self) -> Result<usize, PluginLoadError> {
        Ok(BUILTIN_COMMANDS.len())
    }

    async fn execute_command(
        &self,
        invocation: &CommandInvocation,
    ) -> Result<CommandReply, CommandExecutionError> {
        match invocation.name.as_str() {
            "ping" => Ok(CommandReply::text("pong")),
            "help" => Ok(CommandReply::text(self.help_text())),
            "uptime" => Ok(CommandReply::text(format!(
                "Uptime: {}",
                format_uptime(self.started_at.elapsed())
            ))),
            "echo" => {
                if invocation.args.is_empty() {
                    return Err(CommandExecutionError::new(
                        "echo",
                        "usage: echo <text>",
                    ));
                }
                Ok(CommandReply::text(invocation.args.join(" ")))
            }
            other => Err(CommandExecutionError::new(other, "unknown command")),
        }
    }
}

/// Offline responder: answers messages that mention the bot by name with a
/// pointer to the help command.
pub(crate) struct MentionResponder {
    bot_name: String,
    prefix: String,
}

impl MentionResponder {
    pub(crate) fn new(bot_name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bot_name: bot_name.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl AiResponder for MentionResponder {
    async fn initialize(&self) -> Result<(), CollaboratorError> {
        if self.bot_name.trim().is_empty() {
            return Err(CollaboratorError::new(
                "ai responder",
                "bot name is required for mention detection",
            ));
        }
        Ok(())
    }

    fn should_respond(&self, message: &InboundMessage) -> bool {
        message
            .body
            .to_lowercase()
            .contains(&self.bot_name.to_lowercase())
    }

    async fn generate_response(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<String>, CollaboratorError> {
        if message.body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(format!(
            "Hi {}, {} is listening. Send {}help for commands.",
            message.from, self.bot_name, self.prefix
        )))
    }
}

/// Treats the voice payload as a UTF-8 transcript and acknowledges it.
pub(crate) struct TranscriptAcknowledger;

#[async_trait]
impl VoiceCommandProcessor for TranscriptAcknowledger {
    async fn process_voice_command(
        &self,
        message: &VoiceMessage,
    ) -> Result<Option<String>, CollaboratorError> {
        let transcript = std::str::from_utf8(&message.audio).map_err(|_| {
            CollaboratorError::new("voice", "voice payload is not a utf-8 transcript")
        })?;
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!("Voice command received: {transcript}")))
    }
}
