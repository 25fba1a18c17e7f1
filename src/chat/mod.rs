//! The chat-transport contract the core consumes, plus a minimal stdin/stdout
//! implementation used for local development and the seed-test scenarios.
//! Production transports (a real workspace-channel client) are out of scope
//! per SPEC_FULL.md §1; this module only defines the seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::router::CONTROL_PREFIX;

/// Whether a `ChatMessage` is a control command or conversational text,
/// derived from its leading characters (SPEC_FULL.md §3/§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    Conversation,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub text: String,
    pub user_id: String,
    pub channel_id: String,
    pub at: DateTime<Utc>,
    pub thread_ref: Option<String>,
}

impl ChatMessage {
    /// A message is a command iff its text, after left-trim, begins with the
    /// two-character control prefix.
    pub fn kind(&self) -> MessageKind {
        if self.text.trim_start().starts_with(CONTROL_PREFIX) {
            MessageKind::Command
        } else {
            MessageKind::Conversation
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn recv(&mut self) -> Option<ChatMessage>;
    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()>;

    /// Best-effort typing indicator. Most transports (and this dev one) have
    /// nothing useful to do here; default is a no-op rather than forcing every
    /// implementor to stub it out.
    async fn typing(&self, _channel: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Line-delimited stdin/stdout transport. Every line read from stdin becomes a
/// `ChatMessage` on a fixed development channel; `send` writes to stdout.
pub struct StdioTransport {
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::io::Stdin>>,
}

impl StdioTransport {
    pub fn new() -> Self {
        use tokio::io::AsyncBufReadExt;
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        Self {
            lines: reader.lines(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

const DEV_CHANNEL: &str = "dev";
const DEV_USER: &str = "local";

#[async_trait]
impl ChatTransport for StdioTransport {
    async fn recv(&mut self) -> Option<ChatMessage> {
        use tokio::io::AsyncBufReadExt;
        match self.lines.next_line().await {
            Ok(Some(text)) => Some(ChatMessage {
                text,
                user_id: DEV_USER.to_string(),
                channel_id: DEV_CHANNEL.to_string(),
                at: Utc::now(),
                thread_ref: None,
            }),
            _ => None,
        }
    }

    async fn send(&self, _channel: &str, text: &str) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(text.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> ChatMessage {
        ChatMessage {
            text: text.to_string(),
            user_id: "u".to_string(),
            channel_id: "c".to_string(),
            at: Utc::now(),
            thread_ref: None,
        }
    }

    #[test]
    fn kind_follows_control_prefix() {
        assert_eq!(msg("@@help").kind(), MessageKind::Command);
        assert_eq!(msg("  @@help").kind(), MessageKind::Command);
        assert_eq!(msg("hello there").kind(), MessageKind::Conversation);
    }
}
