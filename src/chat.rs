//! Room chat. Messages are ordered by arrival at this client.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Error;
use crate::protocol::ChatMessageEvent;
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl From<ChatMessageEvent> for ChatMessage {
    fn from(event: ChatMessageEvent) -> Self {
        Self {
            sender_id: event.sender_id,
            sender_name: event.sender_name,
            text: event.message,
            timestamp: event.timestamp,
        }
    }
}

/// Append-only message log.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Replace the log with a full history, e.g. after reconnecting.
    pub fn replace(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

/// Trimmed message text, or `EmptyMessage`.
pub fn prepare(text: &str) -> Result<String, Error> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::EmptyMessage);
    }
    Ok(text.to_string())
}

/// Send a message to the room. The relay echoes it back as `new-message`,
/// which is when it enters the log.
pub async fn send(signaling: &SignalingChannel, room_id: &str, text: &str) -> Result<(), Error> {
    let text = prepare(text)?;
    signaling.send_message(room_id, &text).await?;
    Ok(())
}
