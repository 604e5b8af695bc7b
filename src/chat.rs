//! Text-mode chat data model. Turn handling is plain request/response and
//! lives with the UI layer; only the message invariants are enforced here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// True while the model is still appending text. A message is immutable
    /// once this clears.
    pub streaming: bool,
}

/// Ordered message log for the text mode.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
    next_id: u64,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Append a completed user message.
    pub fn push_user(&mut self, text: impl Into<String>) -> u64 {
        self.push(Role::User, text.into(), false)
    }

    /// Start an empty model message that will receive streamed deltas.
    pub fn begin_model(&mut self) -> u64 {
        self.push(Role::Model, String::new(), true)
    }

    /// Append streamed text to a model message. Returns false (and changes
    /// nothing) when the message is unknown or no longer streaming.
    pub fn push_delta(&mut self, id: u64, delta: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) if message.streaming => {
                message.text.push_str(delta);
                true
            }
            Some(_) => {
                log::warn!("Ignoring delta for finalized message {}", id);
                false
            }
            None => false,
        }
    }

    /// Clear the streaming flag; the message is immutable afterwards.
    pub fn finish(&mut self, id: u64) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.streaming = false;
        }
    }

    fn push(&mut self, role: Role, text: String, streaming: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(ChatMessage {
            id,
            role,
            text,
            timestamp: Utc::now(),
            streaming,
        });
        id
    }
}
