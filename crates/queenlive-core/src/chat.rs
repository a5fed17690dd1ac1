use serde::{Deserialize, Serialize};

use crate::ids::StreamId;

/// Origin tag stamped on messages sent from this client.
pub const APP_ORIGIN: &str = "app";

/// A chat line as relayed by the signaling server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub username: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ChatMessage {
    pub fn new(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            message: message.into(),
            timestamp: String::new(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn is_from_app(&self) -> bool {
        self.origin.as_deref() == Some(APP_ORIGIN)
    }

    /// `[from <origin>] <username>: <message>`, origin prefix omitted when absent.
    pub fn display_line(&self) -> String {
        match &self.origin {
            Some(origin) => format!("[from {origin}] {}: {}", self.username, self.message),
            None => format!("{}: {}", self.username, self.message),
        }
    }
}

/// Ordered chat messages for exactly one stream.
///
/// Server delivery order is authoritative: no reordering, no deduplication.
#[derive(Clone, Debug, Default)]
pub struct ChatLog {
    stream_id: Option<StreamId>,
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope the log to `stream_id`. Switching streams drops old messages.
    pub fn bind(&mut self, stream_id: StreamId) {
        if self.stream_id.as_ref() != Some(&stream_id) {
            self.messages.clear();
            self.stream_id = Some(stream_id);
        }
    }

    pub fn stream_id(&self) -> Option<&StreamId> {
        self.stream_id.as_ref()
    }

    /// Replace everything with a history replay. Last writer wins.
    pub fn replace(&mut self, history: Vec<ChatMessage>) {
        self.messages = history;
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
