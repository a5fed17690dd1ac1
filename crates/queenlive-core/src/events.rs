use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::ChatMessage;
use crate::errors::SessionError;
use crate::ids::{StreamId, Uid};
use crate::types::{MediaKind, Role, SessionPhase};

pub mod names {
    pub const JOIN_ROOM: &str = "joinRoom";
    pub const SEND_MESSAGE: &str = "sendMessage";
    pub const CLEAR_CHAT: &str = "clearChat";
    pub const RECEIVE_MESSAGE: &str = "receiveMessage";
    pub const CHAT_HISTORY: &str = "chatHistory";
    pub const SYSTEM_MESSAGE: &str = "systemMessage";
}

/// Payload of an outgoing `sendMessage` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub stream_id: StreamId,
    pub username: String,
    pub message: String,
    pub is_host: bool,
    pub origin: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearChat {
    pub stream_id: StreamId,
}

/// Events this client emits on the signaling channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    JoinRoom(StreamId),
    SendMessage(OutgoingMessage),
    ClearChat(ClearChat),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => names::JOIN_ROOM,
            ClientEvent::SendMessage(_) => names::SEND_MESSAGE,
            ClientEvent::ClearChat(_) => names::CLEAR_CHAT,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            // joinRoom takes the bare stream id, not an object
            ClientEvent::JoinRoom(stream_id) => Value::String(stream_id.to_string()),
            ClientEvent::SendMessage(msg) => serde_json::to_value(msg).unwrap_or(Value::Null),
            ClientEvent::ClearChat(clear) => serde_json::to_value(clear).unwrap_or(Value::Null),
        }
    }
}

/// Events the signaling server pushes to this client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    ReceiveMessage(ChatMessage),
    ChatHistory(Vec<ChatMessage>),
    SystemMessage(String),
}

impl ServerEvent {
    /// Decode a named event. Unknown names yield `Ok(None)`.
    pub fn parse(name: &str, payload: Value) -> Result<Option<Self>, SessionError> {
        let event = match name {
            names::RECEIVE_MESSAGE => ServerEvent::ReceiveMessage(serde_json::from_value(payload)?),
            names::CHAT_HISTORY => ServerEvent::ChatHistory(serde_json::from_value(payload)?),
            names::SYSTEM_MESSAGE => match payload {
                Value::String(s) => ServerEvent::SystemMessage(s),
                other => {
                    return Err(SessionError::Protocol(format!(
                        "systemMessage expects a string, got {other}"
                    )))
                }
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Raw notifications from the RTC engine about remote users.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaEvent {
    UserPublished { uid: Uid, kind: MediaKind },
    UserUnpublished { uid: Uid, kind: MediaKind },
}

/// State changes the session core reports to its front end.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "phase_changed")]
    PhaseChanged { phase: SessionPhase },

    #[serde(rename = "joined")]
    Joined { uid: Uid, role: Role, stream_id: StreamId },

    #[serde(rename = "left")]
    Left { uid: Uid },

    #[serde(rename = "join_failed")]
    JoinFailed { kind: String, error: String },

    #[serde(rename = "video_started")]
    VideoStarted,

    #[serde(rename = "participant_published")]
    ParticipantPublished { uid: Uid, kind: MediaKind },

    #[serde(rename = "participant_unpublished")]
    ParticipantUnpublished { uid: Uid },

    #[serde(rename = "chat_message")]
    ChatMessage { message: ChatMessage },

    #[serde(rename = "chat_history")]
    ChatHistory { count: usize },

    #[serde(rename = "chat_cleared")]
    ChatCleared { stream_id: StreamId },

    #[serde(rename = "chat_unsent")]
    ChatUnsent { message: String, error: String },

    #[serde(rename = "system_message")]
    SystemMessage { text: String },

    #[serde(rename = "broadcast_started")]
    BroadcastStarted { converter_id: String, youtube_link: String },

    #[serde(rename = "broadcast_stopped")]
    BroadcastStopped,
}
