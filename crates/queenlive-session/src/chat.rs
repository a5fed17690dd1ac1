//! Chat synchronization for the current stream.
//!
//! History replays replace the log, live messages append, and outgoing
//! messages travel only through the relay: the local log shows a sent
//! message once the server echoes it back.

use std::sync::Arc;

use parking_lot::Mutex;
use queenlive_core::chat::APP_ORIGIN;
use queenlive_core::events::{names, ClientEvent, OutgoingMessage, ServerEvent, SessionEvent};
use queenlive_core::{ChatLog, ChatMessage, Role, SessionError, StreamId};
use queenlive_signaling::SignalingClient;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Who is speaking on the attached stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatIdentity {
    pub username: String,
    pub role: Role,
}

#[derive(Default)]
struct ChatState {
    log: ChatLog,
    attached: Option<(StreamId, ChatIdentity)>,
    draft: String,
    unsent: Vec<OutgoingMessage>,
}

/// Shared between the synchronizer and the handlers it registers.
#[derive(Clone)]
struct ChatCore {
    state: Arc<Mutex<ChatState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatCore {
    fn on_history(&self, messages: Vec<ChatMessage>) {
        let count = messages.len();
        self.state.lock().log.replace(messages);
        debug!(count, "chat history replaced");
        let _ = self.events.send(SessionEvent::ChatHistory { count });
    }

    fn on_message(&self, message: ChatMessage) {
        self.state.lock().log.push(message.clone());
        let _ = self.events.send(SessionEvent::ChatMessage { message });
    }

    fn on_system(&self, text: String) {
        info!(text = %text, "system message");
        let _ = self.events.send(SessionEvent::SystemMessage { text });
    }

    fn handle(&self, name: &str, payload: Value) {
        match ServerEvent::parse(name, payload) {
            Ok(Some(ServerEvent::ChatHistory(messages))) => self.on_history(messages),
            Ok(Some(ServerEvent::ReceiveMessage(message))) => self.on_message(message),
            Ok(Some(ServerEvent::SystemMessage(text))) => self.on_system(text),
            Ok(None) => {}
            Err(e) => warn!(event = name, error = %e, "dropping malformed chat event"),
        }
    }
}

const HANDLED_EVENTS: [&str; 3] = [names::RECEIVE_MESSAGE, names::CHAT_HISTORY, names::SYSTEM_MESSAGE];

pub struct ChatSynchronizer {
    signaling: Arc<SignalingClient>,
    core: ChatCore,
}

impl ChatSynchronizer {
    pub fn new(signaling: Arc<SignalingClient>, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            signaling,
            core: ChatCore {
                state: Arc::new(Mutex::new(ChatState::default())),
                events,
            },
        }
    }

    /// Subscribe to `stream_id`: register handlers, then ask the relay to
    /// join the room (which replays its history).
    pub fn attach(&self, stream_id: StreamId, identity: ChatIdentity) -> Result<(), SessionError> {
        self.detach();

        {
            let mut state = self.core.state.lock();
            state.log.bind(stream_id.clone());
            state.attached = Some((stream_id.clone(), identity));
        }

        for name in HANDLED_EVENTS {
            let core = self.core.clone();
            self.signaling.on(name, Arc::new(move |payload: Value| core.handle(name, payload)));
        }

        info!(stream_id = %stream_id, "chat attached");
        self.signaling.emit_event(&ClientEvent::JoinRoom(stream_id))
    }

    /// Remove the handlers of the current stream. The log is kept.
    pub fn detach(&self) {
        let previous = self.core.state.lock().attached.take();
        for name in HANDLED_EVENTS {
            self.signaling.off(name);
        }
        if let Some((stream_id, _)) = previous {
            debug!(stream_id = %stream_id, "chat detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.core.state.lock().attached.is_some()
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.core.state.lock().log.stream_id().cloned()
    }

    pub fn on_history(&self, messages: Vec<ChatMessage>) {
        self.core.on_history(messages);
    }

    pub fn on_message(&self, message: ChatMessage) {
        self.core.on_message(message);
    }

    pub fn on_system(&self, text: String) {
        self.core.on_system(text);
    }

    /// Send `text` to the room. Blank input is rejected without touching
    /// the network. The draft is cleared whatever the network outcome; a
    /// failed emit is kept in the unsent list.
    pub fn send(&self, text: &str) -> Result<(), SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::Rejected("empty message".into()));
        }

        let outgoing = {
            let mut state = self.core.state.lock();
            let Some((stream_id, identity)) = state.attached.clone() else {
                return Err(SessionError::NotJoined);
            };
            state.draft.clear();
            OutgoingMessage {
                stream_id,
                username: identity.username,
                message: text.to_string(),
                is_host: identity.role.is_host(),
                origin: APP_ORIGIN.to_string(),
            }
        };

        match self.signaling.emit_event(&ClientEvent::SendMessage(outgoing.clone())) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(stream_id = %outgoing.stream_id, error = %e, "chat message not sent");
                let _ = self.core.events.send(SessionEvent::ChatUnsent {
                    message: outgoing.message.clone(),
                    error: e.to_string(),
                });
                self.core.state.lock().unsent.push(outgoing);
                Err(e)
            }
        }
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        self.core.state.lock().draft = text.into();
    }

    pub fn draft(&self) -> String {
        self.core.state.lock().draft.clone()
    }

    /// Send the current draft.
    pub fn submit(&self) -> Result<(), SessionError> {
        let draft = self.draft();
        self.send(&draft)
    }

    pub fn unsent(&self) -> Vec<OutgoingMessage> {
        self.core.state.lock().unsent.clone()
    }

    /// Retry unsent messages in their original order. Returns how many went
    /// out; the rest stay queued.
    pub fn resend_unsent(&self) -> usize {
        let pending = std::mem::take(&mut self.core.state.lock().unsent);
        let mut sent = 0;
        let mut remaining = Vec::new();
        for message in pending {
            if !remaining.is_empty() {
                remaining.push(message);
                continue;
            }
            match self.signaling.emit_event(&ClientEvent::SendMessage(message.clone())) {
                Ok(()) => sent += 1,
                Err(_) => remaining.push(message),
            }
        }
        if !remaining.is_empty() {
            let mut state = self.core.state.lock();
            remaining.append(&mut state.unsent);
            state.unsent = remaining;
        }
        sent
    }

    /// Empty the log after the host's clear signal.
    pub fn clear_local(&self) {
        let stream_id = {
            let mut state = self.core.state.lock();
            state.log.clear();
            state.log.stream_id().cloned()
        };
        if let Some(stream_id) = stream_id {
            let _ = self.core.events.send(SessionEvent::ChatCleared { stream_id });
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.core.state.lock().log.messages().to_vec()
    }
}
