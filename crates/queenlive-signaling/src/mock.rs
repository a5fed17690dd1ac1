use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use queenlive_core::ids::{ConverterId, StreamId};
use queenlive_core::{Role, SessionError, Uid};
use secrecy::SecretString;

use crate::api::{ControlPlane, YoutubeStream};

/// Scripted outcome of one control-plane call.
pub enum MockReply<T> {
    Ok(T),
    Err(SessionError),
    /// Wait a duration, then resolve the inner reply.
    Delay(Duration, Box<MockReply<T>>),
}

impl<T> MockReply<T> {
    pub fn delayed(delay: Duration, inner: MockReply<T>) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// A call as the mock saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCall {
    Token { channel: String, uid: Uid, role: Role },
    Start(StreamId),
    Stop(ConverterId),
}

/// Control plane that answers from per-endpoint scripts and succeeds with
/// canned values once a script runs dry.
#[derive(Default)]
pub struct MockControlPlane {
    tokens: Mutex<VecDeque<MockReply<String>>>,
    starts: Mutex<VecDeque<MockReply<YoutubeStream>>>,
    stops: Mutex<VecDeque<MockReply<()>>>,
    calls: Mutex<Vec<ControlCall>>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_token(&self, reply: MockReply<String>) -> &Self {
        self.tokens.lock().push_back(reply);
        self
    }

    pub fn script_start(&self, reply: MockReply<YoutubeStream>) -> &Self {
        self.starts.lock().push_back(reply);
        self
    }

    pub fn script_stop(&self, reply: MockReply<()>) -> &Self {
        self.stops.lock().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

/// The stream every unscripted start resolves to.
pub fn canned_stream() -> YoutubeStream {
    YoutubeStream {
        converter_id: ConverterId::from_raw("c1"),
        youtube_link: "https://youtu.be/x".to_string(),
    }
}

async fn resolve<T>(reply: MockReply<T>) -> Result<T, SessionError> {
    let mut current = reply;
    loop {
        match current {
            MockReply::Ok(v) => return Ok(v),
            MockReply::Err(e) => return Err(e),
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn fetch_rtc_token(&self, channel: &str, uid: Uid, role: Role) -> Result<SecretString, SessionError> {
        self.calls.lock().push(ControlCall::Token {
            channel: channel.to_string(),
            uid,
            role,
        });
        let reply = self
            .tokens
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockReply::Ok(format!("mock-token-{uid}")));
        resolve(reply).await.map(SecretString::from)
    }

    async fn start_youtube_stream(&self, stream_id: &StreamId) -> Result<YoutubeStream, SessionError> {
        self.calls.lock().push(ControlCall::Start(stream_id.clone()));
        let reply = self.starts.lock().pop_front().unwrap_or_else(|| MockReply::Ok(canned_stream()));
        resolve(reply).await
    }

    async fn stop_rtmp(&self, converter_id: &ConverterId) -> Result<(), SessionError> {
        self.calls.lock().push(ControlCall::Stop(converter_id.clone()));
        let reply = self.stops.lock().pop_front().unwrap_or(MockReply::Ok(()));
        resolve(reply).await
    }
}
