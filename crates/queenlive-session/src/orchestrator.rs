//! Session orchestrator: composes membership, chat and the control plane
//! behind the user-facing actions.

use std::sync::Arc;

use parking_lot::Mutex;
use queenlive_core::events::{MediaEvent, SessionEvent};
use queenlive_core::ids::ConverterId;
use queenlive_core::media::{MediaEngine, RenderSurface, RenderTarget};
use queenlive_core::settings::ClientSettings;
use queenlive_core::{ChatMessage, MediaKind, Participant, Role, Session, SessionError, SessionPhase, Uid};
use queenlive_signaling::{ControlPlane, SignalingClient};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chat::{ChatIdentity, ChatSynchronizer};
use crate::membership::{MembershipConfig, RoomMembershipController};

const EVENT_CHANNEL_CAPACITY: usize = 256;

impl From<&ClientSettings> for MembershipConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            app_id: settings.app_id.clone(),
            channel: settings.channel.clone(),
            host_uid: settings.host_uid,
            stream_id: settings.stream_id(),
        }
    }
}

/// The external YouTube/RTMP restream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastState {
    pub converter_id: Option<ConverterId>,
    pub youtube_link: Option<String>,
    pub loading: bool,
}

impl BroadcastState {
    pub fn is_active(&self) -> bool {
        self.converter_id.is_some()
    }
}

/// Everything a front end needs to draw the session.
#[derive(Clone, Debug)]
pub struct UiState {
    pub phase: SessionPhase,
    pub role: Option<Role>,
    pub username: Option<String>,
    pub joined: bool,
    pub video_started: bool,
    pub loading: bool,
    pub youtube_link: Option<String>,
    pub converter_id: Option<ConverterId>,
    pub participants: Vec<Participant>,
    pub render_targets: Vec<RenderTarget>,
    pub chat: Vec<ChatMessage>,
    pub unsent: usize,
}

#[derive(Default)]
struct UiFlags {
    video_started: bool,
    broadcast: BroadcastState,
}

struct Inner {
    membership: RoomMembershipController,
    chat: ChatSynchronizer,
    control: Arc<dyn ControlPlane>,
    events: broadcast::Sender<SessionEvent>,
    flags: Mutex<UiFlags>,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Mark video as live and hook up chat. Runs once per session.
    fn start_video(&self, session: &Session) {
        {
            let mut flags = self.flags.lock();
            if flags.video_started {
                return;
            }
            flags.video_started = true;
        }
        self.emit(SessionEvent::VideoStarted);

        let identity = ChatIdentity {
            username: session.username.clone(),
            role: session.role,
        };
        if let Err(e) = self.chat.attach(session.stream_id.clone(), identity) {
            warn!(stream_id = %session.stream_id, error = %e, "chat attach failed");
        }
    }

    async fn handle_media_event(&self, event: MediaEvent) {
        match event {
            MediaEvent::UserPublished { uid, kind } => match self.membership.on_remote_published(uid, kind).await {
                Ok(true) if kind == MediaKind::Video => {
                    if let Some(session) = self.membership.session() {
                        self.start_video(&session);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(%uid, %kind, error = %e, "failed to attach remote media"),
            },
            MediaEvent::UserUnpublished { uid, .. } => {
                self.membership.on_remote_unpublished(uid);
            }
        }
    }
}

/// User-facing entry point for one client instance.
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
    pump: Option<JoinHandle<()>>,
}

impl SessionOrchestrator {
    /// Wire the components together and start pumping media events from
    /// `engine`. Must be called inside a tokio runtime.
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        control: Arc<dyn ControlPlane>,
        signaling: Arc<SignalingClient>,
        surface: Arc<dyn RenderSurface>,
        config: MembershipConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let media_events = engine.take_events();
        let inner = Arc::new(Inner {
            membership: RoomMembershipController::new(
                engine,
                control.clone(),
                signaling.clone(),
                surface,
                config,
                events.clone(),
            ),
            chat: ChatSynchronizer::new(signaling, events.clone()),
            control,
            events,
            flags: Mutex::new(UiFlags::default()),
        });

        let pump = match media_events {
            Some(rx) => Some(spawn_pump(Arc::clone(&inner), rx)),
            None => {
                warn!("media engine events already taken, remote users will not be tracked");
                None
            }
        };

        Self { inner, pump }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn membership(&self) -> &RoomMembershipController {
        &self.inner.membership
    }

    pub fn chat(&self) -> &ChatSynchronizer {
        &self.inner.chat
    }

    pub async fn join(&self, role: Role, desired_uid: Option<Uid>) -> Result<Session, SessionError> {
        match self.inner.membership.join(role, desired_uid).await {
            Ok(session) => {
                self.inner.emit(SessionEvent::Joined {
                    uid: session.local_uid,
                    role,
                    stream_id: session.stream_id.clone(),
                });
                let remote_video = self.inner.membership.participants().iter().any(|p| p.has_video);
                if role.is_host() || remote_video {
                    self.inner.start_video(&session);
                }
                Ok(session)
            }
            Err(e) => {
                if e != SessionError::Busy {
                    error!(%role, error = %e, kind = e.error_kind(), "join failed");
                    self.inner.emit(SessionEvent::JoinFailed {
                        kind: e.error_kind().to_string(),
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Leave the room. Hosts also clear the room's chat. The broadcast state
    /// is left alone so a running restream can still be stopped.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let session = self.inner.membership.session();
        self.inner.chat.detach();
        let result = self.inner.membership.leave().await;

        if let Some(session) = session {
            if session.role.is_host() {
                self.inner.chat.clear_local();
            }
            self.inner.emit(SessionEvent::Left { uid: session.local_uid });
        }
        self.inner.flags.lock().video_started = false;
        result
    }

    /// Ask the control plane to restream the room to YouTube. Host only,
    /// joined only, and refused while a restream is active or starting.
    pub async fn start_youtube_stream(&self) -> Result<String, SessionError> {
        let session = self.inner.membership.session().ok_or(SessionError::NotJoined)?;
        if !session.role.is_host() {
            return Err(SessionError::HostOnly);
        }
        {
            let mut flags = self.inner.flags.lock();
            if flags.broadcast.loading {
                return Err(SessionError::Rejected("broadcast request already in flight".into()));
            }
            if flags.broadcast.is_active() {
                return Err(SessionError::Rejected("broadcast already running".into()));
            }
            flags.broadcast.loading = true;
        }

        let result = self.inner.control.start_youtube_stream(&session.stream_id).await;

        let mut flags = self.inner.flags.lock();
        flags.broadcast.loading = false;
        match result {
            Ok(stream) => {
                info!(converter_id = %stream.converter_id, link = %stream.youtube_link, "youtube stream started");
                flags.broadcast.converter_id = Some(stream.converter_id.clone());
                flags.broadcast.youtube_link = Some(stream.youtube_link.clone());
                drop(flags);
                self.inner.emit(SessionEvent::BroadcastStarted {
                    converter_id: stream.converter_id.to_string(),
                    youtube_link: stream.youtube_link.clone(),
                });
                Ok(stream.youtube_link)
            }
            Err(e) => {
                warn!(error = %e, "youtube stream start failed");
                Err(e)
            }
        }
    }

    /// Stop the running restream. On failure the converter id is kept so
    /// the stop can be retried.
    pub async fn stop_rtmp_push(&self) -> Result<(), SessionError> {
        let converter_id = {
            let mut flags = self.inner.flags.lock();
            if flags.broadcast.loading {
                return Err(SessionError::Rejected("broadcast request already in flight".into()));
            }
            let Some(converter_id) = flags.broadcast.converter_id.clone() else {
                return Err(SessionError::Rejected("no active broadcast".into()));
            };
            flags.broadcast.loading = true;
            converter_id
        };

        let result = self.inner.control.stop_rtmp(&converter_id).await;

        let mut flags = self.inner.flags.lock();
        flags.broadcast.loading = false;
        match result {
            Ok(()) => {
                info!(converter_id = %converter_id, "rtmp push stopped");
                flags.broadcast.converter_id = None;
                flags.broadcast.youtube_link = None;
                drop(flags);
                self.inner.emit(SessionEvent::BroadcastStopped);
                Ok(())
            }
            Err(e) => {
                warn!(converter_id = %converter_id, error = %e, "rtmp stop failed");
                Err(e)
            }
        }
    }

    pub fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        self.inner.chat.send(text)
    }

    pub fn broadcast(&self) -> BroadcastState {
        self.inner.flags.lock().broadcast.clone()
    }

    pub fn snapshot(&self) -> UiState {
        let session = self.inner.membership.session();
        let (video_started, broadcast) = {
            let flags = self.inner.flags.lock();
            (flags.video_started, flags.broadcast.clone())
        };
        UiState {
            phase: self.inner.membership.phase(),
            role: session.as_ref().map(|s| s.role),
            username: session.as_ref().map(|s| s.username.clone()),
            joined: session.as_ref().is_some_and(|s| s.joined),
            video_started,
            loading: broadcast.loading,
            youtube_link: broadcast.youtube_link,
            converter_id: broadcast.converter_id,
            participants: self.inner.membership.participants(),
            render_targets: self.inner.membership.render_targets(),
            chat: self.inner.chat.messages(),
            unsent: self.inner.chat.unsent().len(),
        }
    }

    /// Feed one engine notification through the same path the pump uses.
    pub async fn handle_media_event(&self, event: MediaEvent) {
        self.inner.handle_media_event(event).await;
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn spawn_pump(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<MediaEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            inner.handle_media_event(event).await;
        }
        info!("media event stream closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessEngine;
    use crate::mock::{MockFaults, MockMediaEngine, MockSurface};
    use queenlive_core::StreamId;
    use queenlive_signaling::mock::{ControlCall, MockControlPlane, MockReply};
    use queenlive_signaling::{LoopbackPeer, YoutubeStream};
    use serde_json::json;
    use std::time::Duration;

    const HOST_UID: Uid = Uid(2_882_341_273);

    struct Harness {
        orchestrator: SessionOrchestrator,
        engine: Arc<MockMediaEngine>,
        surface: Arc<MockSurface>,
        control: Arc<MockControlPlane>,
        peer: LoopbackPeer,
    }

    fn harness() -> Harness {
        harness_with(MockMediaEngine::new())
    }

    fn harness_with(engine: MockMediaEngine) -> Harness {
        let engine = Arc::new(engine);
        let surface = Arc::new(MockSurface::new());
        let control = Arc::new(MockControlPlane::new());
        let (client, peer) = SignalingClient::loopback();
        let orchestrator = SessionOrchestrator::new(
            engine.clone(),
            control.clone(),
            Arc::new(client),
            surface.clone(),
            MembershipConfig::from(&ClientSettings::default()),
        );
        Harness {
            orchestrator,
            engine,
            surface,
            control,
            peer,
        }
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if pred(&ev) => return ev,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel: {e}"),
                }
            }
        })
        .await
        .expect("event not seen in time")
    }

    #[tokio::test]
    async fn host_join_starts_video_and_attaches_chat() {
        let mut h = harness();
        let session = h.orchestrator.join(Role::Host, None).await.unwrap();
        assert_eq!(session.local_uid, HOST_UID);

        let ui = h.orchestrator.snapshot();
        assert_eq!(ui.phase, SessionPhase::Joined);
        assert!(ui.joined);
        assert!(ui.video_started);
        assert_eq!(ui.role, Some(Role::Host));
        assert_eq!(ui.username.as_deref(), Some("Host"));
        assert_eq!(ui.render_targets.len(), 1);
        assert_eq!(ui.render_targets[0].id(), "2882341273");

        assert_eq!(h.peer.drain_events(), vec![("joinRoom".to_string(), json!("2882341273"))]);
    }

    #[tokio::test]
    async fn audience_attaches_chat_on_first_remote_video() {
        let mut h = harness();
        let mut rx = h.orchestrator.subscribe();
        h.orchestrator.join(Role::Audience, Some(Uid(77))).await.unwrap();
        assert!(!h.orchestrator.snapshot().video_started);
        assert!(h.peer.drain_events().is_empty());

        h.engine.emit(MediaEvent::UserPublished { uid: HOST_UID, kind: MediaKind::Audio });
        h.engine.emit(MediaEvent::UserPublished { uid: HOST_UID, kind: MediaKind::Video });
        wait_for(&mut rx, |ev| matches!(ev, SessionEvent::VideoStarted)).await;

        let ui = h.orchestrator.snapshot();
        assert!(ui.video_started);
        assert_eq!(ui.participants.len(), 1);
        assert!(ui.participants[0].has_video && ui.participants[0].has_audio);
        assert_eq!(h.peer.drain_events(), vec![("joinRoom".to_string(), json!("2882341273"))]);

        // Second video publish does not re-attach.
        h.orchestrator
            .handle_media_event(MediaEvent::UserPublished { uid: HOST_UID, kind: MediaKind::Video })
            .await;
        assert!(h.peer.drain_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_during_host_join_gets_a_target() {
        let h = harness_with(MockMediaEngine::with_faults(MockFaults {
            camera_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        }));
        let mut rx = h.orchestrator.subscribe();
        let join = h.orchestrator.join(Role::Host, None);
        let publish = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.engine.emit(MediaEvent::UserPublished { uid: Uid(555), kind: MediaKind::Video });
        };
        let (joined, ()) = tokio::join!(join, publish);
        joined.unwrap();

        wait_for(&mut rx, |ev| matches!(ev, SessionEvent::ParticipantPublished { uid, .. } if *uid == Uid(555))).await;
        let ui = h.orchestrator.snapshot();
        let ids: Vec<&str> = ui.render_targets.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec!["555", "2882341273"]);
    }

    #[tokio::test]
    async fn audience_joining_a_live_host_attaches_chat() {
        let surface = Arc::new(MockSurface::new());
        let (client, mut peer) = SignalingClient::loopback();
        let orchestrator = SessionOrchestrator::new(
            Arc::new(HeadlessEngine::new().with_publisher(HOST_UID)),
            Arc::new(MockControlPlane::new()),
            Arc::new(client),
            surface.clone(),
            MembershipConfig::from(&ClientSettings::default()),
        );
        let mut rx = orchestrator.subscribe();
        orchestrator.join(Role::Audience, Some(Uid(77))).await.unwrap();

        wait_for(&mut rx, |ev| matches!(ev, SessionEvent::VideoStarted)).await;
        assert_eq!(surface.mounted_ids(), vec!["2882341273"]);
        assert_eq!(peer.drain_events(), vec![("joinRoom".to_string(), json!("2882341273"))]);
    }

    #[tokio::test]
    async fn remote_publish_and_unpublish_through_pump() {
        let h = harness();
        let mut rx = h.orchestrator.subscribe();
        h.orchestrator.join(Role::Host, None).await.unwrap();

        h.engine.emit(MediaEvent::UserPublished { uid: Uid(555), kind: MediaKind::Video });
        wait_for(&mut rx, |ev| matches!(ev, SessionEvent::ParticipantPublished { uid, .. } if *uid == Uid(555))).await;
        assert_eq!(h.surface.mounted_ids(), vec!["2882341273", "555"]);
        assert!(h.engine.remote_tracks(Uid(555))[0].is_playing());

        h.engine.emit(MediaEvent::UserUnpublished { uid: Uid(555), kind: MediaKind::Video });
        wait_for(&mut rx, |ev| matches!(ev, SessionEvent::ParticipantUnpublished { .. })).await;
        assert_eq!(h.surface.mounted_ids(), vec!["2882341273"]);
    }

    #[tokio::test]
    async fn chat_flows_through_orchestrator() {
        let mut h = harness();
        h.orchestrator.join(Role::Host, None).await.unwrap();
        h.peer.drain_events();

        h.peer.push_event("chatHistory", json!([{"username": "User 5", "message": "hi"}]));
        h.orchestrator.send_chat("welcome").unwrap();
        assert!(h.orchestrator.send_chat("  ").is_err());
        let sent = h.peer.drain_events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1["isHost"], true);
        assert_eq!(sent[0].1["origin"], "app");

        h.peer.push_event("receiveMessage", json!({"username": "Host", "message": "welcome", "origin": "app"}));
        let chat = h.orchestrator.snapshot().chat;
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[1].display_line(), "[from app] Host: welcome");
    }

    #[tokio::test]
    async fn host_leave_clears_chat_and_targets() {
        let mut h = harness();
        h.orchestrator.join(Role::Host, None).await.unwrap();
        h.peer.push_event("chatHistory", json!([{"username": "a", "message": "b"}]));
        h.peer.drain_events();

        h.orchestrator.leave().await.unwrap();
        let ui = h.orchestrator.snapshot();
        assert_eq!(ui.phase, SessionPhase::Idle);
        assert!(!ui.joined);
        assert!(!ui.video_started);
        assert!(ui.chat.is_empty());
        assert!(ui.render_targets.is_empty());
        assert_eq!(
            h.peer.drain_events(),
            vec![("clearChat".to_string(), json!({"streamId": "2882341273"}))]
        );

        // Handlers are gone after leave.
        h.peer.push_event("receiveMessage", json!({"username": "x", "message": "late"}));
        assert!(h.orchestrator.snapshot().chat.is_empty());
    }

    #[tokio::test]
    async fn audience_leave_keeps_chat_and_sends_no_clear() {
        let mut h = harness();
        h.orchestrator.join(Role::Audience, Some(Uid(8))).await.unwrap();
        h.orchestrator
            .handle_media_event(MediaEvent::UserPublished { uid: HOST_UID, kind: MediaKind::Video })
            .await;
        h.peer.push_event("chatHistory", json!([{"username": "a", "message": "b"}]));
        h.peer.drain_events();

        h.orchestrator.leave().await.unwrap();
        assert!(h.peer.drain_events().is_empty());
        assert_eq!(h.orchestrator.snapshot().chat.len(), 1);
    }

    #[tokio::test]
    async fn youtube_start_and_stop() {
        let h = harness();
        h.orchestrator.join(Role::Host, None).await.unwrap();

        let link = h.orchestrator.start_youtube_stream().await.unwrap();
        assert_eq!(link, "https://youtu.be/x");
        let ui = h.orchestrator.snapshot();
        assert_eq!(ui.youtube_link.as_deref(), Some("https://youtu.be/x"));
        assert_eq!(ui.converter_id, Some(ConverterId::from_raw("c1")));
        assert!(!ui.loading);

        let err = h.orchestrator.start_youtube_stream().await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(_)));

        h.orchestrator.stop_rtmp_push().await.unwrap();
        let ui = h.orchestrator.snapshot();
        assert!(ui.youtube_link.is_none());
        assert!(ui.converter_id.is_none());

        assert_eq!(
            h.control.calls()[1..],
            [
                ControlCall::Start(StreamId::from_raw("2882341273")),
                ControlCall::Stop(ConverterId::from_raw("c1")),
            ]
        );
    }

    #[tokio::test]
    async fn youtube_is_host_only_and_joined_only() {
        let h = harness();
        assert_eq!(h.orchestrator.start_youtube_stream().await.unwrap_err(), SessionError::NotJoined);

        h.orchestrator.join(Role::Audience, Some(Uid(3))).await.unwrap();
        assert_eq!(h.orchestrator.start_youtube_stream().await.unwrap_err(), SessionError::HostOnly);
        assert!(h
            .control
            .calls()
            .iter()
            .all(|c| !matches!(c, ControlCall::Start(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn youtube_start_rejected_while_loading() {
        let h = harness();
        h.control.script_start(MockReply::delayed(
            Duration::from_secs(1),
            MockReply::Ok(YoutubeStream {
                converter_id: ConverterId::from_raw("c1"),
                youtube_link: "https://youtu.be/x".into(),
            }),
        ));
        h.orchestrator.join(Role::Host, None).await.unwrap();

        let (first, second) = tokio::join!(h.orchestrator.start_youtube_stream(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(h.orchestrator.snapshot().loading);
            h.orchestrator.start_youtube_stream().await
        });
        assert!(first.is_ok());
        assert!(matches!(second, Err(SessionError::Rejected(_))));
    }

    #[tokio::test]
    async fn youtube_start_failure_clears_loading() {
        let h = harness();
        h.control.script_start(MockReply::Err(SessionError::Network("x".into())));
        h.orchestrator.join(Role::Host, None).await.unwrap();

        assert!(h.orchestrator.start_youtube_stream().await.is_err());
        let ui = h.orchestrator.snapshot();
        assert!(!ui.loading);
        assert!(ui.youtube_link.is_none());
    }

    #[tokio::test]
    async fn stop_failure_keeps_converter_for_retry() {
        let h = harness();
        h.orchestrator.join(Role::Host, None).await.unwrap();
        h.orchestrator.start_youtube_stream().await.unwrap();

        h.control.script_stop(MockReply::Err(SessionError::Network("down".into())));
        assert!(h.orchestrator.stop_rtmp_push().await.is_err());
        assert!(h.orchestrator.broadcast().is_active());
        h.orchestrator.stop_rtmp_push().await.unwrap();
        assert!(!h.orchestrator.broadcast().is_active());
    }

    #[tokio::test]
    async fn stop_without_broadcast_is_rejected() {
        let h = harness();
        assert!(matches!(h.orchestrator.stop_rtmp_push().await, Err(SessionError::Rejected(_))));
    }

    #[tokio::test]
    async fn leave_keeps_broadcast_state() {
        let h = harness();
        h.orchestrator.join(Role::Host, None).await.unwrap();
        h.orchestrator.start_youtube_stream().await.unwrap();
        h.orchestrator.leave().await.unwrap();
        assert!(h.orchestrator.broadcast().is_active());
        h.orchestrator.stop_rtmp_push().await.unwrap();
    }

    #[tokio::test]
    async fn failed_join_is_reported() {
        let h = harness();
        let mut rx = h.orchestrator.subscribe();
        h.control.script_token(MockReply::Err(SessionError::Auth("denied".into())));
        assert!(h.orchestrator.join(Role::Host, None).await.is_err());
        let ev = wait_for(&mut rx, |ev| matches!(ev, SessionEvent::JoinFailed { .. })).await;
        match ev {
            SessionEvent::JoinFailed { kind, .. } => assert_eq!(kind, "auth"),
            _ => unreachable!(),
        }
        assert_eq!(h.orchestrator.snapshot().phase, SessionPhase::Idle);
    }
}
