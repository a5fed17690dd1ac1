//! Room membership: joining/leaving the media room and keeping render
//! targets in step with remote publishers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use queenlive_core::events::{ClearChat, ClientEvent, SessionEvent};
use queenlive_core::media::{JoinParams, LocalTrack, MediaEngine, RemoteTrack, RenderSurface, RenderTarget};
use queenlive_core::{MediaKind, Participant, Role, Session, SessionError, SessionPhase, StreamId, Uid};
use queenlive_signaling::{ControlPlane, SignalingClient};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::render::{local_label, remote_label, RenderTargets};

/// Room parameters fixed for the lifetime of a controller.
#[derive(Clone, Debug)]
pub struct MembershipConfig {
    pub app_id: String,
    pub channel: String,
    pub host_uid: Uid,
    pub stream_id: StreamId,
}

struct RemoteParticipant {
    participant: Participant,
    audio: Option<Arc<dyn RemoteTrack>>,
    video: Option<Arc<dyn RemoteTrack>>,
}

impl RemoteParticipant {
    fn new(uid: Uid) -> Self {
        Self {
            participant: Participant::publisher(uid),
            audio: None,
            video: None,
        }
    }

    fn stop_all(&mut self) {
        for track in [self.audio.take(), self.video.take()].into_iter().flatten() {
            track.stop();
        }
    }
}

struct MembershipState {
    phase: SessionPhase,
    session: Option<Session>,
    local_tracks: Vec<Arc<dyn LocalTrack>>,
    remotes: HashMap<Uid, RemoteParticipant>,
    targets: RenderTargets,
    join_cancel: Option<CancellationToken>,
    /// Set from the media join call until the join completes or fails.
    media_joining: bool,
    /// Remote publishes seen while `media_joining`.
    deferred: Vec<(Uid, MediaKind)>,
}

/// Owns the media session, local devices, remote participants and their
/// render targets.
pub struct RoomMembershipController {
    engine: Arc<dyn MediaEngine>,
    control: Arc<dyn ControlPlane>,
    signaling: Arc<SignalingClient>,
    config: MembershipConfig,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<MembershipState>,
}

impl RoomMembershipController {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        control: Arc<dyn ControlPlane>,
        signaling: Arc<SignalingClient>,
        surface: Arc<dyn RenderSurface>,
        config: MembershipConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            engine,
            control,
            signaling,
            config,
            events,
            state: Mutex::new(MembershipState {
                phase: SessionPhase::Idle,
                session: None,
                local_tracks: Vec::new(),
                remotes: HashMap::new(),
                targets: RenderTargets::new(surface),
                join_cancel: None,
                media_joining: false,
                deferred: Vec::new(),
            }),
        }
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn session(&self) -> Option<Session> {
        self.state.lock().session.clone()
    }

    pub fn is_joined(&self) -> bool {
        self.state.lock().phase == SessionPhase::Joined
    }

    /// Remote participants ordered by uid.
    pub fn participants(&self) -> Vec<Participant> {
        let state = self.state.lock();
        let mut out: Vec<Participant> = state.remotes.values().map(|r| r.participant.clone()).collect();
        out.sort_by_key(|p| p.uid);
        out
    }

    pub fn render_targets(&self) -> Vec<RenderTarget> {
        self.state.lock().targets.snapshot()
    }

    pub fn render_target(&self, uid: Uid) -> Option<RenderTarget> {
        self.state.lock().targets.get(uid).cloned()
    }

    fn set_phase(state: &mut MembershipState, phase: SessionPhase, events: &broadcast::Sender<SessionEvent>) {
        if state.phase != phase {
            debug!(from = %state.phase, to = %phase, "membership phase");
            state.phase = phase;
            let _ = events.send(SessionEvent::PhaseChanged { phase });
        }
    }

    /// Enter the room. Hosts also open microphone and camera, publish them
    /// and mount their own render target.
    ///
    /// Rejected with [`SessionError::Busy`] unless idle. A concurrent
    /// [`leave`](Self::leave) cancels the join.
    pub async fn join(&self, role: Role, desired_uid: Option<Uid>) -> Result<Session, SessionError> {
        let cancel = {
            let mut state = self.state.lock();
            if state.phase != SessionPhase::Idle {
                return Err(SessionError::Busy);
            }
            Self::set_phase(&mut state, SessionPhase::Joining, &self.events);
            state.media_joining = false;
            state.deferred.clear();
            let token = CancellationToken::new();
            state.join_cancel = Some(token.clone());
            token
        };

        let uid = desired_uid.unwrap_or_else(|| match role {
            Role::Host => self.config.host_uid,
            Role::Audience => Uid::random(),
        });
        info!(%uid, %role, channel = %self.config.channel, "joining room");

        match self.run_join(role, uid, &cancel).await {
            Ok((session, deferred)) => {
                info!(%uid, %role, stream_id = %session.stream_id, "joined room");
                self.replay_deferred(deferred).await;
                Ok(session)
            }
            Err(e) => {
                warn!(%uid, %role, error = %e, kind = e.error_kind(), "join failed");
                self.abort_join().await;
                Err(e)
            }
        }
    }

    async fn run_join(
        &self,
        role: Role,
        uid: Uid,
        cancel: &CancellationToken,
    ) -> Result<(Session, Vec<(Uid, MediaKind)>), SessionError> {
        let token = guarded(cancel, self.control.fetch_rtc_token(&self.config.channel, uid, role)).await?;

        let params = JoinParams {
            app_id: self.config.app_id.clone(),
            channel: self.config.channel.clone(),
            token,
            uid,
        };
        self.state.lock().media_joining = true;
        guarded(cancel, self.engine.join(&params)).await?;
        guarded(cancel, self.engine.set_client_role(role)).await?;

        if role.is_host() {
            let microphone = self.acquire(cancel, self.engine.create_microphone_track()).await?;
            let camera = self.acquire(cancel, self.engine.create_camera_track()).await?;
            guarded(cancel, self.engine.publish(&[microphone, camera.clone()])).await?;

            let target = self.state.lock().targets.ensure(uid, &local_label(uid))?;
            camera.play(&target);
        }

        let mut state = self.state.lock();
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let session = Session {
            local_uid: uid,
            role,
            joined: true,
            stream_id: self.config.stream_id.clone(),
            username: role.username_for(uid),
            joined_at: Utc::now(),
        };
        state.session = Some(session.clone());
        state.join_cancel = None;
        state.media_joining = false;
        let deferred = std::mem::take(&mut state.deferred);
        Self::set_phase(&mut state, SessionPhase::Joined, &self.events);
        Ok((session, deferred))
    }

    /// Apply the remote publishes that arrived while the join was running.
    async fn replay_deferred(&self, deferred: Vec<(Uid, MediaKind)>) {
        for (uid, kind) in deferred {
            debug!(%uid, %kind, "replaying publish seen during join");
            if let Err(e) = self.on_remote_published(uid, kind).await {
                warn!(%uid, %kind, error = %e, "failed to attach remote media");
            }
        }
    }

    /// Await a device and record it. A device arriving after cancellation
    /// is closed immediately.
    async fn acquire<F>(&self, cancel: &CancellationToken, acquisition: F) -> Result<Arc<dyn LocalTrack>, SessionError>
    where
        F: Future<Output = Result<Arc<dyn LocalTrack>, SessionError>>,
    {
        let track = acquisition.await?;
        if cancel.is_cancelled() {
            debug!(kind = %track.kind(), "device arrived after cancellation, closing");
            track.close();
            return Err(SessionError::Cancelled);
        }
        self.state.lock().local_tracks.push(track.clone());
        Ok(track)
    }

    /// Release everything a failed or cancelled join acquired.
    async fn abort_join(&self) {
        let tracks = {
            let mut state = self.state.lock();
            let MembershipState { remotes, targets, .. } = &mut *state;
            for remote in remotes.values_mut() {
                remote.stop_all();
            }
            remotes.clear();
            targets.clear();
            std::mem::take(&mut state.local_tracks)
        };
        for track in &tracks {
            track.close();
        }
        if let Err(e) = self.engine.leave().await {
            debug!(error = %e, "media leave after failed join");
        }
        let mut state = self.state.lock();
        state.session = None;
        state.join_cancel = None;
        state.media_joining = false;
        state.deferred.clear();
        Self::set_phase(&mut state, SessionPhase::Idle, &self.events);
    }

    /// Leave the room: close devices, drop every render target, close the
    /// media session and, for hosts, tell the chat relay to clear the room.
    ///
    /// No-op when idle. During a join this cancels it and releases the
    /// devices acquired so far; the join finishes the teardown.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let (session, tracks) = {
            let mut state = self.state.lock();
            match state.phase {
                SessionPhase::Idle | SessionPhase::Leaving => return Ok(()),
                SessionPhase::Joining => {
                    if let Some(cancel) = state.join_cancel.take() {
                        info!("leave requested during join, cancelling");
                        cancel.cancel();
                    }
                    let tracks = std::mem::take(&mut state.local_tracks);
                    drop(state);
                    for track in &tracks {
                        track.close();
                    }
                    return Ok(());
                }
                SessionPhase::Joined => {}
            }
            Self::set_phase(&mut state, SessionPhase::Leaving, &self.events);

            let MembershipState { remotes, targets, .. } = &mut *state;
            for remote in remotes.values_mut() {
                remote.stop_all();
            }
            remotes.clear();
            targets.clear();
            (state.session.take(), std::mem::take(&mut state.local_tracks))
        };

        for track in &tracks {
            track.close();
        }

        let result = self.engine.leave().await;
        if let Err(e) = &result {
            warn!(error = %e, "media leave failed, local state released anyway");
        }

        if let Some(session) = &session {
            if session.role.is_host() {
                let clear = ClientEvent::ClearChat(ClearChat {
                    stream_id: session.stream_id.clone(),
                });
                if let Err(e) = self.signaling.emit_event(&clear) {
                    warn!(stream_id = %session.stream_id, error = %e, "failed to send clearChat");
                }
            }
            info!(uid = %session.local_uid, "left room");
        }

        Self::set_phase(&mut self.state.lock(), SessionPhase::Idle, &self.events);
        result
    }

    /// A remote user published `kind`. Returns whether the event was applied.
    ///
    /// Publishes arriving after the media session is up but before the join
    /// completes are held and applied once joined.
    pub async fn on_remote_published(&self, uid: Uid, kind: MediaKind) -> Result<bool, SessionError> {
        {
            let mut state = self.state.lock();
            if state.phase == SessionPhase::Joining && state.media_joining {
                debug!(%uid, %kind, "holding publish until join completes");
                if !state.deferred.contains(&(uid, kind)) {
                    state.deferred.push((uid, kind));
                }
                return Ok(false);
            }
            if state.phase != SessionPhase::Joined {
                debug!(%uid, %kind, phase = %state.phase, "ignoring publish while not joined");
                return Ok(false);
            }
            if state.session.as_ref().map(|s| s.local_uid) == Some(uid) {
                return Ok(false);
            }
        }

        let track = self.engine.subscribe(uid, kind).await?;

        let mut state = self.state.lock();
        if state.phase != SessionPhase::Joined {
            track.stop();
            return Ok(false);
        }
        let MembershipState { remotes, targets, .. } = &mut *state;

        let target = match kind {
            MediaKind::Video => match targets.ensure(uid, &remote_label(uid)) {
                Ok(target) => Some(target),
                Err(e) => {
                    track.stop();
                    return Err(e);
                }
            },
            MediaKind::Audio => None,
        };
        track.play(target.as_ref());

        let remote = remotes.entry(uid).or_insert_with(|| RemoteParticipant::new(uid));
        let slot = match kind {
            MediaKind::Audio => &mut remote.audio,
            MediaKind::Video => &mut remote.video,
        };
        if let Some(previous) = slot.replace(track) {
            debug!(%uid, %kind, "replacing previous remote track");
            previous.stop();
        }
        remote.participant.mark(kind, true);
        info!(%uid, %kind, "remote user published");
        let _ = self.events.send(SessionEvent::ParticipantPublished { uid, kind });
        Ok(true)
    }

    /// A remote user unpublished: stop its tracks and drop its target.
    /// Returns whether the uid was known.
    pub fn on_remote_unpublished(&self, uid: Uid) -> bool {
        let mut state = self.state.lock();
        if state.phase == SessionPhase::Joining {
            state.deferred.retain(|(held, _)| *held != uid);
            return false;
        }
        if state.phase != SessionPhase::Joined {
            debug!(%uid, phase = %state.phase, "ignoring unpublish while not joined");
            return false;
        }
        let MembershipState { remotes, targets, .. } = &mut *state;
        let known = match remotes.remove(&uid) {
            Some(mut remote) => {
                remote.stop_all();
                true
            }
            None => false,
        };
        targets.remove(uid);
        if known {
            info!(%uid, "remote user unpublished");
            let _ = self.events.send(SessionEvent::ParticipantUnpublished { uid });
        }
        known
    }
}

async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{EngineCall, MockFaults, MockMediaEngine, MockSurface};
    use queenlive_signaling::mock::{MockControlPlane, MockReply};
    use queenlive_signaling::LoopbackPeer;
    use serde_json::json;
    use std::time::Duration;

    const HOST_UID: Uid = Uid(2_882_341_273);

    struct Harness {
        controller: Arc<RoomMembershipController>,
        engine: Arc<MockMediaEngine>,
        surface: Arc<MockSurface>,
        control: Arc<MockControlPlane>,
        peer: LoopbackPeer,
    }

    fn harness_with(engine: MockMediaEngine) -> Harness {
        let engine = Arc::new(engine);
        let surface = Arc::new(MockSurface::new());
        let control = Arc::new(MockControlPlane::new());
        let (client, peer) = SignalingClient::loopback();
        let (events, _) = broadcast::channel(64);
        let controller = Arc::new(RoomMembershipController::new(
            engine.clone(),
            control.clone(),
            Arc::new(client),
            surface.clone(),
            MembershipConfig {
                app_id: "app".into(),
                channel: "queenlive".into(),
                host_uid: HOST_UID,
                stream_id: StreamId::from(HOST_UID),
            },
            events,
        ));
        Harness {
            controller,
            engine,
            surface,
            control,
            peer,
        }
    }

    fn harness() -> Harness {
        harness_with(MockMediaEngine::new())
    }

    #[tokio::test]
    async fn host_join_publishes_and_mounts_local_target() {
        let h = harness();
        let session = h.controller.join(Role::Host, None).await.unwrap();

        assert!(session.joined);
        assert_eq!(session.role, Role::Host);
        assert_eq!(session.local_uid, HOST_UID);
        assert_eq!(session.stream_id.as_str(), "2882341273");
        assert_eq!(session.username, "Host");
        assert_eq!(h.controller.phase(), SessionPhase::Joined);

        let target = h.controller.render_target(HOST_UID).unwrap();
        assert_eq!(target.id(), "2882341273");
        assert_eq!(target.label(), "You (Host) UID: 2882341273");
        assert_eq!(h.surface.mounted_ids(), vec!["2882341273"]);

        assert_eq!(
            h.engine.calls(),
            vec![
                EngineCall::Join { channel: "queenlive".into(), uid: HOST_UID },
                EngineCall::SetClientRole(Role::Host),
                EngineCall::CreateMicrophone,
                EngineCall::CreateCamera,
                EngineCall::Publish(2),
            ]
        );
        let camera = h
            .engine
            .local_tracks()
            .into_iter()
            .find(|t| t.kind() == MediaKind::Video)
            .unwrap();
        assert_eq!(camera.played_into(), Some(target));
    }

    #[tokio::test]
    async fn audience_join_acquires_no_devices() {
        let h = harness();
        let session = h.controller.join(Role::Audience, Some(Uid(42))).await.unwrap();
        assert_eq!(session.username, "User 42");
        assert!(h.engine.local_tracks().is_empty());
        assert!(h.controller.render_targets().is_empty());
        assert_eq!(h.engine.count(&EngineCall::Publish(2)), 0);
    }

    #[tokio::test]
    async fn audience_uid_is_random_below_bound() {
        let h = harness();
        let session = h.controller.join(Role::Audience, None).await.unwrap();
        assert!(session.local_uid.get() < queenlive_core::ids::RANDOM_UID_BOUND);
    }

    #[tokio::test]
    async fn second_join_is_busy() {
        let h = harness();
        h.controller.join(Role::Audience, Some(Uid(1))).await.unwrap();
        let err = h.controller.join(Role::Audience, Some(Uid(2))).await.unwrap_err();
        assert_eq!(err, SessionError::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_join_is_busy() {
        let h = harness_with(MockMediaEngine::with_faults(MockFaults {
            join_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        }));
        let first = {
            let c = h.controller.clone();
            tokio::spawn(async move { c.join(Role::Audience, Some(Uid(1))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.controller.phase(), SessionPhase::Joining);
        assert_eq!(h.controller.join(Role::Audience, Some(Uid(2))).await.unwrap_err(), SessionError::Busy);
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn auth_failure_returns_to_idle() {
        let h = harness();
        h.control.script_token(MockReply::Err(SessionError::Auth("bad token".into())));
        let err = h.controller.join(Role::Host, None).await.unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
        assert!(h.controller.session().is_none());
        assert_eq!(h.engine.count(&EngineCall::CreateMicrophone), 0);
    }

    #[tokio::test]
    async fn camera_failure_releases_microphone() {
        let h = harness_with(MockMediaEngine::with_faults(MockFaults {
            camera: Some(SessionError::Device("camera busy".into())),
            ..Default::default()
        }));
        let err = h.controller.join(Role::Host, None).await.unwrap_err();
        assert!(matches!(err, SessionError::Device(_)));
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
        assert_eq!(h.engine.local_tracks().len(), 1);
        assert_eq!(h.engine.open_local_tracks(), 0);
        assert!(h.surface.mounted().is_empty());
        assert_eq!(h.engine.count(&EngineCall::Leave), 1);

        // A later join starts clean.
        h.controller.join(Role::Host, None).await.unwrap();
        assert_eq!(h.surface.mounted_ids(), vec!["2882341273"]);
    }

    #[tokio::test]
    async fn mount_failure_fails_host_join_without_partial_state() {
        let h = harness();
        h.surface.fail_mounts(true);
        assert!(h.controller.join(Role::Host, None).await.is_err());
        assert_eq!(h.engine.open_local_tracks(), 0);
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_during_join_releases_late_device() {
        let h = harness_with(MockMediaEngine::with_faults(MockFaults {
            camera_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        }));
        let join = {
            let c = h.controller.clone();
            tokio::spawn(async move { c.join(Role::Host, None).await })
        };

        // Let the join reach the camera acquisition.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.count(&EngineCall::CreateCamera), 1);
        h.controller.leave().await.unwrap();

        let err = join.await.unwrap().unwrap_err();
        assert_eq!(err, SessionError::Cancelled);
        assert_eq!(h.engine.local_tracks().len(), 2);
        assert_eq!(h.engine.open_local_tracks(), 0);
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
        assert!(h.surface.mounted().is_empty());
        assert_eq!(h.engine.count(&EngineCall::Publish(2)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_during_token_fetch_cancels() {
        let h = harness();
        h.control.script_token(MockReply::delayed(Duration::from_secs(5), MockReply::Ok("t".into())));
        let join = {
            let c = h.controller.clone();
            tokio::spawn(async move { c.join(Role::Host, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.controller.leave().await.unwrap();
        assert_eq!(join.await.unwrap().unwrap_err(), SessionError::Cancelled);
        assert!(h.engine.calls().iter().all(|c| !matches!(c, EngineCall::Join { .. })));
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_during_host_join_is_applied_once_joined() {
        let h = harness_with(MockMediaEngine::with_faults(MockFaults {
            camera_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        }));
        let join = {
            let c = h.controller.clone();
            tokio::spawn(async move { c.join(Role::Host, None).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.controller.phase(), SessionPhase::Joining);
        assert!(!h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap());
        assert!(h.controller.render_target(Uid(555)).is_none());

        join.await.unwrap().unwrap();
        let target = h.controller.render_target(Uid(555)).unwrap();
        assert_eq!(target.label(), "Audience UID: 555");
        assert_eq!(h.surface.mounted_ids(), vec!["2882341273", "555"]);
        assert!(h.engine.remote_tracks(Uid(555))[0].is_playing());
        assert!(h.controller.participants()[0].has_video);
    }

    #[tokio::test(start_paused = true)]
    async fn unpublish_during_join_drops_held_publish() {
        let h = harness_with(MockMediaEngine::with_faults(MockFaults {
            camera_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        }));
        let join = {
            let c = h.controller.clone();
            tokio::spawn(async move { c.join(Role::Host, None).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap();
        h.controller.on_remote_published(Uid(556), MediaKind::Audio).await.unwrap();
        assert!(!h.controller.on_remote_unpublished(Uid(555)));

        join.await.unwrap().unwrap();
        assert!(h.controller.render_target(Uid(555)).is_none());
        assert!(h.engine.remote_tracks(Uid(555)).is_empty());
        let participants = h.controller.participants();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].uid, Uid(556));
    }

    #[tokio::test(start_paused = true)]
    async fn held_publishes_are_discarded_when_join_is_cancelled() {
        let h = harness_with(MockMediaEngine::with_faults(MockFaults {
            camera_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        }));
        let join = {
            let c = h.controller.clone();
            tokio::spawn(async move { c.join(Role::Host, None).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap();
        h.controller.leave().await.unwrap();
        assert_eq!(join.await.unwrap().unwrap_err(), SessionError::Cancelled);

        h.controller.join(Role::Audience, Some(Uid(9))).await.unwrap();
        assert!(h.engine.remote_tracks(Uid(555)).is_empty());
        assert!(h.controller.render_targets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_before_media_join_is_ignored() {
        let h = harness();
        h.control.script_token(MockReply::delayed(Duration::from_millis(100), MockReply::Ok("t".into())));
        let join = {
            let c = h.controller.clone();
            tokio::spawn(async move { c.join(Role::Audience, Some(Uid(9))).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap());
        join.await.unwrap().unwrap();
        assert!(h.controller.participants().is_empty());
    }

    #[tokio::test]
    async fn remote_video_gets_exactly_one_target() {
        let h = harness();
        h.controller.join(Role::Audience, Some(Uid(7))).await.unwrap();

        assert!(h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap());
        let target = h.controller.render_target(Uid(555)).unwrap();
        assert_eq!(target.id(), "555");
        assert_eq!(target.label(), "Audience UID: 555");
        let tracks = h.engine.remote_tracks(Uid(555));
        assert!(tracks[0].is_playing());
        assert_eq!(tracks[0].target(), Some(target.clone()));

        // Re-publish replaces the track, not the target.
        h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap();
        assert_eq!(h.surface.mounted_ids(), vec!["555"]);
        assert_eq!(h.surface.total_mounts(), 1);
        let tracks = h.engine.remote_tracks(Uid(555));
        assert!(tracks[0].is_stopped());
        assert!(tracks[1].is_playing());

        assert!(h.controller.on_remote_unpublished(Uid(555)));
        assert!(h.controller.render_target(Uid(555)).is_none());
        assert!(h.surface.mounted().is_empty());
        assert!(h.engine.remote_tracks(Uid(555)).iter().all(|t| t.is_stopped()));
        assert!(h.controller.participants().is_empty());

        // Re-publish after unpublish recreates it.
        h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap();
        assert_eq!(h.surface.mounted_ids(), vec!["555"]);
    }

    #[tokio::test]
    async fn remote_audio_plays_without_target() {
        let h = harness();
        h.controller.join(Role::Audience, Some(Uid(7))).await.unwrap();
        h.controller.on_remote_published(Uid(555), MediaKind::Audio).await.unwrap();

        assert!(h.controller.render_targets().is_empty());
        let track = &h.engine.remote_tracks(Uid(555))[0];
        assert!(track.is_playing());
        assert!(track.target().is_none());
        let participants = h.controller.participants();
        assert!(participants[0].has_audio);
        assert!(!participants[0].has_video);
    }

    #[tokio::test]
    async fn targets_stay_zero_or_one_per_uid() {
        let h = harness();
        h.controller.join(Role::Audience, Some(Uid(7))).await.unwrap();

        let script = [
            (true, MediaKind::Video),
            (true, MediaKind::Video),
            (true, MediaKind::Audio),
            (false, MediaKind::Video),
            (false, MediaKind::Video),
            (true, MediaKind::Audio),
            (true, MediaKind::Video),
            (false, MediaKind::Audio),
        ];
        for (publish, kind) in script {
            if publish {
                h.controller.on_remote_published(Uid(555), kind).await.unwrap();
            } else {
                h.controller.on_remote_unpublished(Uid(555));
            }
            let count = h.surface.mounted_ids().iter().filter(|id| *id == "555").count();
            assert!(count <= 1);
            let has_video = h.controller.participants().iter().any(|p| p.uid == Uid(555) && p.has_video);
            assert_eq!(count == 1, has_video);
        }
    }

    #[tokio::test]
    async fn remote_events_ignored_when_not_joined() {
        let h = harness();
        assert!(!h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap());
        assert!(!h.controller.on_remote_unpublished(Uid(555)));
        assert!(h.engine.calls().is_empty());
        assert!(h.surface.mounted().is_empty());
    }

    #[tokio::test]
    async fn host_leave_clears_everything_and_sends_clear_chat() {
        let mut h = harness();
        h.controller.join(Role::Host, None).await.unwrap();
        h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap();

        h.controller.leave().await.unwrap();
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
        assert!(h.surface.mounted().is_empty());
        assert_eq!(h.engine.open_local_tracks(), 0);
        assert!(h.engine.remote_tracks(Uid(555)).iter().all(|t| t.is_stopped()));
        assert_eq!(
            h.peer.drain_events(),
            vec![("clearChat".to_string(), json!({"streamId": "2882341273"}))]
        );
    }

    #[tokio::test]
    async fn audience_leave_sends_no_clear_chat() {
        let mut h = harness();
        h.controller.join(Role::Audience, Some(Uid(9))).await.unwrap();
        h.controller.leave().await.unwrap();
        assert!(h.peer.drain_events().is_empty());
    }

    #[tokio::test]
    async fn leave_when_idle_is_noop() {
        let h = harness();
        h.controller.leave().await.unwrap();
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn leave_releases_devices_even_when_media_leave_fails() {
        let h = harness();
        h.controller.join(Role::Host, None).await.unwrap();
        h.engine.set_faults(MockFaults {
            leave: Some(SessionError::Network("gone".into())),
            ..Default::default()
        });
        assert!(h.controller.leave().await.is_err());
        assert_eq!(h.engine.open_local_tracks(), 0);
        assert!(h.surface.mounted().is_empty());
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn rejoin_after_leave_has_no_stale_targets() {
        let h = harness();
        h.controller.join(Role::Host, None).await.unwrap();
        h.controller.on_remote_published(Uid(555), MediaKind::Video).await.unwrap();
        h.controller.leave().await.unwrap();

        h.controller.join(Role::Host, None).await.unwrap();
        assert_eq!(h.surface.mounted_ids(), vec!["2882341273"]);
        assert!(h.controller.participants().is_empty());
    }
}
