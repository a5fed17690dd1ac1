//! Recording media engine and render surface for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use queenlive_core::events::MediaEvent;
use queenlive_core::media::{JoinParams, LocalTrack, MediaEngine, RemoteTrack, RenderSurface, RenderTarget};
use queenlive_core::{MediaKind, Role, SessionError, Uid};
use tokio::sync::mpsc;

/// Engine operations in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCall {
    Join { channel: String, uid: Uid },
    SetClientRole(Role),
    CreateMicrophone,
    CreateCamera,
    Publish(usize),
    Subscribe(Uid, MediaKind),
    Leave,
}

pub struct MockLocalTrack {
    kind: MediaKind,
    closed: AtomicBool,
    played_into: Mutex<Option<RenderTarget>>,
}

impl MockLocalTrack {
    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            closed: AtomicBool::new(false),
            played_into: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn played_into(&self) -> Option<RenderTarget> {
        self.played_into.lock().clone()
    }
}

impl LocalTrack for MockLocalTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn play(&self, target: &RenderTarget) {
        *self.played_into.lock() = Some(target.clone());
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

pub struct MockRemoteTrack {
    uid: Uid,
    kind: MediaKind,
    playing: AtomicBool,
    stopped: AtomicBool,
    target: Mutex<Option<RenderTarget>>,
}

impl MockRemoteTrack {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> Option<RenderTarget> {
        self.target.lock().clone()
    }
}

impl RemoteTrack for MockRemoteTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn play(&self, target: Option<&RenderTarget>) {
        *self.target.lock() = target.cloned();
        self.playing.store(true, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::Relaxed);
        self.stopped.store(true, Ordering::Relaxed);
    }
}

/// Scriptable failures and delays.
#[derive(Default)]
pub struct MockFaults {
    pub join: Option<SessionError>,
    pub microphone: Option<SessionError>,
    pub camera: Option<SessionError>,
    pub publish: Option<SessionError>,
    pub leave: Option<SessionError>,
    pub join_delay: Option<Duration>,
    pub camera_delay: Option<Duration>,
}

pub struct MockMediaEngine {
    calls: Mutex<Vec<EngineCall>>,
    faults: Mutex<MockFaults>,
    local_tracks: Mutex<Vec<Arc<MockLocalTrack>>>,
    remote_tracks: Mutex<Vec<Arc<MockRemoteTrack>>>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaEngine {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(MockFaults::default()),
            local_tracks: Mutex::new(Vec::new()),
            remote_tracks: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn with_faults(faults: MockFaults) -> Self {
        let engine = Self::new();
        *engine.faults.lock() = faults;
        engine
    }

    pub fn set_faults(&self, faults: MockFaults) {
        *self.faults.lock() = faults;
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &EngineCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn local_tracks(&self) -> Vec<Arc<MockLocalTrack>> {
        self.local_tracks.lock().clone()
    }

    pub fn open_local_tracks(&self) -> usize {
        self.local_tracks.lock().iter().filter(|t| !t.is_closed()).count()
    }

    pub fn remote_tracks(&self, uid: Uid) -> Vec<Arc<MockRemoteTrack>> {
        self.remote_tracks.lock().iter().filter(|t| t.uid == uid).cloned().collect()
    }

    /// Push a remote-user notification as the SDK would.
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events_tx.send(event);
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }

    async fn acquire(&self, kind: MediaKind) -> Result<Arc<dyn LocalTrack>, SessionError> {
        let (fault, delay) = {
            let mut faults = self.faults.lock();
            match kind {
                MediaKind::Audio => (faults.microphone.take(), None),
                MediaKind::Video => (faults.camera.take(), faults.camera_delay),
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = fault {
            return Err(err);
        }
        let track = Arc::new(MockLocalTrack::new(kind));
        self.local_tracks.lock().push(track.clone());
        Ok(track)
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn join(&self, params: &JoinParams) -> Result<(), SessionError> {
        self.record(EngineCall::Join {
            channel: params.channel.clone(),
            uid: params.uid,
        });
        let (fault, delay) = {
            let mut faults = self.faults.lock();
            (faults.join.take(), faults.join_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        fault.map_or(Ok(()), Err)
    }

    async fn set_client_role(&self, role: Role) -> Result<(), SessionError> {
        self.record(EngineCall::SetClientRole(role));
        Ok(())
    }

    async fn create_microphone_track(&self) -> Result<Arc<dyn LocalTrack>, SessionError> {
        self.record(EngineCall::CreateMicrophone);
        self.acquire(MediaKind::Audio).await
    }

    async fn create_camera_track(&self) -> Result<Arc<dyn LocalTrack>, SessionError> {
        self.record(EngineCall::CreateCamera);
        self.acquire(MediaKind::Video).await
    }

    async fn publish(&self, tracks: &[Arc<dyn LocalTrack>]) -> Result<(), SessionError> {
        self.record(EngineCall::Publish(tracks.len()));
        self.faults.lock().publish.take().map_or(Ok(()), Err)
    }

    async fn subscribe(&self, uid: Uid, kind: MediaKind) -> Result<Arc<dyn RemoteTrack>, SessionError> {
        self.record(EngineCall::Subscribe(uid, kind));
        let track = Arc::new(MockRemoteTrack {
            uid,
            kind,
            playing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            target: Mutex::new(None),
        });
        self.remote_tracks.lock().push(track.clone());
        Ok(track)
    }

    async fn leave(&self) -> Result<(), SessionError> {
        self.record(EngineCall::Leave);
        self.faults.lock().leave.take().map_or(Ok(()), Err)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.events_rx.lock().take()
    }
}

/// Surface that keeps mounted targets in a list.
#[derive(Default)]
pub struct MockSurface {
    mounted: Mutex<VecDeque<RenderTarget>>,
    mounts: AtomicUsize,
    fail_mounts: AtomicBool,
}

impl MockSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mounted(&self) -> Vec<RenderTarget> {
        self.mounted.lock().iter().cloned().collect()
    }

    pub fn mounted_ids(&self) -> Vec<String> {
        self.mounted.lock().iter().map(|t| t.id().to_string()).collect()
    }

    pub fn total_mounts(&self) -> usize {
        self.mounts.load(Ordering::Relaxed)
    }

    pub fn fail_mounts(&self, fail: bool) {
        self.fail_mounts.store(fail, Ordering::Relaxed);
    }
}

impl RenderSurface for MockSurface {
    fn mount(&self, id: &str, label: &str) -> Result<RenderTarget, SessionError> {
        if self.fail_mounts.load(Ordering::Relaxed) {
            return Err(SessionError::Device(format!("cannot mount {id}")));
        }
        self.mounts.fetch_add(1, Ordering::Relaxed);
        let target = RenderTarget::new(id, label);
        self.mounted.lock().push_back(target.clone());
        Ok(target)
    }

    fn unmount(&self, target: &RenderTarget) {
        self.mounted.lock().retain(|t| t != target);
    }
}
