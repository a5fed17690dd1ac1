//! A media engine and render surface without real media, for the CLI.
//!
//! The headless engine joins instantly and hands out synthetic devices.
//! Remote users already in the room are announced on join, the way an RTC
//! SDK reports existing publishers; others can be simulated with
//! [`HeadlessEngine::inject`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use queenlive_core::events::MediaEvent;
use queenlive_core::media::{JoinParams, LocalTrack, MediaEngine, RemoteTrack, RenderSurface, RenderTarget};
use queenlive_core::{MediaKind, Role, SessionError, Uid};
use tokio::sync::mpsc;
use tracing::{debug, info};

struct SyntheticTrack {
    kind: MediaKind,
    closed: AtomicBool,
}

impl LocalTrack for SyntheticTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn play(&self, target: &RenderTarget) {
        debug!(kind = %self.kind, target = target.id(), "local track playing");
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            debug!(kind = %self.kind, "local device released");
        }
    }
}

struct SyntheticRemote {
    uid: Uid,
    kind: MediaKind,
}

impl RemoteTrack for SyntheticRemote {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn play(&self, target: Option<&RenderTarget>) {
        debug!(uid = %self.uid, kind = %self.kind, target = target.map(|t| t.id()), "remote track playing");
    }

    fn stop(&self) {
        debug!(uid = %self.uid, kind = %self.kind, "remote track stopped");
    }
}

pub struct HeadlessEngine {
    joined: Mutex<Option<(String, Uid)>>,
    publishers: Vec<Uid>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
}

impl Default for HeadlessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessEngine {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            joined: Mutex::new(None),
            publishers: Vec::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// A remote user publishing audio and video before we join.
    pub fn with_publisher(mut self, uid: Uid) -> Self {
        self.publishers.push(uid);
        self
    }

    /// Simulate a remote user event.
    pub fn inject(&self, event: MediaEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn is_joined(&self) -> bool {
        self.joined.lock().is_some()
    }
}

#[async_trait]
impl MediaEngine for HeadlessEngine {
    async fn join(&self, params: &JoinParams) -> Result<(), SessionError> {
        info!(channel = %params.channel, uid = %params.uid, "headless media join");
        *self.joined.lock() = Some((params.channel.clone(), params.uid));
        for &uid in self.publishers.iter().filter(|&&uid| uid != params.uid) {
            for kind in [MediaKind::Audio, MediaKind::Video] {
                self.inject(MediaEvent::UserPublished { uid, kind });
            }
        }
        Ok(())
    }

    async fn set_client_role(&self, role: Role) -> Result<(), SessionError> {
        debug!(%role, "client role set");
        Ok(())
    }

    async fn create_microphone_track(&self) -> Result<Arc<dyn LocalTrack>, SessionError> {
        Ok(Arc::new(SyntheticTrack {
            kind: MediaKind::Audio,
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_camera_track(&self) -> Result<Arc<dyn LocalTrack>, SessionError> {
        Ok(Arc::new(SyntheticTrack {
            kind: MediaKind::Video,
            closed: AtomicBool::new(false),
        }))
    }

    async fn publish(&self, tracks: &[Arc<dyn LocalTrack>]) -> Result<(), SessionError> {
        info!(tracks = tracks.len(), "headless publish");
        Ok(())
    }

    async fn subscribe(&self, uid: Uid, kind: MediaKind) -> Result<Arc<dyn RemoteTrack>, SessionError> {
        if !self.is_joined() {
            return Err(SessionError::NotJoined);
        }
        Ok(Arc::new(SyntheticRemote { uid, kind }))
    }

    async fn leave(&self) -> Result<(), SessionError> {
        if let Some((channel, uid)) = self.joined.lock().take() {
            info!(%channel, %uid, "headless media leave");
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.events_rx.lock().take()
    }
}

/// Render surface that only logs.
#[derive(Default)]
pub struct LogSurface;

impl RenderSurface for LogSurface {
    fn mount(&self, id: &str, label: &str) -> Result<RenderTarget, SessionError> {
        info!(id, label, "video tile mounted");
        Ok(RenderTarget::new(id, label))
    }

    fn unmount(&self, target: &RenderTarget) {
        info!(id = target.id(), label = target.label(), "video tile removed");
    }
}
