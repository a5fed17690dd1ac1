//! Seams to the RTC SDK and to the on-screen render surface.
//!
//! The session core never talks to media hardware or a display directly:
//! `MediaEngine` wraps the RTC SDK client, `RenderSurface` owns the
//! containers video tracks are played into.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;

use crate::errors::SessionError;
use crate::events::MediaEvent;
use crate::ids::Uid;
use crate::types::{MediaKind, Role};

/// Handle to a mounted on-screen container.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderTarget {
    id: String,
    label: String,
}

impl RenderTarget {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

pub trait RenderSurface: Send + Sync {
    fn mount(&self, id: &str, label: &str) -> Result<RenderTarget, SessionError>;
    fn unmount(&self, target: &RenderTarget);
}

/// A capture device opened by this client.
pub trait LocalTrack: Send + Sync {
    fn kind(&self) -> MediaKind;
    fn play(&self, target: &RenderTarget);
    /// Release the underlying device. Must be idempotent.
    fn close(&self);
}

/// A subscribed remote track.
pub trait RemoteTrack: Send + Sync {
    fn kind(&self) -> MediaKind;
    /// Video plays into a target; audio plays without one.
    fn play(&self, target: Option<&RenderTarget>);
    fn stop(&self);
}

/// Parameters for entering an RTC channel.
pub struct JoinParams {
    pub app_id: String,
    pub channel: String,
    pub token: SecretString,
    pub uid: Uid,
}

impl fmt::Debug for JoinParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinParams")
            .field("app_id", &self.app_id)
            .field("channel", &self.channel)
            .field("token", &"[redacted]")
            .field("uid", &self.uid)
            .finish()
    }
}

/// The RTC SDK client, one per membership controller.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn join(&self, params: &JoinParams) -> Result<(), SessionError>;
    async fn set_client_role(&self, role: Role) -> Result<(), SessionError>;
    async fn create_microphone_track(&self) -> Result<Arc<dyn LocalTrack>, SessionError>;
    async fn create_camera_track(&self) -> Result<Arc<dyn LocalTrack>, SessionError>;
    async fn publish(&self, tracks: &[Arc<dyn LocalTrack>]) -> Result<(), SessionError>;
    async fn subscribe(&self, uid: Uid, kind: MediaKind) -> Result<Arc<dyn RemoteTrack>, SessionError>;
    async fn leave(&self) -> Result<(), SessionError>;

    /// Remote user notifications. Yields the receiver once; later calls return `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn join_params_debug_redacts_token() {
        let params = JoinParams {
            app_id: "app".into(),
            channel: "queenlive".into(),
            token: SecretString::from("very-secret".to_string()),
            uid: Uid(7),
        };
        let dbg = format!("{params:?}");
        assert!(!dbg.contains("very-secret"));
        assert!(dbg.contains("redacted"));
        assert_eq!(params.token.expose_secret(), "very-secret");
    }

    #[test]
    fn render_target_accessors() {
        let t = RenderTarget::new("555", "Audience UID: 555");
        assert_eq!(t.id(), "555");
        assert_eq!(t.label(), "Audience UID: 555");
    }
}
