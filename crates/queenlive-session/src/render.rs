use std::collections::HashMap;
use std::sync::Arc;

use queenlive_core::media::{RenderSurface, RenderTarget};
use queenlive_core::{SessionError, Uid};
use tracing::debug;

/// Label for the local host tile.
pub fn local_label(uid: Uid) -> String {
    format!("You (Host) UID: {uid}")
}

/// Label for a remote participant tile.
pub fn remote_label(uid: Uid) -> String {
    format!("Audience UID: {uid}")
}

/// At most one mounted render target per uid.
pub struct RenderTargets {
    surface: Arc<dyn RenderSurface>,
    targets: HashMap<Uid, RenderTarget>,
}

impl RenderTargets {
    pub fn new(surface: Arc<dyn RenderSurface>) -> Self {
        Self {
            surface,
            targets: HashMap::new(),
        }
    }

    /// Existing target for `uid`, or a freshly mounted one.
    pub fn ensure(&mut self, uid: Uid, label: &str) -> Result<RenderTarget, SessionError> {
        if let Some(target) = self.targets.get(&uid) {
            return Ok(target.clone());
        }
        let target = self.surface.mount(&uid.to_string(), label)?;
        debug!(%uid, label, "render target mounted");
        self.targets.insert(uid, target.clone());
        Ok(target)
    }

    pub fn remove(&mut self, uid: Uid) -> bool {
        match self.targets.remove(&uid) {
            Some(target) => {
                self.surface.unmount(&target);
                debug!(%uid, "render target unmounted");
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for (_, target) in self.targets.drain() {
            self.surface.unmount(&target);
        }
    }

    pub fn get(&self, uid: Uid) -> Option<&RenderTarget> {
        self.targets.get(&uid)
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.targets.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets ordered by uid.
    pub fn snapshot(&self) -> Vec<RenderTarget> {
        let mut entries: Vec<_> = self.targets.iter().collect();
        entries.sort_by_key(|(uid, _)| **uid);
        entries.into_iter().map(|(_, t)| t.clone()).collect()
    }
}
