use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::Result;

/// Local audio capture.
#[async_trait]
pub trait LocalMedia: Send + Sync {
    /// Fails with `MediaUnavailable` when capture is denied or missing.
    async fn acquire(&self) -> Result<()>;
    /// Enables or disables every captured track at once.
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

/// Process-wide capture shared by every peer session.
///
/// Acquired lazily on the first call attempt and stopped when the last
/// session goes away. Mute state survives re-acquisition.
pub struct SharedMedia {
    source: Arc<dyn LocalMedia>,
    acquired: bool,
    muted: bool,
}

impl SharedMedia {
    pub fn new(source: Arc<dyn LocalMedia>) -> Self {
        Self {
            source,
            acquired: false,
            muted: false,
        }
    }

    pub async fn ensure(&mut self) -> Result<()> {
        if self.acquired {
            return Ok(());
        }
        self.source.acquire().await?;
        self.acquired = true;
        self.source.set_enabled(!self.muted);
        info!(muted = self.muted, "local media acquired");
        Ok(())
    }

    pub fn release(&mut self) {
        if !self.acquired {
            return;
        }
        self.source.stop();
        self.acquired = false;
        info!("local media released");
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if self.acquired {
            self.source.set_enabled(!muted);
        }
        debug!(muted, acquired = self.acquired, "mute toggled");
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }
}
