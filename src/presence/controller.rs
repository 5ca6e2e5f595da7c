use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::session::PresenceSignal;
use crate::settings::PresenceSettings;

use super::camera::FrameSource;
use super::loop_worker::presence_loop;
use super::socket::PresenceConnector;

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns the lifetime of the presence socket loop. A stopped monitor is
/// reconnected from scratch, never resumed.
pub struct PresenceController {
    connector: Arc<dyn PresenceConnector>,
    camera: Arc<dyn FrameSource>,
    settings: PresenceSettings,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl PresenceController {
    pub fn new(
        connector: Arc<dyn PresenceConnector>,
        camera: Arc<dyn FrameSource>,
        settings: PresenceSettings,
    ) -> Self {
        Self {
            connector,
            camera,
            settings,
            handle: None,
            cancel_token: None,
        }
    }

    pub fn camera_permitted(&self) -> bool {
        self.camera.permission_granted()
    }

    pub fn settings(&self) -> &PresenceSettings {
        &self.settings
    }

    /// A loop that ended on its own (socket error) does not count as active.
    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn start(&mut self, signals: mpsc::UnboundedSender<PresenceSignal>) -> Result<()> {
        if self.is_active() {
            bail!("presence monitoring already active");
        }
        if !self.camera.permission_granted() {
            bail!("camera permission not granted");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(presence_loop(
            self.connector.clone(),
            self.camera.clone(),
            self.settings.clone(),
            signals,
            cancel_token.clone(),
        ));

        info!("Presence monitoring started");
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Cancels the loop and waits at most [`STOP_TIMEOUT`] for it to wind
    /// down before aborting it, so callers are never held by a stuck socket.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(joined) => joined.context("presence loop task failed to join"),
            Err(_) => {
                warn!("Presence loop did not stop within {STOP_TIMEOUT:?}; aborting it");
                handle.abort();
                Ok(())
            }
        }
    }
}
