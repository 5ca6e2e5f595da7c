pub mod api;
pub mod clock;
pub mod events;
pub mod models;
pub mod presence;
pub mod session;
pub mod settings;
pub mod store;
mod utils;

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use log::{info, warn};
use tokio::sync::mpsc;

use api::{CreateSessionRequest, HttpStudyApi, StudyApi};
use clock::{Clock, SystemClock};
use events::{UiEmitter, UiEvent};
use models::{SessionDescriptor, MAX_DURATION_SECS};
use presence::{FrameSource, PresenceConnector, PresenceController, WsPresenceConnector};
use session::{RuntimeDeps, SessionError, SessionRuntime};
use settings::{SettingsStore, StudySettings};
use store::{KeyValueStore, SessionStorage, SqliteStore};

pub use utils::logging::init_logging;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Camera plus detector connection used for AI-monitored sessions.
pub struct PresenceDeps {
    pub connector: Arc<dyn PresenceConnector>,
    pub camera: Arc<dyn FrameSource>,
}

/// Entry point for a host shell: starts new sessions and resumes the one a
/// previous process left behind.
pub struct StudyApp {
    storage: SessionStorage,
    api: Arc<dyn StudyApi>,
    clock: Arc<dyn Clock>,
    settings: StudySettings,
    emitter: UiEmitter,
    presence: Option<PresenceDeps>,
    tick_interval: Duration,
}

impl StudyApp {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn StudyApi>,
        clock: Arc<dyn Clock>,
        settings: StudySettings,
        emitter: UiEmitter,
    ) -> Self {
        Self {
            storage: SessionStorage::new(store),
            api,
            clock,
            settings,
            emitter,
            presence: None,
            tick_interval: TICK_INTERVAL,
        }
    }

    /// Production wiring: settings file and SQLite store under `data_dir`,
    /// HTTP backend, wall clock and a websocket presence detector fed by
    /// `camera`.
    pub fn open(
        data_dir: &Path,
        camera: Option<Arc<dyn FrameSource>>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<UiEvent>)> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let settings_store = SettingsStore::new(data_dir.join("settings.json"))?;
        let settings = settings_store.current();
        let store = SqliteStore::new(data_dir.join("studytrack.sqlite3"))?;
        let api = HttpStudyApi::new(&settings.api)?;
        let (emitter, ui_events) = UiEmitter::channel();

        let connector: Arc<dyn PresenceConnector> =
            Arc::new(WsPresenceConnector::new(settings.presence.socket_url.clone()));
        let mut app = Self::new(
            Arc::new(store),
            Arc::new(api),
            Arc::new(SystemClock),
            settings,
            emitter,
        );
        if let Some(camera) = camera {
            app = app.with_presence(PresenceDeps { connector, camera });
        }

        info!("Study tracker ready (data in {})", data_dir.display());
        Ok((app, ui_events))
    }

    pub fn with_presence(mut self, presence: PresenceDeps) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn settings(&self) -> &StudySettings {
        &self.settings
    }

    /// The persisted descriptor, if a session is in progress.
    pub async fn active_session(&self) -> Option<SessionDescriptor> {
        self.storage.load_descriptor().await
    }

    /// Registers the session with the backend, persists its descriptor and
    /// starts the countdown.
    pub async fn start_session(
        &self,
        subject: &str,
        duration_minutes: u64,
        ai_enabled: bool,
    ) -> Result<SessionRuntime, SessionError> {
        let duration_secs = duration_minutes
            .checked_mul(60)
            .filter(|secs| (1..=MAX_DURATION_SECS).contains(secs))
            .ok_or(SessionError::InvalidDuration)?;

        let request = CreateSessionRequest {
            subject: subject.to_string(),
            duration_minutes,
            ai_enabled,
        };
        let session_id = tokio::time::timeout(
            self.settings.api.request_timeout(),
            self.api.create_session(&request),
        )
        .await
        .context("create-session request timed out")?
        .context("failed to create session on the server")?;

        let descriptor = SessionDescriptor::new(
            subject,
            duration_secs,
            Some(session_id),
            ai_enabled,
            self.clock.now(),
        );
        self.storage.save_descriptor(&descriptor).await?;
        if let Err(err) = self.storage.clear_last_active().await {
            warn!("{err:#}");
        }

        Ok(self.launch(descriptor, None).await)
    }

    /// Resumes from the descriptor handed over by navigation, or else from
    /// the persisted one. Time since the last recorded activity is accounted
    /// as time away.
    pub async fn resume_session(
        &self,
        from_navigation: Option<SessionDescriptor>,
    ) -> Result<SessionRuntime, SessionError> {
        let descriptor = match from_navigation {
            Some(descriptor) => descriptor,
            None => self
                .storage
                .load_descriptor()
                .await
                .ok_or(SessionError::MissingSession)?,
        };
        if !descriptor.has_valid_duration() {
            return Err(SessionError::InvalidDuration);
        }
        let last_active = self.storage.load_last_active().await;
        Ok(self.launch(descriptor, last_active).await)
    }

    async fn launch(
        &self,
        descriptor: SessionDescriptor,
        last_active: Option<chrono::DateTime<chrono::Utc>>,
    ) -> SessionRuntime {
        let presence = self.presence.as_ref().map(|deps| {
            PresenceController::new(
                deps.connector.clone(),
                deps.camera.clone(),
                self.settings.presence.clone(),
            )
        });

        let deps = RuntimeDeps {
            storage: self.storage.clone(),
            api: self.api.clone(),
            clock: self.clock.clone(),
            emitter: self.emitter.clone(),
            rules: self.settings.rules.clone().with_env_overrides(),
            request_timeout: self.settings.api.request_timeout(),
            tick_interval: self.tick_interval,
            presence,
        };
        SessionRuntime::launch(deps, descriptor, last_active).await
    }
}
