use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::StudyApi,
    clock::Clock,
    events::{UiEmitter, UiEvent},
    models::{SessionDescriptor, SessionSummary},
    presence::PresenceController,
    settings::SessionRules,
    store::SessionStorage,
};

use super::{
    controller::{SessionController, END_EARLY_PROMPT},
    error::SessionError,
    events::{Notice, PresenceSignal, SessionEffect, SessionEvent},
    state::{AppLifecycleState, SessionSnapshot},
};

/// Collaborators a runtime needs.
pub struct RuntimeDeps {
    pub storage: SessionStorage,
    pub api: Arc<dyn StudyApi>,
    pub clock: Arc<dyn Clock>,
    pub emitter: UiEmitter,
    pub rules: SessionRules,
    pub request_timeout: Duration,
    pub tick_interval: Duration,
    pub presence: Option<PresenceController>,
}

struct Ticker {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// Drives a [`SessionController`]: owns the 1 s ticker, forwards presence
/// signals and applies the controller's effects against storage, the backend
/// and the UI.
///
/// Ticks and presence signals are serialized through one event pump task, so
/// the controller sees a single ordered stream of events.
#[derive(Clone)]
pub struct SessionRuntime {
    controller: Arc<Mutex<SessionController>>,
    session_key: Arc<str>,
    storage: SessionStorage,
    api: Arc<dyn StudyApi>,
    clock: Arc<dyn Clock>,
    emitter: UiEmitter,
    request_timeout: Duration,
    tick_interval: Duration,
    ticker: Arc<Mutex<Option<Ticker>>>,
    presence: Option<Arc<Mutex<PresenceController>>>,
    presence_tx: mpsc::UnboundedSender<PresenceSignal>,
    tick_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
    notice_dismiss: Duration,
}

impl SessionRuntime {
    /// Loads persisted stats, initializes the controller (accounting the
    /// relaunch gap when `last_active` is given) and starts ticking.
    pub async fn launch(
        deps: RuntimeDeps,
        descriptor: SessionDescriptor,
        last_active: Option<DateTime<Utc>>,
    ) -> Self {
        let stats = deps.storage.load_stats(&descriptor.session_key).await;
        let presence = deps.presence.filter(|presence| {
            let usable = descriptor.ai_enabled && presence.camera_permitted();
            if descriptor.ai_enabled && !usable {
                warn!("AI monitoring requested but camera permission is missing");
            }
            usable
        });

        let session_key: Arc<str> = Arc::from(descriptor.session_key.as_str());
        let notice_dismiss = Duration::from_secs(deps.rules.notice_dismiss_secs);
        let controller = SessionController::new(
            descriptor,
            stats,
            deps.rules,
            presence.as_ref().map(|presence| presence.settings()),
        );

        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let runtime = Self {
            controller: Arc::new(Mutex::new(controller)),
            session_key,
            storage: deps.storage,
            api: deps.api,
            clock: deps.clock,
            emitter: deps.emitter,
            request_timeout: deps.request_timeout,
            tick_interval: deps.tick_interval,
            ticker: Arc::new(Mutex::new(None)),
            presence: presence.map(|presence| Arc::new(Mutex::new(presence))),
            presence_tx,
            tick_tx,
            shutdown: CancellationToken::new(),
            notice_dismiss,
        };

        runtime.spawn_event_pump(tick_rx, presence_rx);

        {
            let mut controller = runtime.controller.lock().await;
            let effects = controller.initialize(last_active, runtime.clock.now());
            runtime.apply(effects).await;
        }
        runtime.emit_state_changed().await;

        info!("Session {} running", runtime.session_key);
        runtime
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.controller.lock().await.snapshot(self.clock.now())
    }

    pub async fn is_ended(&self) -> bool {
        self.controller.lock().await.is_ended()
    }

    /// Resolves once the session has been finalized.
    pub async fn finished(&self) {
        self.shutdown.cancelled().await
    }

    pub async fn tick(&self) {
        self.dispatch(SessionEvent::Tick).await;
        let snapshot = self.snapshot().await;
        self.emitter.emit(UiEvent::Heartbeat(snapshot));
    }

    pub async fn on_lifecycle(&self, state: AppLifecycleState) {
        self.dispatch(SessionEvent::Lifecycle(state)).await;
        self.emit_state_changed().await;
    }

    pub fn end_early_prompt(&self) -> &'static str {
        END_EARLY_PROMPT
    }

    /// Finalizes locally regardless of how the server call fares.
    pub async fn confirm_end_early(&self) -> Result<SessionSummary, SessionError> {
        let summary = self
            .dispatch(SessionEvent::EndEarlyConfirmed)
            .await
            .ok_or(SessionError::SessionEnded)?;
        self.emit_state_changed().await;
        Ok(summary)
    }

    pub async fn disable_presence(&self) {
        self.dispatch(SessionEvent::DisablePresence).await;
        self.emit_state_changed().await;
    }

    /// `true` means the back gesture was swallowed.
    pub async fn intercept_back(&self) -> bool {
        self.controller.lock().await.intercepts_back()
    }

    /// Tears the runtime down without ending the session, e.g. when the
    /// screen goes away. Open absence time is flushed first and the session
    /// stays persisted for a later resume.
    pub async fn detach(&self) {
        {
            let mut controller = self.controller.lock().await;
            if !controller.is_ended() {
                let now = self.clock.now();
                let mut effects = controller.handle(SessionEvent::DisablePresence, now);
                effects.push(SessionEffect::PersistStats(controller.stats().clone()));
                self.apply(effects).await;
            }
        }
        self.stop_ticker().await;
        self.shutdown.cancel();
        info!("Session {} detached", self.session_key);
    }

    async fn dispatch(&self, event: SessionEvent) -> Option<SessionSummary> {
        let mut controller = self.controller.lock().await;
        let effects = controller.handle(event, self.clock.now());
        // Applied under the lock so persistence writes land in event order.
        self.apply(effects).await
    }

    async fn apply(&self, effects: Vec<SessionEffect>) -> Option<SessionSummary> {
        let mut finished = None;

        for effect in effects {
            match effect {
                SessionEffect::PersistStats(stats) => {
                    if let Err(err) = self.storage.save_stats(&self.session_key, &stats).await {
                        warn!("{err:#}");
                    }
                }
                SessionEffect::PersistLastActive(at) => {
                    if let Err(err) = self.storage.save_last_active(at).await {
                        warn!("{err:#}");
                    }
                }
                SessionEffect::ClearLastActive => {
                    if let Err(err) = self.storage.clear_last_active().await {
                        warn!("{err:#}");
                    }
                }
                SessionEffect::ClearSession { session_key } => {
                    if let Err(err) = self.storage.clear_session(&session_key).await {
                        error!("Failed to clear persisted session {session_key}: {err:#}");
                    }
                }
                SessionEffect::ReportPenalty { report, source } => {
                    let api = self.api.clone();
                    let timeout = self.request_timeout;
                    tokio::spawn(async move {
                        match time::timeout(timeout, api.report_penalty(&report)).await {
                            Ok(Ok(())) => info!(
                                "Reported {} minute(s) of {source:?} penalty for {}",
                                report.duration_minutes, report.session_id
                            ),
                            Ok(Err(err)) => warn!("Penalty report failed: {err:#}"),
                            Err(_) => warn!("Penalty report timed out after {timeout:?}"),
                        }
                    });
                }
                SessionEffect::EndEarlyRemote { session_id } => {
                    let api = self.api.clone();
                    let emitter = self.emitter.clone();
                    let timeout = self.request_timeout;
                    let dismiss = self.notice_dismiss;
                    tokio::spawn(async move {
                        let reason = match time::timeout(timeout, api.end_session_early(&session_id)).await {
                            Ok(Ok(())) => return,
                            Ok(Err(err)) => format!("{err:#}"),
                            Err(_) => format!("no response within {timeout:?}"),
                        };
                        warn!("End-early call for {session_id} failed: {reason}");
                        emitter.notice(Notice::EndEarlyFailed { reason }, dismiss);
                    });
                }
                SessionEffect::ScheduleNotification { title, body } => {
                    self.emitter.emit(UiEvent::LocalNotification { title, body });
                }
                SessionEffect::ShowNotice {
                    notice,
                    dismiss_after,
                } => self.emitter.notice(notice, dismiss_after),
                SessionEffect::EnsureTicker => self.ensure_ticker().await,
                SessionEffect::StopTicker => self.stop_ticker().await,
                SessionEffect::ConnectPresence => self.connect_presence().await,
                SessionEffect::DisconnectPresence => self.disconnect_presence().await,
                SessionEffect::Finished(summary) => {
                    self.emitter.emit(UiEvent::SessionCompleted(summary.clone()));
                    self.shutdown.cancel();
                    finished = Some(summary);
                }
            }
        }

        finished
    }

    async fn ensure_ticker(&self) {
        let mut guard = self.ticker.lock().await;
        if let Some(ticker) = guard.as_ref() {
            if !ticker.handle.is_finished() && !ticker.token.is_cancelled() {
                return;
            }
        }

        let token = self.shutdown.child_token();
        let tick_tx = self.tick_tx.clone();
        let interval = self.tick_interval;
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        // A tick still queued covers this one; elapsed time is
                        // recomputed from the anchor anyway.
                        if let Err(mpsc::error::TrySendError::Closed(_)) = tick_tx.try_send(()) {
                            break;
                        }
                    }
                }
            }
        });

        *guard = Some(Ticker { handle, token });
    }

    /// Cancels rather than aborts so an in-flight tick is never cut short.
    async fn stop_ticker(&self) {
        if let Some(ticker) = self.ticker.lock().await.take() {
            ticker.token.cancel();
        }
    }

    async fn connect_presence(&self) {
        let Some(presence) = &self.presence else {
            return;
        };
        let mut presence = presence.lock().await;
        if let Err(err) = presence.stop().await {
            warn!("Previous presence loop ended badly: {err:#}");
        }
        if let Err(err) = presence.start(self.presence_tx.clone()) {
            warn!("Presence monitoring not started: {err:#}");
            let _ = self.presence_tx.send(PresenceSignal::Disconnected);
        }
    }

    async fn disconnect_presence(&self) {
        let Some(presence) = &self.presence else {
            return;
        };
        if let Err(err) = presence.lock().await.stop().await {
            warn!("Presence loop ended badly: {err:#}");
        }
    }

    fn spawn_event_pump(
        &self,
        mut ticks: mpsc::Receiver<()>,
        mut signals: mpsc::UnboundedReceiver<PresenceSignal>,
    ) {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = runtime.shutdown.cancelled() => break,
                    tick = ticks.recv() => match tick {
                        Some(()) => runtime.tick().await,
                        None => break,
                    },
                    signal = signals.recv() => match signal {
                        Some(signal) => {
                            runtime.dispatch(SessionEvent::Presence(signal)).await;
                        }
                        None => break,
                    },
                }
            }
        });
    }

    async fn emit_state_changed(&self) {
        let snapshot = self.snapshot().await;
        self.emitter.emit(UiEvent::StateChanged(snapshot));
    }
}
