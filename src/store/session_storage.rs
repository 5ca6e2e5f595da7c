use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::warn;

use crate::models::{SessionDescriptor, SessionStats};

use super::KeyValueStore;

pub const CURRENT_SESSION_KEY: &str = "CURRENT_STUDY_SESSION";
pub const STATS_KEY_PREFIX: &str = "CURRENT_STUDY_SESSION_STATS_";
pub const LAST_ACTIVE_TIME_KEY: &str = "LAST_ACTIVE_TIME";

pub fn stats_key(session_key: &str) -> String {
    format!("{STATS_KEY_PREFIX}{session_key}")
}

/// Typed access to the session keys. Reads are best-effort: anything missing
/// or unparsable comes back as "nothing stored".
#[derive(Clone)]
pub struct SessionStorage {
    store: Arc<dyn KeyValueStore>,
}

impl SessionStorage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load_descriptor(&self) -> Option<SessionDescriptor> {
        let raw = self.read(CURRENT_SESSION_KEY).await?;
        match serde_json::from_str(&raw) {
            Ok(descriptor) => Some(descriptor),
            Err(err) => {
                warn!("Discarding unparsable session descriptor: {err}");
                None
            }
        }
    }

    pub async fn save_descriptor(&self, descriptor: &SessionDescriptor) -> Result<()> {
        let raw = serde_json::to_string(descriptor).context("failed to encode descriptor")?;
        self.store
            .set(CURRENT_SESSION_KEY, &raw)
            .await
            .context("failed to persist session descriptor")
    }

    /// Falls back to zeroed stats when nothing usable is stored.
    pub async fn load_stats(&self, session_key: &str) -> SessionStats {
        let Some(raw) = self.read(&stats_key(session_key)).await else {
            return SessionStats::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!("Stats for session {session_key} unparsable ({err}); starting fresh");
            SessionStats::default()
        })
    }

    pub async fn save_stats(&self, session_key: &str, stats: &SessionStats) -> Result<()> {
        let raw = serde_json::to_string(stats).context("failed to encode stats")?;
        self.store
            .set(&stats_key(session_key), &raw)
            .await
            .with_context(|| format!("failed to persist stats for {session_key}"))
    }

    pub async fn load_last_active(&self) -> Option<DateTime<Utc>> {
        let raw = self.read(LAST_ACTIVE_TIME_KEY).await?;
        let millis = match raw.trim().parse::<i64>() {
            Ok(millis) => millis,
            Err(err) => {
                warn!("Ignoring malformed last-active marker {raw:?}: {err}");
                return None;
            }
        };
        Utc.timestamp_millis_opt(millis).single()
    }

    pub async fn save_last_active(&self, at: DateTime<Utc>) -> Result<()> {
        self.store
            .set(LAST_ACTIVE_TIME_KEY, &at.timestamp_millis().to_string())
            .await
            .context("failed to persist last-active marker")
    }

    pub async fn clear_last_active(&self) -> Result<()> {
        self.store
            .remove(LAST_ACTIVE_TIME_KEY)
            .await
            .context("failed to clear last-active marker")
    }

    /// Removes the descriptor and the stats of `session_key`. Both removals
    /// are attempted even if the first one fails.
    pub async fn clear_session(&self, session_key: &str) -> Result<()> {
        let descriptor = self.store.remove(CURRENT_SESSION_KEY).await;
        let stats = self.store.remove(&stats_key(session_key)).await;
        descriptor.context("failed to remove session descriptor")?;
        stats.with_context(|| format!("failed to remove stats for {session_key}"))
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to read {key}: {err:#}");
                None
            }
        }
    }
}
