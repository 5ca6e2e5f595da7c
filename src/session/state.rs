use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::SessionStats;
use crate::presence::PresenceSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    Loading,
    Running,
    Backgrounded,
    Ended,
}

/// Host application lifecycle as reported by the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AppLifecycleState {
    Active,
    Inactive,
    Background,
}

impl AppLifecycleState {
    pub fn is_foreground(self) -> bool {
        matches!(self, AppLifecycleState::Active)
    }
}

/// In-memory countdown bookkeeping. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct RuntimeTimerState {
    pub remaining: u64,
    /// Anchor for every elapsed-time computation.
    pub start_timestamp: Option<DateTime<Utc>>,
    pub bg_start: Option<DateTime<Utc>>,
    pub ended: bool,
    pub foreground_secs: u64,
    pub foreground_since: Option<DateTime<Utc>>,
}

impl RuntimeTimerState {
    pub fn close_foreground(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.foreground_since.take() {
            let secs = (now - since).num_seconds().max(0) as u64;
            self.foreground_secs = self.foreground_secs.saturating_add(secs);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub session_key: String,
    pub subject: String,
    pub duration_secs: u64,
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
    pub completed_percent: u8,
    pub stats: SessionStats,
    pub presence: Option<PresenceSnapshot>,
}
