use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::PresenceSettings;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PresenceLinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Present,
    Absent,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub link: PresenceLinkState,
    pub absent_since: Option<DateTime<Utc>>,
    pub absent_time: u64,
}

/// Absence bookkeeping for the camera monitor.
///
/// Only closes intervals; deciding whether a closed interval is worth a
/// penalty is left to the session controller.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    present_marker: String,
    absent_marker: String,
    pub link: PresenceLinkState,
    pub absent_start: Option<DateTime<Utc>>,
    pub absent_time: u64,
}

impl PresenceTracker {
    pub fn new(settings: &PresenceSettings) -> Self {
        Self {
            present_marker: settings.present_marker.to_lowercase(),
            absent_marker: settings.absent_marker.to_lowercase(),
            link: PresenceLinkState::Disconnected,
            absent_start: None,
            absent_time: 0,
        }
    }

    /// The absent marker is checked first since it may contain the present one.
    pub fn classify(&self, message: &str) -> Classification {
        let message = message.to_lowercase();
        if !self.absent_marker.is_empty() && message.contains(&self.absent_marker) {
            Classification::Absent
        } else if !self.present_marker.is_empty() && message.contains(&self.present_marker) {
            Classification::Present
        } else {
            Classification::Unknown
        }
    }

    /// Feeds one detector message. Returns the length of an absence interval
    /// closed by this message, if any.
    pub fn observe(&mut self, message: &str, now: DateTime<Utc>) -> Option<u64> {
        match self.classify(message) {
            Classification::Absent => {
                if self.absent_start.is_none() {
                    self.absent_start = Some(now);
                }
                None
            }
            Classification::Present => self.close(now),
            Classification::Unknown => None,
        }
    }

    /// Closes an open absence interval at `now`.
    pub fn close(&mut self, now: DateTime<Utc>) -> Option<u64> {
        let start = self.absent_start.take()?;
        let secs = (now - start).num_seconds().max(0) as u64;
        self.absent_time = self.absent_time.saturating_add(secs);
        Some(secs)
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            link: self.link,
            absent_since: self.absent_start,
            absent_time: self.absent_time,
        }
    }
}
