use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The active session as persisted under `CURRENT_STUDY_SESSION`.
///
/// `start_time` is stored as epoch milliseconds and `duration` in seconds so
/// the JSON stays readable by older clients of the same store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    pub duration: u64,
    pub subject: String,
    pub session_key: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub ai_enabled: bool,
}

/// Upper bound on a session's length. Longer descriptors are rejected.
pub const MAX_DURATION_SECS: u64 = 24 * 60 * 60;

impl SessionDescriptor {
    pub fn new(
        subject: impl Into<String>,
        duration_secs: u64,
        session_id: Option<String>,
        ai_enabled: bool,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            start_time,
            duration: duration_secs,
            subject: subject.into(),
            session_key: Uuid::new_v4().to_string(),
            session_id,
            ai_enabled,
        }
    }

    pub fn has_valid_duration(&self) -> bool {
        (1..=MAX_DURATION_SECS).contains(&self.duration)
    }

    /// Saturates at the latest representable instant.
    pub fn ends_at(&self) -> DateTime<Utc> {
        i64::try_from(self.duration)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|duration| self.start_time.checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
