use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundLog {
    pub time: String,
    pub duration: u64,
}

/// Accumulated statistics for one session, persisted under
/// `CURRENT_STUDY_SESSION_STATS_<sessionKey>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStats {
    pub total_background_time: u64,
    pub background_exit_count: u32,
    pub violation_count: u32,
    pub completed_percent: u8,
    pub total_study_time: u64,
    pub background_logs: Vec<BackgroundLog>,
}

impl SessionStats {
    /// Accounts one closed background interval. Returns `true` when the
    /// interval counts as a violation.
    pub fn record_background(
        &mut self,
        time: String,
        duration_secs: u64,
        violation_threshold_secs: u64,
    ) -> bool {
        self.background_logs.push(BackgroundLog {
            time,
            duration: duration_secs,
        });
        self.background_exit_count = self.background_exit_count.saturating_add(1);
        self.total_background_time = self.total_background_time.saturating_add(duration_secs);

        let violation = duration_secs > violation_threshold_secs;
        if violation {
            self.violation_count = self.violation_count.saturating_add(1);
        }
        violation
    }
}
