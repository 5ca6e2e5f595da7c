use serde::{Deserialize, Serialize};

use super::BackgroundLog;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    Completed,
    EndedEarly,
}

/// What the user sees once a session is over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_key: String,
    pub session_id: Option<String>,
    pub subject: String,
    pub reason: FinishReason,
    pub completed_percent: u8,
    pub studied_secs: u64,
    pub in_app_secs: u64,
    pub out_of_app_secs: u64,
    pub background_exit_count: u32,
    pub violation_count: u32,
    pub background_logs: Vec<BackgroundLog>,
}
