use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::PenaltyReport;
use crate::models::{SessionStats, SessionSummary};

use super::state::AppLifecycleState;

/// Signals coming out of the presence monitor's socket loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceSignal {
    Connected,
    Message(String),
    Disconnected,
}

/// Inputs to the session transition function.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Tick,
    Lifecycle(AppLifecycleState),
    Presence(PresenceSignal),
    /// The user confirmed the end-early prompt.
    EndEarlyConfirmed,
    /// The user switched camera monitoring off mid-session.
    DisablePresence,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PenaltySource {
    Background,
    Absence,
}

/// Transient on-screen messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Notice {
    Milestone { percent: u8 },
    TimeWarning { remaining_secs: u64 },
    AwayTooLong { secs: u64 },
    AbsentTooLong { secs: u64 },
    EndEarlyFailed { reason: String },
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::Milestone { percent } => {
                format!("Great focus! You're {percent}% of the way through this session.")
            }
            Notice::TimeWarning { remaining_secs } => {
                let minutes = remaining_secs / 60;
                if minutes == 1 {
                    "1 minute left. Finish strong!".to_string()
                } else {
                    format!("{minutes} minutes left. Finish strong!")
                }
            }
            Notice::AwayTooLong { secs } => {
                format!("You were away for {secs}s. Leaving the app for over a minute costs points.")
            }
            Notice::AbsentTooLong { secs } => {
                format!("You were away from the camera for {secs}s. A penalty has been applied.")
            }
            Notice::EndEarlyFailed { reason } => {
                format!("Could not reach the server to end the session: {reason}")
            }
        }
    }
}

/// Side effects requested by the controller, applied by the runtime in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    PersistStats(SessionStats),
    PersistLastActive(DateTime<Utc>),
    ClearLastActive,
    ReportPenalty {
        report: PenaltyReport,
        source: PenaltySource,
    },
    EndEarlyRemote {
        session_id: String,
    },
    ScheduleNotification {
        title: String,
        body: String,
    },
    ShowNotice {
        notice: Notice,
        dismiss_after: Duration,
    },
    EnsureTicker,
    StopTicker,
    ConnectPresence,
    DisconnectPresence,
    ClearSession {
        session_key: String,
    },
    Finished(SessionSummary),
}
