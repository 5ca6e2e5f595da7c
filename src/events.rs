use std::time::Duration;

use log::trace;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::SessionSummary;
use crate::session::{Notice, SessionSnapshot};

/// Everything the host UI needs to render a session.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "type", content = "payload")]
pub enum UiEvent {
    StateChanged(SessionSnapshot),
    Heartbeat(SessionSnapshot),
    #[serde(rename_all = "camelCase")]
    Notice {
        notice: Notice,
        message: String,
        dismiss_after_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    LocalNotification {
        title: String,
        body: String,
    },
    SessionCompleted(SessionSummary),
}

/// Fire-and-forget channel towards the UI. A closed receiver is not an error.
#[derive(Clone)]
pub struct UiEmitter {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            trace!("UI receiver gone; dropping event");
        }
    }

    pub fn notice(&self, notice: Notice, dismiss_after: Duration) {
        self.emit(UiEvent::Notice {
            message: notice.message(),
            notice,
            dismiss_after_ms: dismiss_after.as_millis() as u64,
        });
    }
}
