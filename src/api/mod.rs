use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod http;

pub use http::HttpStudyApi;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub subject: String,
    pub duration_minutes: u64,
    pub ai_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PenaltyReport {
    pub session_id: String,
    pub duration_minutes: u64,
}

/// Remote backend owning points and penalties.
#[async_trait]
pub trait StudyApi: Send + Sync {
    /// Returns the server-assigned session id.
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<String>;

    async fn report_penalty(&self, report: &PenaltyReport) -> Result<()>;

    async fn end_session_early(&self, session_id: &str) -> Result<()>;
}
