use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;

use crate::settings::ApiSettings;

use super::{CreateSessionRequest, PenaltyReport, StudyApi};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    #[serde(alias = "id", alias = "_id")]
    session_id: serde_json::Value,
}

/// REST client for the study backend. Every request carries the configured
/// client-side timeout so a hung call cannot stall the caller.
#[derive(Clone)]
pub struct HttpStudyApi {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpStudyApi {
    pub fn new(settings: &ApiSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            auth_token: settings.auth_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn ensure_success(response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("{what} failed with {status}: {body}")
    }
}

#[async_trait]
impl StudyApi for HttpStudyApi {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<String> {
        let response = self
            .authorized(self.client.post(self.url("/session")))
            .json(request)
            .send()
            .await
            .context("create-session request failed")?;
        let response = Self::ensure_success(response, "create-session").await?;

        let body: CreateSessionResponse = response
            .json()
            .await
            .context("create-session response was not valid JSON")?;

        let session_id = match body.session_id {
            serde_json::Value::String(id) => id,
            serde_json::Value::Number(id) => id.to_string(),
            other => return Err(anyhow!("unexpected session id in response: {other}")),
        };
        info!("Created remote session {session_id} for {}", request.subject);
        Ok(session_id)
    }

    async fn report_penalty(&self, report: &PenaltyReport) -> Result<()> {
        let response = self
            .authorized(self.client.post(self.url("/penalty")))
            .json(report)
            .send()
            .await
            .context("penalty request failed")?;
        Self::ensure_success(response, "penalty report").await?;
        debug!(
            "Reported {} penalty minute(s) for session {}",
            report.duration_minutes, report.session_id
        );
        Ok(())
    }

    async fn end_session_early(&self, session_id: &str) -> Result<()> {
        let response = self
            .authorized(self.client.post(self.url("/session/end-early")))
            .json(&json!({ "sessionId": session_id }))
            .send()
            .await
            .context("end-early request failed")?;
        Self::ensure_success(response, "end-early").await?;
        info!("Session {session_id} ended early on the server");
        Ok(())
    }
}
