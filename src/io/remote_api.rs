//! Remote location API client
//!
//! Endpoints (relative to the configured base URL):
//! - `POST api/safe-zone/location/update/` - position + breach flag
//! - `GET  api/safe-zone/zone/` - zone definitions for the patient
//! - `GET  api/safe-zone/location/history/` - recent positions
//! - `POST api/safe-zone/safe-exit/toggle/` - caregiver override

use crate::domain::types::{HistoryEntry, Submission, ZoneDefinition};
use crate::infra::config::Config;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

const LOCATION_UPDATE_PATH: &str = "api/safe-zone/location/update/";
const ZONE_PATH: &str = "api/safe-zone/zone/";
const HISTORY_PATH: &str = "api/safe-zone/location/history/";
const SAFE_EXIT_PATH: &str = "api/safe-zone/safe-exit/toggle/";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("invalid response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait RemoteLocationApi: Send + Sync {
    /// Submit a position; any 2xx is success
    async fn submit_position(&self, submission: &Submission) -> Result<(), ApiError>;

    /// Fetch the patient's zone definition, if one is configured
    async fn fetch_zone(&self) -> Result<Option<ZoneDefinition>, ApiError>;

    /// Fetch recent positions in whatever order the server returns them
    async fn fetch_history(&self) -> Result<Vec<HistoryEntry>, ApiError>;

    /// Set the safe-exit override; returns the value the server stored
    async fn set_safe_exit(&self, active: bool) -> Result<bool, ApiError>;
}

/// HTTP implementation backed by a pooled reqwest client
pub struct HttpLocationApi {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SafeExitResponse {
    safe_exit_active: bool,
}

impl HttpLocationApi {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder().timeout(config.api_timeout()).build()?;

        Ok(Self {
            client,
            base_url: Self::normalize_base_url(config.api_base_url()),
            access_token: config.api_access_token().map(str::to_string),
        })
    }

    fn normalize_base_url(url: &str) -> String {
        if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{url}/")
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.header("Authorization", format!("JWT {token}")),
            None => request,
        }
    }

    fn check_status(response: &reqwest::Response) -> Result<(), ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::Status(status.as_u16()))
        }
    }
}

#[async_trait]
impl RemoteLocationApi for HttpLocationApi {
    async fn submit_position(&self, submission: &Submission) -> Result<(), ApiError> {
        let start = Instant::now();
        let response = self
            .authorize(self.client.post(self.url(LOCATION_UPDATE_PATH)))
            .json(submission)
            .send()
            .await?;
        Self::check_status(&response)?;

        debug!(
            latency_ms = %start.elapsed().as_millis(),
            status = %response.status().as_u16(),
            "location_update_posted"
        );
        Ok(())
    }

    async fn fetch_zone(&self) -> Result<Option<ZoneDefinition>, ApiError> {
        let response = self.authorize(self.client.get(self.url(ZONE_PATH))).send().await?;
        Self::check_status(&response)?;

        let zones: Vec<ZoneDefinition> =
            response.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(zones.into_iter().next())
    }

    async fn fetch_history(&self) -> Result<Vec<HistoryEntry>, ApiError> {
        let response = self.authorize(self.client.get(self.url(HISTORY_PATH))).send().await?;
        Self::check_status(&response)?;

        response.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn set_safe_exit(&self, active: bool) -> Result<bool, ApiError> {
        let response = self
            .authorize(self.client.post(self.url(SAFE_EXIT_PATH)))
            .json(&serde_json::json!({ "active": active }))
            .send()
            .await?;
        Self::check_status(&response)?;

        let body: SafeExitResponse =
            response.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
        info!(safe_exit_active = %body.safe_exit_active, "safe_exit_synced");
        Ok(body.safe_exit_active)
    }
}

/// Sort history by the server-assigned `timestamp`, oldest first
///
/// The list endpoint promises no order. The backend stamps each row when the
/// submission arrives and the wire format carries no capture time, so a
/// queued retry sorts after any live sample that reached the server first.
pub fn sort_history(mut entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    entries.sort_by_key(|entry| entry.timestamp);
    entries
}
