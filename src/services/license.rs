use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use super::redact_response_body;

/// Without quota data, the demo ends after this many sent replies.
pub const DEMO_SEND_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("license request failed: {0}")]
    Http(String),

    #[error("license service is not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrialStatus {
    pub trial_end_date: Option<DateTime<Utc>>,
    pub remaining_generations: Option<i64>,
}

#[async_trait]
pub trait LicenseService: Send + Sync {
    async fn check_trial_status(&self, license_key: &str) -> Result<TrialStatus, LicenseError>;

    async fn decrement_generations(&self, email: &str) -> Result<bool, LicenseError>;
}

/// Used when no license backend is configured: unlimited, never decrements.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLicenseService;

#[async_trait]
impl LicenseService for NoopLicenseService {
    async fn check_trial_status(&self, _license_key: &str) -> Result<TrialStatus, LicenseError> {
        Err(LicenseError::NotConfigured)
    }

    async fn decrement_generations(&self, _email: &str) -> Result<bool, LicenseError> {
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct HttpLicenseService {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct DecrementResponse {
    #[serde(default)]
    success: bool,
}

impl HttpLicenseService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn read_body(response: reqwest::Response) -> Result<String, LicenseError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| LicenseError::Http(format!("read license response: {error}")))?;
        if !status.is_success() {
            return Err(LicenseError::Http(format!(
                "status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl LicenseService for HttpLicenseService {
    async fn check_trial_status(&self, license_key: &str) -> Result<TrialStatus, LicenseError> {
        let response = self
            .client
            .get(self.endpoint("trial-status"))
            .query(&[("licence", license_key)])
            .send()
            .await
            .map_err(|error| LicenseError::Http(error.to_string()))?;
        let body = Self::read_body(response).await?;
        serde_json::from_str(&body)
            .map_err(|error| LicenseError::Http(format!("decode trial status: {error}")))
    }

    async fn decrement_generations(&self, email: &str) -> Result<bool, LicenseError> {
        let response = self
            .client
            .post(self.endpoint("generations/decrement"))
            .json(&json!({ "email": email }))
            .send()
            .await
            .map_err(|error| LicenseError::Http(error.to_string()))?;
        let body = Self::read_body(response).await?;
        let decoded: DecrementResponse = serde_json::from_str(&body)
            .map_err(|error| LicenseError::Http(format!("decode decrement response: {error}")))?;
        Ok(decoded.success)
    }
}

/// Quota fields decide when present; otherwise the sent count does. A
/// failed status lookup never ends the demo.
pub fn is_demo_over(status: &Result<TrialStatus, LicenseError>, sent_count: usize, now: DateTime<Utc>) -> bool {
    let Ok(status) = status else {
        return false;
    };

    if status.trial_end_date.is_none() && status.remaining_generations.is_none() {
        return sent_count >= DEMO_SEND_LIMIT;
    }

    status.remaining_generations.is_some_and(|remaining| remaining <= 0)
        || status.trial_end_date.is_some_and(|end| end <= now)
}
