use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use super::redact_response_body;
use crate::store::models::AuthState;
use crate::store::token_cache::{CachedAccessToken, TokenCache};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const TOKEN_URL_ENV: &str = "AIMAIL_GMAIL_TOKEN_URL";
const CACHE_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no valid gmail token: {0}")]
    NoValidToken(String),

    #[error("gmail token request failed: {0}")]
    Http(String),

    #[error("gmail token cache: {0}")]
    Crypto(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl From<CachedAccessToken> for AccessToken {
    fn from(cached: CachedAccessToken) -> Self {
        Self {
            token: cached.access_token,
            expires_at: cached.expires_at,
        }
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn gmail_token(&self) -> Result<AccessToken, CredentialError>;

    /// Forgets any cached token, e.g. after the API answered 401.
    async fn invalidate(&self) {}

    fn secret(&self, name: &str) -> Option<String> {
        env_value(name)
    }
}

#[derive(Debug, Clone)]
struct GmailCredentials {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

impl GmailCredentials {
    fn resolve(auth: &AuthState) -> Result<Self, CredentialError> {
        let stored = auth.credentials.as_ref();
        let pick = |env: &str, field: Option<&String>, label: &str| {
            env_value(env)
                .or_else(|| {
                    field
                        .map(|value| value.trim().to_string())
                        .filter(|value| !value.is_empty())
                })
                .ok_or_else(|| {
                    CredentialError::NoValidToken(format!("missing gmail {label} ({env}/auth state)"))
                })
        };

        Ok(Self {
            client_id: pick(
                "AIMAIL_GMAIL_CLIENT_ID",
                stored.and_then(|c| c.client_id.as_ref()),
                "client id",
            )?,
            client_secret: pick(
                "AIMAIL_GMAIL_CLIENT_SECRET",
                stored.and_then(|c| c.client_secret.as_ref()),
                "client secret",
            )?,
            refresh_token: pick(
                "AIMAIL_GMAIL_REFRESH_TOKEN",
                stored.and_then(|c| c.refresh_token.as_ref()),
                "refresh token",
            )?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct OAuthTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: u64,
    scope: Option<String>,
}

/// Refreshes Gmail access tokens from a stored refresh token. Browser
/// consent happens elsewhere; this only renews.
pub struct StoredCredentials {
    auth: AuthState,
    client: Client,
    cache: Option<TokenCache>,
    current: Mutex<Option<CachedAccessToken>>,
}

impl StoredCredentials {
    pub fn new(auth: AuthState, cache: Option<TokenCache>) -> Self {
        Self {
            auth,
            client: Client::new(),
            cache,
            current: Mutex::new(None),
        }
    }

    async fn fetch_token(&self, credentials: &GmailCredentials) -> Result<CachedAccessToken, CredentialError> {
        let token_url = env_value(TOKEN_URL_ENV).unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string());

        let response = self
            .client
            .post(&token_url)
            .form(&[
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("refresh_token", credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|error| CredentialError::Http(format!("request token from {token_url}: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| CredentialError::Http(format!("read token response: {error}")))?;
        if status.as_u16() == 400 || status.as_u16() == 401 {
            return Err(CredentialError::NoValidToken(format!(
                "refresh rejected: status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }
        if !status.is_success() {
            return Err(CredentialError::Http(format!(
                "status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|error| CredentialError::Http(format!("decode token response: {error}")))?;
        let expires_at = Utc::now()
            + Duration::seconds((payload.expires_in as i64).saturating_sub(CACHE_SKEW_SECONDS));

        Ok(CachedAccessToken {
            access_token: payload.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl CredentialProvider for StoredCredentials {
    async fn gmail_token(&self) -> Result<AccessToken, CredentialError> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref().filter(|token| !token.is_expired()) {
            return Ok(token.clone().into());
        }

        if let Some(cached) = self.cache.as_ref().and_then(TokenCache::load) {
            *current = Some(cached.clone());
            return Ok(cached.into());
        }

        let credentials = GmailCredentials::resolve(&self.auth)?;
        let fresh = self.fetch_token(&credentials).await?;
        if let Some(cache) = self.cache.as_ref() {
            if let Err(error) = cache.store(&fresh) {
                warn!("failed to cache gmail token: {:#}", error);
            }
        }
        *current = Some(fresh.clone());
        Ok(fresh.into())
    }

    async fn invalidate(&self) {
        *self.current.lock().await = None;
        if let Some(cache) = self.cache.as_ref() {
            if let Err(error) = cache.clear() {
                warn!("failed to clear gmail token cache: {:#}", error);
            }
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
