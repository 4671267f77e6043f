use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::redact_response_body;

#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("completion returned an empty response")]
    Empty,

    #[error("completion request failed: {0}")]
    Http(String),

    #[error("completion backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid completion response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: None,
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        system: &str,
        user: &str,
        options: &CompletionOptions,
    ) -> Result<String, CompletionError>;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CompletionError>;

    async fn describe_image(
        &self,
        image_base64: &str,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, CompletionError>;
}

/// Tries the local backend first under a short deadline and falls back to
/// the remote one on timeout, error or an empty answer.
pub struct FallbackCompletion {
    local: Arc<dyn CompletionProvider>,
    remote: Arc<dyn CompletionProvider>,
    local_timeout: Duration,
    remote_timeout: Duration,
}

impl FallbackCompletion {
    pub fn new(
        local: Arc<dyn CompletionProvider>,
        remote: Arc<dyn CompletionProvider>,
        local_timeout: Duration,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            local,
            remote,
            local_timeout,
            remote_timeout,
        }
    }
}

async fn with_deadline<T, F>(limit: Duration, future: F) -> Result<T, CompletionError>
where
    F: Future<Output = Result<T, CompletionError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(CompletionError::Timeout(limit)),
    }
}

fn non_empty(text: String) -> Result<String, CompletionError> {
    if text.trim().is_empty() {
        Err(CompletionError::Empty)
    } else {
        Ok(text)
    }
}

#[async_trait]
impl CompletionProvider for FallbackCompletion {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn complete(
        &self,
        system: &str,
        user: &str,
        options: &CompletionOptions,
    ) -> Result<String, CompletionError> {
        let local = with_deadline(self.local_timeout, self.local.complete(system, user, options))
            .await
            .and_then(non_empty);
        match local {
            Ok(text) => return Ok(text),
            Err(error) => warn!(
                "{} completion failed, falling back to {}: {}",
                self.local.name(),
                self.remote.name(),
                error
            ),
        }

        with_deadline(self.remote_timeout, self.remote.complete(system, user, options))
            .await
            .and_then(non_empty)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CompletionError> {
        match with_deadline(self.local_timeout, self.local.embed(texts)).await {
            Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
            Ok(vectors) => debug!(
                "{} returned {} embeddings for {} inputs",
                self.local.name(),
                vectors.len(),
                texts.len()
            ),
            Err(error) => debug!("{} embedding failed: {}", self.local.name(), error),
        }

        let vectors = with_deadline(self.remote_timeout, self.remote.embed(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(CompletionError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    async fn describe_image(
        &self,
        image_base64: &str,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, CompletionError> {
        let local = with_deadline(
            self.remote_timeout,
            self.local.describe_image(image_base64, mime_type, prompt),
        )
        .await
        .and_then(non_empty);
        if let Ok(text) = local {
            return Ok(text);
        }

        with_deadline(
            self.remote_timeout,
            self.remote.describe_image(image_base64, mime_type, prompt),
        )
        .await
        .and_then(non_empty)
    }
}

/// POSTs a JSON body and decodes a JSON reply, mapping transport failures
/// onto [`CompletionError`].
pub(crate) async fn post_json<B, R>(
    client: &Client,
    url: &str,
    bearer: Option<&str>,
    body: &B,
) -> Result<R, CompletionError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let mut request = client.post(url).json(body);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|error| {
        if error.is_connect() {
            CompletionError::Unavailable(format!("{url}: {error}"))
        } else if error.is_timeout() {
            CompletionError::Http(format!("{url}: timed out"))
        } else {
            CompletionError::Http(format!("{url}: {error}"))
        }
    })?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|error| CompletionError::Http(format!("read response body: {error}")))?;
    if !status.is_success() {
        return Err(CompletionError::Http(format!(
            "status={} body={}",
            status,
            redact_response_body(&text)
        )));
    }

    serde_json::from_str(&text)
        .map_err(|error| CompletionError::InvalidResponse(format!("{error}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{CompletionError, CompletionOptions, CompletionProvider, FallbackCompletion};

    enum Behaviour {
        Reply(&'static str),
        Hang,
        Fail,
    }

    struct Scripted(Behaviour);

    #[async_trait]
    impl CompletionProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _system: &str,
            _user: &str,
            _options: &CompletionOptions,
        ) -> Result<String, CompletionError> {
            match self.0 {
                Behaviour::Reply(text) => Ok(text.to_string()),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("too late".to_string())
                }
                Behaviour::Fail => Err(CompletionError::Unavailable("down".to_string())),
            }
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CompletionError> {
            match self.0 {
                Behaviour::Fail => Err(CompletionError::Unavailable("down".to_string())),
                _ => Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect()),
            }
        }

        async fn describe_image(
            &self,
            _image_base64: &str,
            _mime_type: &str,
            _prompt: &str,
        ) -> Result<String, CompletionError> {
            Err(CompletionError::Unavailable("no vision".to_string()))
        }
    }

    fn fallback(local: Behaviour, remote: Behaviour) -> FallbackCompletion {
        FallbackCompletion::new(
            Arc::new(Scripted(local)),
            Arc::new(Scripted(remote)),
            Duration::from_secs(6),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn local_timeout_falls_back_to_remote() {
        let completion = fallback(Behaviour::Hang, Behaviour::Reply("Hello"));
        let reply = completion
            .complete("system", "user", &CompletionOptions::default())
            .await
            .expect("remote reply");
        assert_eq!(reply, "Hello");
    }

    #[tokio::test]
    async fn empty_local_answer_counts_as_failure() {
        let completion = fallback(Behaviour::Reply("   "), Behaviour::Reply("remote"));
        let reply = completion
            .complete("system", "user", &CompletionOptions::default())
            .await
            .expect("remote reply");
        assert_eq!(reply, "remote");
    }

    #[tokio::test]
    async fn both_backends_failing_is_an_error() {
        let completion = fallback(Behaviour::Fail, Behaviour::Reply(""));
        let result = completion
            .complete("system", "user", &CompletionOptions::default())
            .await;
        assert!(matches!(result, Err(CompletionError::Empty)));
    }

    #[tokio::test]
    async fn embeddings_fall_back_per_call() {
        let completion = fallback(Behaviour::Fail, Behaviour::Reply(""));
        let vectors = completion
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .expect("remote embeddings");
        assert_eq!(vectors.len(), 2);
    }
}
