use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::completion::{post_json, CompletionError, CompletionOptions, CompletionProvider};

pub const OPENAI_KEY_SECRET: &str = "OPENAI_API_KEY";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Remote backend for any OpenAI-compatible `/chat/completions` service.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    embed_model: String,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("embed_model", &self.embed_model)
            .finish()
    }
}

impl OpenAiBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        embed_model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model: model.into(),
            embed_model: embed_model.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn key(&self) -> Result<&str, CompletionError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| CompletionError::Unavailable(format!("{OPENAI_KEY_SECRET} is not set")))
    }

    async fn chat(&self, messages: Value, options: &CompletionOptions) -> Result<String, CompletionError> {
        let key = self.key()?;
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let reply: ChatResponse =
            post_json(&self.client, &self.endpoint("chat/completions"), Some(key), &body).await?;
        Ok(reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

#[async_trait]
impl CompletionProvider for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        system: &str,
        user: &str,
        options: &CompletionOptions,
    ) -> Result<String, CompletionError> {
        let messages = json!([
            { "role": "system", "content": system },
            { "role": "user", "content": user }
        ]);
        self.chat(messages, options).await
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CompletionError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let key = self.key()?;
        let body = json!({
            "model": self.embed_model,
            "input": texts,
        });
        let mut reply: EmbeddingResponse =
            post_json(&self.client, &self.endpoint("embeddings"), Some(key), &body).await?;
        reply.data.sort_by_key(|item| item.index);
        Ok(reply.data.into_iter().map(|item| item.embedding).collect())
    }

    async fn describe_image(
        &self,
        image_base64: &str,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, CompletionError> {
        let messages = json!([{
            "role": "user",
            "content": [
                { "type": "text", "text": prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:{mime_type};base64,{image_base64}") }
                }
            ]
        }]);
        self.chat(messages, &CompletionOptions::default()).await
    }
}
