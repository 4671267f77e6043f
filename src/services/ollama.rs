use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::completion::{post_json, CompletionError, CompletionOptions, CompletionProvider};

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

/// Local backend speaking the Ollama HTTP API.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
    embed_model: String,
    vision_model: String,
}

impl OllamaBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        embed_model: impl Into<String>,
        vision_model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            embed_model: embed_model.into(),
            vision_model: vision_model.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl CompletionProvider for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        system: &str,
        user: &str,
        options: &CompletionOptions,
    ) -> Result<String, CompletionError> {
        let mut model_options = json!({ "temperature": options.temperature });
        if let Some(max_tokens) = options.max_tokens {
            model_options["num_predict"] = json!(max_tokens);
        }

        let body = json!({
            "model": self.model,
            "system": system,
            "prompt": user,
            "stream": false,
            "options": model_options,
        });
        let reply: GenerateResponse =
            post_json(&self.client, &self.endpoint("api/generate"), None, &body).await?;
        Ok(reply.response.trim().to_string())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CompletionError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.embed_model,
            "input": texts,
        });
        let reply: EmbedResponse =
            post_json(&self.client, &self.endpoint("api/embed"), None, &body).await?;
        if reply.embeddings.len() != texts.len() {
            return Err(CompletionError::InvalidResponse(format!(
                "ollama returned {} embeddings for {} inputs",
                reply.embeddings.len(),
                texts.len()
            )));
        }
        Ok(reply.embeddings)
    }

    async fn describe_image(
        &self,
        image_base64: &str,
        _mime_type: &str,
        prompt: &str,
    ) -> Result<String, CompletionError> {
        let body = json!({
            "model": self.vision_model,
            "prompt": prompt,
            "images": [image_base64],
            "stream": false,
        });
        let reply: GenerateResponse =
            post_json(&self.client, &self.endpoint("api/generate"), None, &body).await?;
        Ok(reply.response.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{EmbedResponse, GenerateResponse, OllamaBackend};

    #[test]
    fn endpoint_joins_without_double_slash() {
        let backend = OllamaBackend::new("http://localhost:11434/", "m", "e", "v");
        assert_eq!(
            backend.endpoint("api/generate"),
            "http://localhost:11434/api/generate"
        );
    }

    #[test]
    fn responses_decode() {
        let generated: GenerateResponse =
            serde_json::from_str(r#"{"model":"m","response":" Szia! ","done":true}"#)
                .expect("decode generate");
        assert_eq!(generated.response.trim(), "Szia!");

        let embedded: EmbedResponse =
            serde_json::from_str(r#"{"embeddings":[[0.1,0.2],[0.3,0.4]]}"#).expect("decode embed");
        assert_eq!(embedded.embeddings.len(), 2);
    }
}
