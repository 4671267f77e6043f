use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::message::{Attachment, InlineImage, Message, MessageId, OutgoingMessage};
use super::mime::{build_raw_mime, encode_for_gmail, extract_data_uri_images, html_entity_decode, html_to_text};
use super::{
    FetchMode, ProviderClient, ProviderError, SendError, SendErrorKind, SendResult, UNREAD_LIMIT,
};
use crate::services::credentials::CredentialProvider;
use crate::services::redact_response_body;
use crate::store::models::ProviderKind;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const MAX_TRANSPORT_RETRIES: usize = 3;
const UNREAD_QUERY: &str = "in:inbox is:unread";

/// Whether a call may be repeated after the connection failed mid-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Safe,
    Never,
}

/// Failure of one Gmail REST call, before it is mapped per operation.
#[derive(Debug)]
struct ApiFailure {
    status: Option<StatusCode>,
    message: String,
}

impl ApiFailure {
    fn transport(message: String) -> Self {
        Self {
            status: None,
            message,
        }
    }

    fn into_provider_error(self, id: Option<&MessageId>) -> ProviderError {
        match (self.status, id) {
            (Some(StatusCode::NOT_FOUND), Some(id)) => ProviderError::NotFound(id.clone()),
            _ => ProviderError::Unavailable(self.message),
        }
    }

    fn into_send_error(self) -> ProviderError {
        let kind = match self.status {
            Some(status) => SendErrorKind::from_http_status(status.as_u16()),
            None => SendErrorKind::TransientNetwork,
        };
        SendError::new(kind, self.message).into()
    }
}

/// Gmail REST adapter. Holds no mailbox state; every call fetches a bearer
/// token from the credential provider.
pub struct GmailProvider {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    api_base: String,
}

impl GmailProvider {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        let api_base = std::env::var("AIMAIL_GMAIL_API_BASE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| GMAIL_API_BASE.to_string());
        Self::with_api_base(credentials, api_base)
    }

    pub fn with_api_base(credentials: Arc<dyn CredentialProvider>, api_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            credentials,
            api_base: api_base.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.api_base.trim_end_matches('/'), path)
    }

    async fn request_with_retry(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        replay: Replay,
    ) -> Result<String, ApiFailure> {
        let token = self
            .credentials
            .gmail_token()
            .await
            .map_err(|error| ApiFailure::transport(error.to_string()))?;
        let mut backoff_seconds = 1u64;
        let mut rate_limited = 0usize;
        let mut transport_failures = 0usize;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .bearer_auth(&token.token)
                .header("accept", "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(error) if replay == Replay::Safe && transport_failures < MAX_TRANSPORT_RETRIES => {
                    transport_failures += 1;
                    warn!(
                        "gmail api request {} failed (attempt {}), retrying in {}s: {}",
                        url, transport_failures, backoff_seconds, error
                    );
                    sleep(StdDuration::from_secs(backoff_seconds)).await;
                    backoff_seconds = (backoff_seconds * 2).min(32);
                    continue;
                }
                Err(error) => {
                    return Err(ApiFailure::transport(format!("gmail api request {url}: {error}")));
                }
            };

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if rate_limited == MAX_RATE_LIMIT_RETRIES {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ApiFailure {
                        status: Some(StatusCode::TOO_MANY_REQUESTS),
                        message: format!(
                            "gmail api request exhausted retries: {}",
                            redact_response_body(&body)
                        ),
                    });
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                rate_limited += 1;
                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|error| ApiFailure::transport(format!("read gmail api response body: {error}")))?;
            if status == StatusCode::UNAUTHORIZED {
                self.credentials.invalidate().await;
            }
            if !status.is_success() {
                return Err(ApiFailure {
                    status: Some(status),
                    message: format!(
                        "gmail api request failed: status={} body={}",
                        status,
                        redact_response_body(&text)
                    ),
                });
            }

            return Ok(text);
        }
    }

    async fn get_message(&self, id: &MessageId, mode: FetchMode) -> Result<GmailMessage, ProviderError> {
        let query = match mode {
            FetchMode::Full => "format=full".to_string(),
            FetchMode::MetadataOnly => {
                "format=metadata&metadataHeaders=From&metadataHeaders=Subject&metadataHeaders=Date"
                    .to_string()
            }
        };
        let url = self.url(&format!("messages/{id}?{query}"));
        let body = self
            .request_with_retry(Method::GET, &url, None, Replay::Safe)
            .await
            .map_err(|failure| failure.into_provider_error(Some(id)))?;
        serde_json::from_str(&body)
            .map_err(|error| ProviderError::Parse(format!("decode gmail message {id}: {error}")))
    }

    async fn download_attachment(
        &self,
        id: &MessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = self.url(&format!("messages/{id}/attachments/{attachment_id}"));
        let body = self
            .request_with_retry(Method::GET, &url, None, Replay::Safe)
            .await
            .map_err(|failure| failure.into_provider_error(Some(id)))?;
        let payload: GmailBody = serde_json::from_str(&body)
            .map_err(|error| ProviderError::Parse(format!("decode gmail attachment: {error}")))?;
        let data = payload.data.unwrap_or_default();
        decode_body_bytes(&data).map_err(ProviderError::Parse)
    }
}

#[async_trait]
impl ProviderClient for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    fn name(&self) -> &str {
        "gmail_api"
    }

    async fn list_unread_ids(&self) -> Result<Vec<MessageId>, ProviderError> {
        let url = self.url(&format!(
            "messages?q={}&maxResults={UNREAD_LIMIT}",
            UNREAD_QUERY.replace(' ', "%20").replace(':', "%3A")
        ));
        let body = self
            .request_with_retry(Method::GET, &url, None, Replay::Safe)
            .await
            .map_err(|failure| failure.into_provider_error(None))?;
        let list: GmailMessageList = serde_json::from_str(&body)
            .map_err(|error| ProviderError::Parse(format!("decode gmail message list: {error}")))?;

        Ok(list
            .messages
            .unwrap_or_default()
            .into_iter()
            .take(UNREAD_LIMIT)
            .map(|stub| MessageId::new(stub.id))
            .collect())
    }

    async fn fetch_messages(
        &self,
        ids: &[MessageId],
        mode: FetchMode,
    ) -> Result<Vec<Message>, ProviderError> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_message(id, mode).await {
                Ok(message) => messages.push(map_gmail_message(&message)),
                Err(ProviderError::NotFound(id)) => {
                    debug!("gmail message {} vanished before fetch", id);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(messages)
    }

    async fn get_by_id(&self, id: &MessageId) -> Result<Message, ProviderError> {
        let raw = self.get_message(id, FetchMode::Full).await?;
        let mut message = map_gmail_message(&raw);

        for attachment in &mut message.attachments {
            let Some(remote_id) = attachment.remote_id.clone() else {
                continue;
            };
            if !attachment.content.is_empty() {
                continue;
            }
            match self.download_attachment(id, &remote_id).await {
                Ok(content) => {
                    attachment.size = content.len() as u64;
                    attachment.content = content;
                }
                Err(error) => warn!(
                    "failed to download gmail attachment {} of {}: {}",
                    attachment.filename, id, error
                ),
            }
        }

        let images: Vec<InlineImage> = message
            .attachments
            .iter()
            .filter(|attachment| {
                attachment.mime_type.starts_with("image/") && !attachment.content.is_empty()
            })
            .map(|attachment| InlineImage {
                mime_type: attachment.mime_type.clone(),
                data: STANDARD.encode(&attachment.content),
                description: None,
            })
            .collect();
        message.images.extend(images);

        Ok(message)
    }

    async fn mark_read(&self, id: &MessageId) -> Result<(), ProviderError> {
        let url = self.url(&format!("messages/{id}/modify"));
        let body = json!({ "removeLabelIds": ["UNREAD"] });
        self.request_with_retry(Method::POST, &url, Some(&body), Replay::Safe)
            .await
            .map_err(|failure| failure.into_provider_error(Some(id)))?;
        Ok(())
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<SendResult, ProviderError> {
        let raw = build_raw_mime(None, message);
        let url = self.url("messages/send");
        let body = json!({ "raw": encode_for_gmail(&raw) });
        let response = self
            .request_with_retry(Method::POST, &url, Some(&body), Replay::Never)
            .await
            .map_err(ApiFailure::into_send_error)?;

        let sent: GmailMessageStub = serde_json::from_str(&response)
            .map_err(|error| ProviderError::Parse(format!("decode gmail send response: {error}")))?;
        Ok(SendResult {
            success: true,
            provider_message_id: Some(sent.id),
        })
    }
}

pub(crate) fn map_gmail_message(message: &GmailMessage) -> Message {
    let subject = extract_header(&message.payload, "Subject").unwrap_or_default();
    let from = extract_header(&message.payload, "From").unwrap_or_default();
    let date = extract_header(&message.payload, "Date").unwrap_or_default();

    let mut text_body = None;
    let mut html_body = None;
    collect_body_parts(&message.payload, &mut text_body, &mut html_body);
    let body = match (text_body, html_body.as_deref()) {
        (Some(text), _) => text,
        (None, Some(html)) => html_to_text(html),
        (None, None) => String::new(),
    };

    let mut attachments = Vec::new();
    collect_attachments(&message.payload, &mut attachments);
    let images = html_body
        .as_deref()
        .map(extract_data_uri_images)
        .unwrap_or_default();

    Message {
        id: MessageId::new(message.id.clone()),
        from,
        subject,
        date,
        internal_date: message
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok()),
        snippet: message
            .snippet
            .as_deref()
            .map(html_entity_decode)
            .unwrap_or_default(),
        body: body.trim().to_string(),
        label_ids: message.label_ids.clone().unwrap_or_default(),
        attachments,
        images,
    }
}

fn extract_header(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn collect_body_parts(
    payload: &GmailPayload,
    text_body: &mut Option<String>,
    html_body: &mut Option<String>,
) {
    let mime_type = payload
        .mime_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    let is_attachment = payload.filename.as_deref().is_some_and(|name| !name.is_empty());

    if !is_attachment {
        if let Some(data) = payload.body.as_ref().and_then(|body| body.data.as_deref()) {
            if !data.is_empty() {
                if let Ok(decoded) = decode_body_data(data) {
                    if mime_type == "text/plain" && text_body.is_none() {
                        *text_body = Some(decoded);
                    } else if mime_type == "text/html" && html_body.is_none() {
                        *html_body = Some(decoded);
                    }
                }
            }
        }
    }

    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_body_parts(part, text_body, html_body);
        }
    }
}

fn collect_attachments(payload: &GmailPayload, attachments: &mut Vec<Attachment>) {
    if let Some(filename) = payload.filename.as_deref().filter(|name| !name.is_empty()) {
        let body = payload.body.as_ref();
        let content = body
            .and_then(|body| body.data.as_deref())
            .and_then(|data| decode_body_bytes(data).ok())
            .unwrap_or_default();
        attachments.push(Attachment {
            filename: filename.to_string(),
            mime_type: payload
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: body.and_then(|body| body.size).unwrap_or(content.len() as u64),
            content,
            remote_id: body.and_then(|body| body.attachment_id.clone()),
        });
    }

    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_attachments(part, attachments);
        }
    }
}

fn decode_body_bytes(data: &str) -> Result<Vec<u8>, String> {
    URL_SAFE_NO_PAD
        .decode(data.trim().trim_end_matches('='))
        .map_err(|error| format!("base64url decode gmail body data: {error}"))
}

fn decode_body_data(data: &str) -> Result<String, String> {
    let bytes = decode_body_bytes(data)?;
    String::from_utf8(bytes).map_err(|error| format!("utf8 decode gmail body data: {error}"))
}

// --- Gmail API response types ---
// #[allow(dead_code)] on these structs: fields are deserialized from the API
// but not all are read directly.

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailMessageStub {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub(crate) struct GmailMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
    #[serde(rename = "labelIds")]
    pub label_ids: Option<Vec<String>>,
    pub snippet: Option<String>,
    pub payload: GmailPayload,
    #[serde(rename = "internalDate")]
    pub internal_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GmailPayload {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub headers: Option<Vec<GmailHeader>>,
    pub body: Option<GmailBody>,
    pub parts: Option<Vec<GmailPayload>>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GmailBody {
    pub size: Option<u64>,
    pub data: Option<String>,
    #[serde(rename = "attachmentId")]
    pub attachment_id: Option<String>,
}
