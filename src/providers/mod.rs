use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::services::credentials::{CredentialError, CredentialProvider};
use crate::store::models::{AuthState, ProviderKind};

pub mod gmail;
pub mod imap_smtp;
pub mod message;
pub mod mime;

pub use gmail::GmailProvider;
pub use imap_smtp::{ImapConfig, ImapSmtpProvider};
pub use message::{Attachment, InlineImage, Message, MessageId, OutgoingMessage, OutgoingPart};

/// Unread listings never return more than this many messages.
pub const UNREAD_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Full,
    MetadataOnly,
}

impl FetchMode {
    pub fn has_body(self) -> bool {
        matches!(self, Self::Full)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    NewMail,
    Disconnected,
    Reconnected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub success: bool,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorKind {
    AuthExpired,
    TransientNetwork,
    Rejected,
}

impl SendErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork)
    }

    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::AuthExpired,
            429 | 500..=599 => Self::TransientNetwork,
            _ => Self::Rejected,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("send failed ({kind:?}): {message}")]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn new(kind: SendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("parse provider response: {0}")]
    Parse(String),
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn name(&self) -> &str;

    /// Newest unread ids in the inbox, at most [`UNREAD_LIMIT`].
    async fn list_unread_ids(&self) -> Result<Vec<MessageId>, ProviderError>;

    /// Fetches the given ids without altering their read state.
    async fn fetch_messages(
        &self,
        ids: &[MessageId],
        mode: FetchMode,
    ) -> Result<Vec<Message>, ProviderError>;

    async fn list_unread(&self) -> Result<Vec<Message>, ProviderError> {
        let ids = self.list_unread_ids().await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_messages(&ids, FetchMode::Full).await
    }

    async fn get_by_id(&self, id: &MessageId) -> Result<Message, ProviderError>;

    async fn mark_read(&self, id: &MessageId) -> Result<(), ProviderError>;

    async fn send(&self, message: &OutgoingMessage) -> Result<SendResult, ProviderError>;

    /// Starts a push watcher when the transport supports one.
    fn watch(&self, _events: UnboundedSender<ProviderEvent>) -> Option<JoinHandle<()>> {
        None
    }
}

/// Builds the adapter for the authenticated account, or `None` when logged out.
pub fn select_provider(
    auth: &AuthState,
    credentials: Arc<dyn CredentialProvider>,
) -> Option<Arc<dyn ProviderClient>> {
    if !auth.is_authenticated {
        return None;
    }

    match auth.provider? {
        ProviderKind::Gmail => Some(Arc::new(GmailProvider::new(credentials))),
        ProviderKind::Imap => {
            let config = ImapConfig::from_credentials(auth.credentials.as_ref()?)?;
            Some(Arc::new(ImapSmtpProvider::new(config)))
        }
    }
}
