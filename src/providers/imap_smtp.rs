use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use imap::extensions::idle::WaitOutcome;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as MailMessage, Tokio1Executor};
use native_tls::{TlsConnector, TlsStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{Message, MessageId, OutgoingMessage};
use super::mime::parse_raw_message;
use super::{
    FetchMode, ProviderClient, ProviderError, ProviderEvent, SendError, SendErrorKind, SendResult,
    UNREAD_LIMIT,
};
use crate::store::models::{AccountCredentials, ProviderKind};

type ImapSession = imap::Session<TlsStream<TcpStream>>;

const INBOX: &str = "INBOX";
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_SMTP_PORT: u16 = 465;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const GREETING_TIMEOUT: Duration = Duration::from_secs(30);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(60);
const IDLE_SLICE: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const MAX_RECONNECT_DELAY_SECS: u64 = 30;

#[derive(Clone, PartialEq, Eq)]
pub struct ImapConfig {
    pub email: String,
    pub password: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
}

impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("imap_host", &self.imap_host)
            .field("imap_port", &self.imap_port)
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .finish()
    }
}

impl ImapConfig {
    /// `None` unless the account carries a password and an IMAP host. The
    /// SMTP host defaults to the IMAP host with `imap.` swapped for `smtp.`.
    pub fn from_credentials(credentials: &AccountCredentials) -> Option<Self> {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let password = non_empty(&credentials.password)?;
        let imap_host = non_empty(&credentials.imap_host)?;
        let smtp_host = non_empty(&credentials.smtp_host).unwrap_or_else(|| {
            imap_host
                .strip_prefix("imap.")
                .map(|rest| format!("smtp.{rest}"))
                .unwrap_or_else(|| imap_host.clone())
        });

        Some(Self {
            email: credentials.email.trim().to_string(),
            password,
            imap_host,
            imap_port: credentials.imap_port.unwrap_or(DEFAULT_IMAP_PORT),
            smtp_host,
            smtp_port: credentials.smtp_port.unwrap_or(DEFAULT_SMTP_PORT),
        })
    }
}

/// IMAP for reading, SMTP for sending. One long-lived IMAP session is kept
/// and rebuilt on connection errors.
pub struct ImapSmtpProvider {
    config: ImapConfig,
    session: Arc<Mutex<Option<ImapSession>>>,
}

impl ImapSmtpProvider {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Runs `op` on the shared session inside the blocking pool, reconnecting
    /// with backoff when the connection is gone.
    async fn with_session<R, F>(&self, label: &'static str, op: F) -> Result<R, ProviderError>
    where
        F: Fn(&mut ImapSession) -> imap::error::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = session.lock().unwrap_or_else(PoisonError::into_inner);
            let mut last_error = String::new();

            for attempt in 0..MAX_RECONNECT_ATTEMPTS {
                if guard.is_none() {
                    if attempt > 0 {
                        std::thread::sleep(reconnect_delay(attempt));
                    }
                    match connect(&config) {
                        Ok(fresh) => *guard = Some(fresh),
                        Err(error) => {
                            warn!("imap connect to {} failed: {}", config.imap_host, error);
                            last_error = error;
                            continue;
                        }
                    }
                }

                let Some(active) = guard.as_mut() else {
                    continue;
                };
                match active.select(INBOX).and_then(|_| op(active)) {
                    Ok(value) => return Ok(value),
                    Err(error) if is_connection_error(&error) => {
                        warn!("imap {} lost connection: {}", label, error);
                        *guard = None;
                        last_error = error.to_string();
                    }
                    Err(error) => {
                        return Err(ProviderError::Unavailable(format!("imap {label}: {error}")));
                    }
                }
            }

            Err(ProviderError::Unavailable(format!(
                "imap {label} failed after {MAX_RECONNECT_ATTEMPTS} attempts: {last_error}"
            )))
        })
        .await
        .map_err(|error| ProviderError::Unavailable(format!("imap task failed: {error}")))?
    }

    async fn fetch_raw(
        &self,
        uids: Vec<u32>,
        mode: FetchMode,
    ) -> Result<Vec<(u32, Vec<u8>)>, ProviderError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let sequence = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let query = match mode {
            FetchMode::Full => "(UID BODY.PEEK[])",
            FetchMode::MetadataOnly => "(UID RFC822.HEADER)",
        };

        self.with_session("fetch", move |session| {
            let fetches = session.uid_fetch(&sequence, query)?;
            Ok(fetches
                .iter()
                .filter_map(|fetch| {
                    let uid = fetch.uid?;
                    let bytes = match mode {
                        FetchMode::Full => fetch.body(),
                        FetchMode::MetadataOnly => fetch.header(),
                    }?;
                    Some((uid, bytes.to_vec()))
                })
                .collect())
        })
        .await
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, SendError> {
        let builder = if self.config.smtp_port == 587 {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.smtp_host)
        }
        .map_err(|error| SendError::new(SendErrorKind::TransientNetwork, error.to_string()))?;

        Ok(builder
            .port(self.config.smtp_port)
            .timeout(Some(SOCKET_TIMEOUT))
            .credentials(Credentials::new(
                self.config.email.clone(),
                self.config.password.clone(),
            ))
            .build())
    }

    fn build_mail(&self, message: &OutgoingMessage, message_id: &str) -> Result<MailMessage, SendError> {
        let rejected = |error: String| SendError::new(SendErrorKind::Rejected, error);
        let from: Mailbox = self
            .config
            .email
            .parse()
            .map_err(|error| rejected(format!("invalid sender address: {error}")))?;
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|error| rejected(format!("invalid recipient address {}: {error}", message.to)))?;

        let mut related = MultiPart::related().singlepart(SinglePart::html(message.body_html.clone()));
        for part in &message.parts {
            let content_type = ContentType::parse(&part.content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|error| rejected(format!("invalid content type: {error}")))?;
            let attachment = match &part.content_id {
                Some(content_id) => MailAttachment::new_inline(content_id.clone()),
                None => MailAttachment::new(part.filename.clone()),
            };
            related = related.singlepart(attachment.body(part.data.clone(), content_type));
        }

        MailMessage::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone())
            .message_id(Some(message_id.to_string()))
            .multipart(related)
            .map_err(|error| rejected(format!("build message: {error}")))
    }
}

#[async_trait]
impl ProviderClient for ImapSmtpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    fn name(&self) -> &str {
        "imap_smtp"
    }

    async fn list_unread_ids(&self) -> Result<Vec<MessageId>, ProviderError> {
        let uids = self
            .with_session("search", |session| {
                let mut uids: Vec<u32> = session.uid_search("UNSEEN")?.into_iter().collect();
                uids.sort_unstable_by(|a, b| b.cmp(a));
                uids.truncate(UNREAD_LIMIT);
                Ok(uids)
            })
            .await?;
        Ok(uids.into_iter().map(MessageId::from).collect())
    }

    async fn fetch_messages(
        &self,
        ids: &[MessageId],
        mode: FetchMode,
    ) -> Result<Vec<Message>, ProviderError> {
        let uids = ids.iter().filter_map(parse_uid).collect();
        let raw = self.fetch_raw(uids, mode).await?;

        let mut messages = Vec::with_capacity(raw.len());
        for (uid, bytes) in raw {
            match parse_raw_message(MessageId::from(uid), &bytes) {
                Ok(message) => messages.push(message),
                Err(error) => warn!("skipping unparseable imap message {}: {}", uid, error),
            }
        }
        Ok(messages)
    }

    async fn get_by_id(&self, id: &MessageId) -> Result<Message, ProviderError> {
        let uid = parse_uid(id).ok_or_else(|| ProviderError::NotFound(id.clone()))?;
        let raw = self.fetch_raw(vec![uid], FetchMode::Full).await?;
        let (_, bytes) = raw
            .into_iter()
            .find(|(fetched, _)| *fetched == uid)
            .ok_or_else(|| ProviderError::NotFound(id.clone()))?;
        parse_raw_message(id.clone(), &bytes)
    }

    async fn mark_read(&self, id: &MessageId) -> Result<(), ProviderError> {
        let uid = parse_uid(id).ok_or_else(|| ProviderError::NotFound(id.clone()))?;
        self.with_session("mark read", move |session| {
            session.uid_store(uid.to_string(), "+FLAGS (\\Seen)")?;
            Ok(())
        })
        .await
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<SendResult, ProviderError> {
        let message_id = format!("<{}@aimail>", Uuid::new_v4());
        let mail = self.build_mail(message, &message_id)?;
        let transport = self.transport()?;

        match transport.send(mail).await {
            Ok(response) => {
                debug!("smtp accepted reply to {}: {:?}", message.to, response.code());
                Ok(SendResult {
                    success: true,
                    provider_message_id: Some(message_id),
                })
            }
            Err(error) => {
                let code = error
                    .status()
                    .and_then(|code| code.to_string().parse::<u16>().ok());
                let kind = classify_smtp_failure(code, error.is_permanent());
                Err(SendError::new(kind, error.to_string()).into())
            }
        }
    }

    /// The IDLE loop runs on a detached thread so runtime shutdown never
    /// waits on it; the returned task resolves when the thread exits.
    fn watch(&self, events: UnboundedSender<ProviderEvent>) -> Option<JoinHandle<()>> {
        let config = self.config.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let spawned = std::thread::Builder::new()
            .name("aimail-imap-idle".to_string())
            .spawn(move || {
                idle_loop(config, events);
                let _ = done_tx.send(());
            });
        if let Err(error) = spawned {
            warn!("imap idle watcher not started: {}", error);
            return None;
        }
        Some(tokio::spawn(async move {
            let _ = done_rx.await;
        }))
    }
}

/// IDLE on its own connection; exits once the receiver is gone.
fn idle_loop(config: ImapConfig, events: UnboundedSender<ProviderEvent>) {
    let mut failures: u32 = 0;

    while !events.is_closed() {
        let mut session = match connect(&config).and_then(|mut session| {
            session
                .select(INBOX)
                .map(|_| session)
                .map_err(|error| error.to_string())
        }) {
            Ok(session) => session,
            Err(error) => {
                failures += 1;
                warn!("imap idle connect failed (attempt {}): {}", failures, error);
                pause_unless_closed(reconnect_delay(failures), &events);
                continue;
            }
        };

        if failures > 0 {
            info!("imap idle watcher reconnected");
            if events.send(ProviderEvent::Reconnected).is_err() {
                return;
            }
        }
        failures = 0;

        // Short IDLE rounds, so a dropped receiver is noticed within one slice.
        loop {
            let outcome = session
                .idle()
                .and_then(|handle| handle.wait_with_timeout(IDLE_SLICE));
            match outcome {
                Ok(WaitOutcome::MailboxChanged) => {
                    if events.send(ProviderEvent::NewMail).is_err() {
                        return;
                    }
                }
                Ok(WaitOutcome::TimedOut) => {
                    if events.is_closed() {
                        let _ = session.logout();
                        return;
                    }
                }
                Err(error) => {
                    warn!("imap idle interrupted: {}", error);
                    failures = 1;
                    if events.send(ProviderEvent::Disconnected).is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

fn pause_unless_closed(delay: Duration, events: &UnboundedSender<ProviderEvent>) {
    let mut remaining = delay;
    while !remaining.is_zero() && !events.is_closed() {
        let step = remaining.min(SHUTDOWN_POLL);
        std::thread::sleep(step);
        remaining -= step;
    }
}

fn connect(config: &ImapConfig) -> Result<ImapSession, String> {
    let address = (config.imap_host.as_str(), config.imap_port)
        .to_socket_addrs()
        .map_err(|error| format!("resolve {}: {error}", config.imap_host))?
        .next()
        .ok_or_else(|| format!("no address for {}", config.imap_host))?;

    let tcp = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)
        .map_err(|error| format!("connect {address}: {error}"))?;
    let control = tcp
        .try_clone()
        .map_err(|error| format!("clone socket: {error}"))?;
    control
        .set_read_timeout(Some(GREETING_TIMEOUT))
        .and_then(|_| control.set_write_timeout(Some(SOCKET_TIMEOUT)))
        .map_err(|error| format!("set socket timeout: {error}"))?;

    let tls = TlsConnector::builder()
        .build()
        .map_err(|error| format!("tls setup: {error}"))?;
    let stream = tls
        .connect(&config.imap_host, tcp)
        .map_err(|error| format!("tls handshake with {}: {error}", config.imap_host))?;

    let mut client = imap::Client::new(stream);
    client
        .read_greeting()
        .map_err(|error| format!("imap greeting: {error}"))?;
    control
        .set_read_timeout(Some(SOCKET_TIMEOUT))
        .map_err(|error| format!("set socket timeout: {error}"))?;

    client
        .login(&config.email, &config.password)
        .map_err(|(error, _client)| format!("imap login for {}: {error}", config.email))
}

fn is_connection_error(error: &imap::Error) -> bool {
    matches!(error, imap::Error::Io(_) | imap::Error::ConnectionLost)
}

fn parse_uid(id: &MessageId) -> Option<u32> {
    id.as_str().trim().parse().ok()
}

/// 1s, 2s, 4s, ... capped at 30s.
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exponent).min(MAX_RECONNECT_DELAY_SECS))
}

fn classify_smtp_failure(code: Option<u16>, permanent: bool) -> SendErrorKind {
    match code {
        Some(530 | 534 | 535) => SendErrorKind::AuthExpired,
        Some(400..=499) => SendErrorKind::TransientNetwork,
        Some(_) if permanent => SendErrorKind::Rejected,
        _ => SendErrorKind::TransientNetwork,
    }
}
