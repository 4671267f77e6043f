use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CachedMailbox, FetchOptions};
use crate::config::AppConfig;
use crate::ingest::extract::ExtractionError;
use crate::ingest::sheet::{format_workbook_context, read_workbook, workbook_images};
use crate::ingest::AttachmentIngestor;
use crate::providers::message::extract_email_address;
use crate::providers::{
    InlineImage, Message, MessageId, OutgoingMessage, ProviderError, SendError, SendErrorKind, SendResult,
};
use crate::services::completion::{CompletionOptions, CompletionProvider};
use crate::services::connectivity::ConnectivityMonitor;
use crate::services::license::{is_demo_over, LicenseService};
use crate::store::knowledge::detect_cell_reference;
use crate::store::models::{DailyCount, GeneratedReply, SentLogEntry};
use crate::store::settings::Settings;
use crate::store::{StateStores, StoreError};

pub mod compose;
pub mod filters;
pub mod prompt;

use self::compose::{compose_reply, reply_html};
use self::filters::{is_noreply, within_send_window, MessageFilter, SkipReason};
use self::prompt::{build_embeddings_context, PromptContext, APOLOGY_REPLY, NEAREST_K, SYSTEM_PROMPT};

/// Pause between drafts in a batch run.
pub const BATCH_PAUSE: Duration = Duration::from_millis(500);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("send failed: {0}")]
    Send(SendError),

    #[error("reply generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("reply generation produced no text")]
    GenerationEmpty,

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error("no draft stored for {0}")]
    DraftMissing(MessageId),

    #[error("message {0} was already answered")]
    AlreadyReplied(MessageId),

    #[error("no recipient address in '{0}'")]
    NoRecipient(String),

    #[error("batch generation is disabled while auto-send is on")]
    AutoSendActive,
}

impl From<ProviderError> for OrchestratorError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::NotFound(id) => Self::NotFound(id),
            ProviderError::Send(send) => Self::Send(send),
            other => Self::ProviderUnavailable(other.to_string()),
        }
    }
}

/// Broadcast to whoever is watching the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Offline,
    Online,
    EmailsUpdated(usize),
    Replied(MessageId),
    Failed { id: MessageId, reason: String },
    DraftReady(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum CycleSkip {
    Busy,
    Offline,
    ProviderUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum ReplyOutcome {
    Replied,
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageOutcome {
    pub id: MessageId,
    pub outcome: ReplyOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<CycleSkip>,
    pub fetched: usize,
    pub candidates: usize,
    pub outcomes: Vec<MessageOutcome>,
}

impl CycleReport {
    fn skipped(reason: CycleSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn replied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|entry| entry.outcome == ReplyOutcome::Replied)
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub pending: usize,
    pub generated: usize,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

/// Where an in-flight reply currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Pending,
    Generating,
    Sending,
}

type TaskMap = Mutex<HashMap<MessageId, ReplyStatus>>;

/// Holds an id in the in-progress map until dropped.
struct TaskGuard<'a> {
    tasks: &'a TaskMap,
    id: MessageId,
}

impl TaskGuard<'_> {
    fn set(&self, status: ReplyStatus) {
        lock(self.tasks).insert(self.id.clone(), status);
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        lock(self.tasks).remove(&self.id);
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives polling, filtering, generation and delivery of replies.
pub struct ReplyOrchestrator {
    config: AppConfig,
    stores: Arc<StateStores>,
    mailbox: Arc<CachedMailbox>,
    completion: Arc<dyn CompletionProvider>,
    license: Arc<dyn LicenseService>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    ingestor: AttachmentIngestor,
    http: Client,
    busy: AtomicBool,
    last_online: Mutex<Option<bool>>,
    tasks: TaskMap,
    events: broadcast::Sender<StatusEvent>,
}

impl ReplyOrchestrator {
    pub fn new(
        config: AppConfig,
        stores: Arc<StateStores>,
        mailbox: Arc<CachedMailbox>,
        completion: Arc<dyn CompletionProvider>,
        license: Arc<dyn LicenseService>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ingestor: AttachmentIngestor::new(completion.clone(), stores.clone()),
            config,
            stores,
            mailbox,
            completion,
            license,
            connectivity,
            http: Client::new(),
            busy: AtomicBool::new(false),
            last_online: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn stores(&self) -> &Arc<StateStores> {
        &self.stores
    }

    pub fn mailbox(&self) -> &Arc<CachedMailbox> {
        &self.mailbox
    }

    pub fn ingestor(&self) -> &AttachmentIngestor {
        &self.ingestor
    }

    /// Replies currently in flight.
    pub fn in_progress(&self) -> Vec<(MessageId, ReplyStatus)> {
        let mut tasks: Vec<_> = lock(&self.tasks)
            .iter()
            .map(|(id, status)| (id.clone(), *status))
            .collect();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));
        tasks
    }

    fn emit(&self, event: StatusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn begin_task(&self, id: &MessageId) -> Option<TaskGuard<'_>> {
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(id) {
            return None;
        }
        tasks.insert(id.clone(), ReplyStatus::Pending);
        Some(TaskGuard {
            tasks: &self.tasks,
            id: id.clone(),
        })
    }

    /// Probes connectivity and emits `Offline`/`Online` on transitions only.
    async fn check_connectivity(&self) -> bool {
        let online = self.connectivity.is_online().await;
        let previous = lock(&self.last_online).replace(online);
        match (previous, online) {
            (Some(false), true) => {
                info!("connection restored");
                self.emit(StatusEvent::Online);
            }
            (Some(false), false) => {}
            (_, false) => {
                warn!("no internet connection, skipping mail check");
                self.emit(StatusEvent::Offline);
            }
            _ => {}
        }
        online
    }

    /// One poll: fetch, filter, snapshot and, inside the auto-send window,
    /// answer every candidate in turn.
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_with(FetchOptions::default()).await
    }

    /// Same as [`run_cycle`](Self::run_cycle) with explicit fetch options;
    /// push notifications force a fetch past the throttle.
    pub async fn run_cycle_with(&self, options: FetchOptions) -> CycleReport {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            debug!("previous cycle still running, dropping this one");
            return CycleReport::skipped(CycleSkip::Busy);
        };

        if !self.check_connectivity().await {
            return CycleReport::skipped(CycleSkip::Offline);
        }

        let messages = match self.mailbox.unread(options).await {
            Ok(messages) => messages,
            Err(error) => {
                warn!("mail check failed: {}", error);
                return CycleReport::skipped(CycleSkip::ProviderUnavailable(error.to_string()));
            }
        };

        let settings = self.stores.settings.load();
        let fetched = messages.len();
        let (mut candidates, filtered) = MessageFilter::from_settings(&settings).partition(messages);
        candidates.sort_by_key(|message| std::cmp::Reverse(message.timestamp()));
        debug!("fetched {} unread, {} after filters", fetched, candidates.len());

        if let Err(error) = self.stores.snapshot.replace(&candidates) {
            warn!("failed to save mail snapshot: {}", error);
        }
        self.emit(StatusEvent::EmailsUpdated(candidates.len()));

        let mut report = CycleReport {
            skipped: None,
            fetched,
            candidates: candidates.len(),
            outcomes: filtered
                .into_iter()
                .map(|(message, reason)| MessageOutcome {
                    id: message.id,
                    outcome: ReplyOutcome::Skipped(reason),
                })
                .collect(),
        };

        if !settings.auto_send || candidates.is_empty() {
            return report;
        }
        let now = Local::now().time();
        if !within_send_window(now, &settings.auto_send_start_time, &settings.auto_send_end_time) {
            debug!(
                "outside auto-send window {}-{}",
                settings.auto_send_start_time, settings.auto_send_end_time
            );
            return report;
        }

        info!("processing {} message(s) for auto-reply", candidates.len());
        for message in candidates {
            let id = message.id.clone();
            let outcome = self.process_for_auto_reply(message, &settings).await;
            report.outcomes.push(MessageOutcome { id, outcome });
        }
        report
    }

    /// The per-message state machine of an automatic reply.
    pub async fn process_for_auto_reply(&self, listed: Message, settings: &Settings) -> ReplyOutcome {
        if self.stores.replied.contains(&listed.id) {
            return ReplyOutcome::Skipped(SkipReason::AlreadyReplied);
        }
        let Some(task) = self.begin_task(&listed.id) else {
            return ReplyOutcome::Skipped(SkipReason::InProgress);
        };

        let mut message = match self.mailbox.provider().get_by_id(&listed.id).await {
            Ok(message) => message,
            Err(ProviderError::NotFound(id)) => {
                debug!("message {} disappeared before reply", id);
                return ReplyOutcome::Skipped(SkipReason::NotFound);
            }
            Err(error) => return self.fail(&listed.id, error.into()),
        };

        if is_noreply(&message) {
            debug!("skipping no-reply message {}", message.id);
            return ReplyOutcome::Skipped(SkipReason::NoReply);
        }

        task.set(ReplyStatus::Generating);
        self.ingestor.ingest_message(&mut message).await;

        let limit = self.config.generation_timeout;
        let reply = match tokio::time::timeout(limit, self.generate_reply(&message)).await {
            Ok(reply) => reply,
            Err(_) => return self.fail(&message.id, OrchestratorError::GenerationTimeout(limit)),
        };

        task.set(ReplyStatus::Sending);
        match self
            .deliver(&message.from, &reply.subject, &reply.body, Some(&message.id), Some(&message))
            .await
        {
            Ok(_) => {
                info!("auto-replied to {}", message.id);
                self.emit(StatusEvent::Replied(message.id.clone()));
                self.notify_owner(settings, &message, &reply).await;
                ReplyOutcome::Replied
            }
            Err(error) => self.fail(&message.id, error),
        }
    }

    fn fail(&self, id: &MessageId, error: OrchestratorError) -> ReplyOutcome {
        warn!("reply to {} failed: {}", id, error);
        let reason = error.to_string();
        self.emit(StatusEvent::Failed {
            id: id.clone(),
            reason: reason.clone(),
        });
        ReplyOutcome::Failed(reason)
    }

    /// Drafts a reply. Never fails: without a usable answer the canned
    /// apology is returned.
    pub async fn generate_reply(&self, message: &Message) -> GeneratedReply {
        let body = match self.draft_body(message).await {
            Ok(body) => body,
            Err(error) => {
                warn!("no reply generated for {}: {}", message.id, error);
                APOLOGY_REPLY.to_string()
            }
        };
        GeneratedReply {
            subject: message.reply_subject(),
            body,
        }
    }

    async fn draft_body(&self, message: &Message) -> Result<String, OrchestratorError> {
        let settings = self.stores.settings.load();
        self.decrement_quota(&settings).await;

        let prompt = self.prompt_context(message, &settings).await.render();
        match self
            .completion
            .complete(SYSTEM_PROMPT, &prompt, &CompletionOptions::default())
            .await
        {
            Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(_) => Err(OrchestratorError::GenerationEmpty),
            Err(error) => {
                warn!("completion failed: {}", error);
                Err(OrchestratorError::GenerationEmpty)
            }
        }
    }

    async fn decrement_quota(&self, settings: &Settings) {
        let email = settings
            .activation_email
            .clone()
            .filter(|email| !email.trim().is_empty())
            .or_else(|| self.stores.auth.load().account_email().map(str::to_string));
        let Some(email) = email else {
            return;
        };
        match self.license.decrement_generations(&email).await {
            Ok(true) => {}
            Ok(false) => warn!("generation quota for {} was not decremented", email),
            Err(error) => warn!("failed to decrement generation quota: {}", error),
        }
    }

    async fn prompt_context(&self, message: &Message, settings: &Settings) -> PromptContext {
        let web_html = self.fetch_web_context(&settings.web_urls).await;
        let (workbook_data, mut workbook_pictures) = self.workbook_context().await;
        let workbook_image_descriptions = self.ingestor.describe_images(&mut workbook_pictures).await;

        let mut images = message.images.clone();
        let image_descriptions = self.ingestor.describe_images(&mut images).await;

        let nearest = if message.body.trim().is_empty() {
            Vec::new()
        } else {
            match self.ingestor.embed(&message.body).await {
                Some(vector) => self.stores.knowledge.nearest(&vector, NEAREST_K),
                None => Vec::new(),
            }
        };
        let cell = detect_cell_reference(&format!("{}\n{}", message.subject, message.body))
            .and_then(|query| self.stores.knowledge.lookup_reference(&query));

        PromptContext {
            greeting: settings.greeting.clone(),
            email_body: message.body.clone(),
            image_descriptions,
            workbook_image_descriptions,
            workbook_data,
            signature: settings.signature.clone(),
            web_html,
            embeddings_context: build_embeddings_context(cell.as_ref(), &nearest),
        }
    }

    async fn fetch_web_context(&self, urls: &[String]) -> String {
        let mut pages = Vec::new();
        for url in urls.iter().map(|url| url.trim()).filter(|url| !url.is_empty()) {
            let response = self
                .http
                .get(url)
                .timeout(self.config.web_fetch_timeout)
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => match response.text().await {
                    Ok(html) => pages.push(html),
                    Err(error) => warn!("reading {} failed: {}", url, error),
                },
                Ok(response) => warn!("fetching {} returned {}", url, response.status()),
                Err(error) => warn!("fetching {} failed: {}", url, error),
            }
        }
        pages.join("\n\n")
    }

    /// Formatted sheets and embedded pictures of the knowledge workbook.
    async fn workbook_context(&self) -> (String, Vec<InlineImage>) {
        let path = self.config.knowledge_workbook();
        if !path.is_file() {
            return (String::new(), Vec::new());
        }

        let loaded = tokio::task::spawn_blocking(move || -> Result<_, ExtractionError> {
            let bytes = std::fs::read(&path)?;
            let images = workbook_images(&bytes).unwrap_or_default();
            let sheets = read_workbook(bytes)?;
            Ok((format_workbook_context(&sheets), images))
        })
        .await;

        match loaded {
            Ok(Ok(context)) => context,
            Ok(Err(error)) => {
                warn!("knowledge workbook unreadable: {}", error);
                (String::new(), Vec::new())
            }
            Err(error) => {
                warn!("knowledge workbook task failed: {}", error);
                (String::new(), Vec::new())
            }
        }
    }

    /// Manual send through the same pipeline as automatic replies.
    pub async fn send_reply(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        email_id: Option<&MessageId>,
    ) -> Result<SendResult, OrchestratorError> {
        if let Some(id) = email_id {
            if self.stores.replied.contains(id) {
                return Err(OrchestratorError::AlreadyReplied(id.clone()));
            }
        }
        self.deliver(to, subject, body, email_id, None).await
    }

    async fn deliver(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        email_id: Option<&MessageId>,
        original: Option<&Message>,
    ) -> Result<SendResult, OrchestratorError> {
        let address = extract_email_address(to);
        if address.is_empty() {
            return Err(OrchestratorError::NoRecipient(to.to_string()));
        }

        let settings = self.stores.settings.load();
        let outgoing = compose_reply(
            &address,
            subject,
            body,
            &settings,
            &self.config.attachments_dir(),
            original,
        )
        .await;
        let result = self.mailbox.provider().send(&outgoing).await?;
        if !result.success {
            return Err(OrchestratorError::Send(SendError::new(
                SendErrorKind::Rejected,
                "provider did not accept the message",
            )));
        }

        if let Some(id) = email_id {
            self.finish_replied(id).await;
        }

        let entry = SentLogEntry {
            id: Uuid::new_v4().to_string(),
            to: address,
            subject: subject.to_string(),
            date: Utc::now(),
            body: body.to_string(),
            signature_text: settings.signature_text_or_default().to_string(),
            signature_image: settings.signature_image.clone(),
        };
        if let Err(error) = self.stores.sent_log.append(entry) {
            warn!("failed to append sent log: {}", error);
        }
        Ok(result)
    }

    /// Post-send bookkeeping. The id is recorded even when mark-read fails,
    /// since the reply has already gone out.
    async fn finish_replied(&self, id: &MessageId) {
        if let Err(error) = self.mailbox.provider().mark_read(id).await {
            warn!("reply to {} sent but marking it read failed: {}", id, error);
        }
        if let Err(error) = self.stores.replied.record(id) {
            warn!("failed to persist replied id {}: {}", id, error);
        }
        self.mailbox.evict(id);
        if let Err(error) = self.stores.snapshot.remove(id) {
            warn!("failed to drop {} from mail snapshot: {}", id, error);
        }
    }

    async fn notify_owner(&self, settings: &Settings, message: &Message, reply: &GeneratedReply) {
        let to = settings.notification_email.trim();
        if !settings.notify_on_auto_reply || to.is_empty() {
            return;
        }

        let text = format!(
            "An automatic reply was sent.\n\nFrom: {}\nSubject: {}\n\nReply:\n{}",
            message.from, message.subject, reply.body
        );
        let notification = OutgoingMessage {
            to: to.to_string(),
            subject: format!("Auto-reply sent: {}", message.subject),
            body_html: reply_html(&text, "", false, None),
            parts: Vec::new(),
        };
        if let Err(error) = self.mailbox.provider().send(&notification).await {
            warn!("owner notification to {} failed: {}", to, error);
        }
    }

    /// Full message by id, falling back to cached copies when the provider
    /// is unreachable.
    pub async fn load_message(&self, id: &MessageId) -> Result<Message, OrchestratorError> {
        match self.mailbox.provider().get_by_id(id).await {
            Ok(message) => Ok(message),
            Err(ProviderError::NotFound(id)) => Err(OrchestratorError::NotFound(id)),
            Err(error) => {
                warn!("fetching {} failed, trying cached copy: {}", id, error);
                self.mailbox
                    .cached(id)
                    .map(|entry| entry.message)
                    .or_else(|| self.stores.snapshot.find(id))
                    .ok_or_else(|| OrchestratorError::from(error))
            }
        }
    }

    /// Half-auto mode: drafts a reply for every unread message that has
    /// neither a reply nor a draft yet.
    pub async fn generate_batch(&self, cancel: &AtomicBool) -> Result<BatchReport, OrchestratorError> {
        let settings = self.stores.settings.load();
        if settings.auto_send {
            return Err(OrchestratorError::AutoSendActive);
        }

        let unread = self.mailbox.unread(FetchOptions::default()).await?;
        let (candidates, _) = MessageFilter::from_settings(&settings).partition(unread);
        let pending: Vec<Message> = candidates
            .into_iter()
            .filter(|message| !self.stores.replied.contains(&message.id) && !self.stores.drafts.contains(&message.id))
            .collect();

        let mut report = BatchReport {
            pending: pending.len(),
            ..BatchReport::default()
        };
        for (index, listed) in pending.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
            if cancel.load(Ordering::SeqCst) {
                info!("batch generation cancelled after {} draft(s)", report.generated);
                report.cancelled = true;
                break;
            }

            let message = match self.mailbox.provider().get_by_id(&listed.id).await {
                Ok(message) => message,
                Err(ProviderError::NotFound(_)) => continue,
                Err(error) => {
                    warn!("full fetch of {} failed, no draft this round: {}", listed.id, error);
                    report.errors.push(format!("{}: {}", listed.id, error));
                    continue;
                }
            };
            let draft = match tokio::time::timeout(self.config.generation_timeout, self.generate_reply(&message)).await {
                Ok(draft) => draft,
                Err(_) => {
                    warn!("draft for {} timed out, storing the original text", message.id);
                    GeneratedReply {
                        subject: message.reply_subject(),
                        body: message.body.clone(),
                    }
                }
            };

            match self.stores.drafts.put(&message.id, draft) {
                Ok(()) => {
                    report.generated += 1;
                    self.emit(StatusEvent::DraftReady(message.id.clone()));
                }
                Err(error) => report.errors.push(format!("{}: {}", message.id, error)),
            }
        }
        Ok(report)
    }

    /// Redrafts one message and overwrites its stored draft.
    pub async fn regenerate(&self, id: &MessageId) -> Result<GeneratedReply, OrchestratorError> {
        let message = self.load_message(id).await?;
        let draft = match tokio::time::timeout(self.config.generation_timeout, self.generate_reply(&message)).await {
            Ok(draft) => draft,
            Err(_) => GeneratedReply {
                subject: message.reply_subject(),
                body: APOLOGY_REPLY.to_string(),
            },
        };
        self.stores.drafts.put(id, draft.clone())?;
        self.emit(StatusEvent::DraftReady(id.clone()));
        Ok(draft)
    }

    /// Sends a stored draft to the sender of its message.
    pub async fn send_staged(&self, id: &MessageId) -> Result<SendResult, OrchestratorError> {
        if self.stores.replied.contains(id) {
            return Err(OrchestratorError::AlreadyReplied(id.clone()));
        }
        let draft = self
            .stores
            .drafts
            .get(id)
            .ok_or_else(|| OrchestratorError::DraftMissing(id.clone()))?;
        let Some(_task) = self.begin_task(id) else {
            return Err(OrchestratorError::AlreadyReplied(id.clone()));
        };

        let message = self.load_message(id).await?;
        let result = self
            .deliver(&message.from, &draft.subject, &draft.body, Some(id), Some(&message))
            .await?;
        if let Err(error) = self.stores.drafts.remove(id) {
            warn!("failed to remove sent draft {}: {}", id, error);
        }
        self.emit(StatusEvent::Replied(id.clone()));
        Ok(result)
    }

    pub async fn send_all_staged(&self) -> Vec<MessageOutcome> {
        let mut outcomes = Vec::new();
        for key in self.stores.drafts.all().into_keys() {
            let id = MessageId::from(key);
            let outcome = match self.send_staged(&id).await {
                Ok(_) => ReplyOutcome::Replied,
                Err(error) => self.fail(&id, error),
            };
            outcomes.push(MessageOutcome { id, outcome });
        }
        outcomes
    }

    pub fn reply_stats(&self, today: NaiveDate) -> Vec<DailyCount> {
        self.stores.sent_log.daily_counts(today)
    }

    /// Trial check against the license backend, falling back to the sent count.
    pub async fn is_demo_over(&self) -> bool {
        let key = self.config.license_key.clone().unwrap_or_default();
        let status = self.license.check_trial_status(&key).await;
        is_demo_over(&status, self.stores.sent_log.len(), Utc::now())
    }
}
