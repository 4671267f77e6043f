use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aimail::cache::{CacheConfig, CachedMailbox, FetchOptions};
use aimail::config::AppConfig;
use aimail::orchestrator::filters::SkipReason;
use aimail::orchestrator::prompt::APOLOGY_REPLY;
use aimail::orchestrator::{CycleSkip, OrchestratorError, ReplyOrchestrator, ReplyOutcome};
use aimail::providers::{
    FetchMode, Message, MessageId, OutgoingMessage, ProviderClient, ProviderError, SendResult,
};
use aimail::services::completion::{
    CompletionError, CompletionOptions, CompletionProvider, FallbackCompletion,
};
use aimail::services::connectivity::ConnectivityMonitor;
use aimail::services::license::NoopLicenseService;
use aimail::store::models::ProviderKind;
use aimail::store::StateStores;
use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("aimail-orchestrator-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root
}

fn message(id: &str, from: &str, subject: &str) -> Message {
    Message {
        id: id.into(),
        from: from.to_string(),
        subject: subject.to_string(),
        date: "2025-03-10T09:00:00Z".to_string(),
        snippet: "Could you send me".to_string(),
        body: "Could you send me a quote for ten chairs?".to_string(),
        ..Message::default()
    }
}

/// Holds `list_unread_ids` open until released.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

#[derive(Default)]
struct FakeMailbox {
    unread: Mutex<Vec<Message>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    fail_mark_read: bool,
    fail_full_fetch: bool,
    gate: Option<Gate>,
}

impl FakeMailbox {
    fn with(messages: Vec<Message>) -> Self {
        Self {
            unread: Mutex::new(messages),
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().expect("lock sent").clone()
    }
}

#[async_trait]
impl ProviderClient for FakeMailbox {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    fn name(&self) -> &str {
        "fake_mailbox"
    }

    async fn list_unread_ids(&self) -> Result<Vec<MessageId>, ProviderError> {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(self
            .unread
            .lock()
            .expect("lock unread")
            .iter()
            .map(|message| message.id.clone())
            .collect())
    }

    async fn fetch_messages(&self, ids: &[MessageId], _: FetchMode) -> Result<Vec<Message>, ProviderError> {
        Ok(self
            .unread
            .lock()
            .expect("lock unread")
            .iter()
            .filter(|message| ids.contains(&message.id))
            .cloned()
            .collect())
    }

    async fn get_by_id(&self, id: &MessageId) -> Result<Message, ProviderError> {
        if self.fail_full_fetch {
            return Err(ProviderError::Unavailable("imap reconnect budget exhausted".to_string()));
        }
        self.unread
            .lock()
            .expect("lock unread")
            .iter()
            .find(|message| &message.id == id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.clone()))
    }

    async fn mark_read(&self, id: &MessageId) -> Result<(), ProviderError> {
        if self.fail_mark_read {
            return Err(ProviderError::Unavailable("imap connection reset".to_string()));
        }
        self.unread.lock().expect("lock unread").retain(|message| &message.id != id);
        Ok(())
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<SendResult, ProviderError> {
        self.sent.lock().expect("lock sent").push(message.clone());
        Ok(SendResult {
            success: true,
            provider_message_id: Some(format!("sent-{}", Uuid::new_v4())),
        })
    }
}

/// Answers with `reply` after `delay`; `None` means the backend is down.
struct ScriptedCompletion {
    name: &'static str,
    reply: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
    cancel_on_call: Option<Arc<AtomicBool>>,
}

impl ScriptedCompletion {
    fn new(name: &'static str, reply: Option<&str>) -> Self {
        Self {
            name,
            reply: reply.map(str::to_string),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            cancel_on_call: None,
        }
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    fn name(&self) -> &str {
        self.name
    }

    async fn complete(&self, _: &str, _: &str, _: &CompletionOptions) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = &self.cancel_on_call {
            cancel.store(true, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply
            .clone()
            .ok_or_else(|| CompletionError::Unavailable(format!("{} is down", self.name)))
    }

    async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>, CompletionError> {
        Err(CompletionError::Unavailable("no embeddings".to_string()))
    }

    async fn describe_image(&self, _: &str, _: &str, _: &str) -> Result<String, CompletionError> {
        Err(CompletionError::Unavailable("no vision".to_string()))
    }
}

struct AlwaysOnline;

#[async_trait]
impl ConnectivityMonitor for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

fn orchestrator(
    mailbox: Arc<FakeMailbox>,
    completion: Arc<dyn CompletionProvider>,
    auto_send: bool,
) -> ReplyOrchestrator {
    let root = temp_root();
    let stores = Arc::new(StateStores::open(&root).expect("open stores"));
    stores
        .settings
        .update(|settings| {
            settings.set_auto_send(auto_send);
            settings.auto_send_start_time = "00:00".to_string();
            settings.auto_send_end_time = "23:59".to_string();
            Ok(())
        })
        .expect("save settings");

    ReplyOrchestrator::new(
        AppConfig::new(&root),
        stores,
        Arc::new(CachedMailbox::new(mailbox, CacheConfig::default())),
        completion,
        Arc::new(NoopLicenseService),
        Arc::new(AlwaysOnline),
    )
}

fn forced() -> FetchOptions {
    FetchOptions {
        force: true,
        ..FetchOptions::default()
    }
}

#[tokio::test]
async fn reply_is_sent_at_most_once_even_when_mark_read_fails() {
    let mailbox = Arc::new(FakeMailbox {
        fail_mark_read: true,
        ..FakeMailbox::with(vec![message("41", "Anna <anna@example.com>", "Quote")])
    });
    let completion = Arc::new(ScriptedCompletion::new("local", Some("Ten chairs cost 400 EUR.")));
    let orchestrator = orchestrator(mailbox.clone(), completion.clone(), true);

    let first = orchestrator.run_cycle_with(forced()).await;
    assert_eq!(first.replied(), 1);
    assert!(orchestrator.stores().replied.contains(&"41".into()));

    let second = orchestrator.run_cycle_with(forced()).await;
    assert_eq!(second.fetched, 1);
    assert_eq!(second.replied(), 0);
    assert_eq!(second.outcomes[0].outcome, ReplyOutcome::Skipped(SkipReason::AlreadyReplied));

    let sent = mailbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "anna@example.com");
    assert_eq!(sent[0].subject, "Re: Quote");
    assert!(sent[0].body_html.contains("Ten chairs cost 400 EUR."));
    assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.stores().sent_log.len(), 1);
}

#[tokio::test]
async fn empty_inbox_clears_snapshot_without_generating() {
    let mailbox = Arc::new(FakeMailbox::default());
    let completion = Arc::new(ScriptedCompletion::new("local", Some("unused")));
    let orchestrator = orchestrator(mailbox.clone(), completion.clone(), true);
    orchestrator
        .stores()
        .snapshot
        .replace(&[message("old", "bob@example.com", "Old news")])
        .expect("seed snapshot");

    let report = orchestrator.run_cycle().await;
    assert_eq!(report.skipped, None);
    assert_eq!(report.fetched, 0);
    assert!(report.outcomes.is_empty());
    assert!(orchestrator.stores().snapshot.read().is_empty());
    assert!(orchestrator.mailbox().is_empty());
    assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    assert!(mailbox.sent().is_empty());
}

#[tokio::test]
async fn noreply_sender_is_never_answered() {
    let mailbox = Arc::new(FakeMailbox::with(vec![message(
        "7",
        "Shop <noreply@shop.example>",
        "Your receipt",
    )]));
    let completion = Arc::new(ScriptedCompletion::new("local", Some("Thanks!")));
    let orchestrator = orchestrator(mailbox.clone(), completion.clone(), true);
    orchestrator
        .stores()
        .settings
        .update(|settings| {
            settings.spam_keywords.clear();
            Ok(())
        })
        .expect("clear spam keywords");

    let report = orchestrator.run_cycle().await;
    assert_eq!(report.candidates, 1);
    assert_eq!(report.outcomes[0].outcome, ReplyOutcome::Skipped(SkipReason::NoReply));
    assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    assert!(mailbox.sent().is_empty());
    assert!(!orchestrator.stores().replied.contains(&"7".into()));
}

#[tokio::test]
async fn both_backends_failing_sends_the_apology() {
    let mailbox = Arc::new(FakeMailbox::with(vec![message("9", "carol@example.com", "Delivery")]));
    let local = Arc::new(ScriptedCompletion::new("local", None));
    let remote = Arc::new(ScriptedCompletion::new("remote", None));
    let completion = Arc::new(FallbackCompletion::new(
        local.clone(),
        remote.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    let orchestrator = orchestrator(mailbox.clone(), completion, true);

    let report = orchestrator.run_cycle().await;
    assert_eq!(report.replied(), 1);
    assert_eq!(local.calls.load(Ordering::SeqCst), 1);
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

    let sent = mailbox.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body_html.contains(APOLOGY_REPLY));
}

#[tokio::test]
async fn slow_local_backend_falls_back_to_remote() {
    let mailbox = Arc::new(FakeMailbox::default());
    let local = Arc::new(ScriptedCompletion {
        delay: Duration::from_secs(30),
        ..ScriptedCompletion::new("local", Some("too late"))
    });
    let remote = Arc::new(ScriptedCompletion::new("remote", Some("Hello")));
    let completion = Arc::new(FallbackCompletion::new(
        local,
        remote,
        Duration::from_millis(50),
        Duration::from_secs(5),
    ));
    let orchestrator = orchestrator(mailbox, completion, false);

    let reply = orchestrator
        .generate_reply(&message("3", "dan@example.com", "Hours"))
        .await;
    assert_eq!(reply.subject, "Re: Hours");
    assert_eq!(reply.body, "Hello");
}

#[tokio::test]
async fn overlapping_cycle_is_dropped_while_one_runs() {
    let mailbox = Arc::new(FakeMailbox {
        gate: Some(Gate::default()),
        ..FakeMailbox::default()
    });
    let completion = Arc::new(ScriptedCompletion::new("local", Some("ok")));
    let orchestrator = Arc::new(orchestrator(mailbox.clone(), completion, true));

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle().await })
    };
    let gate = mailbox.gate.as_ref().expect("gate");
    gate.entered.notified().await;

    let dropped = orchestrator.run_cycle().await;
    assert_eq!(dropped.skipped, Some(CycleSkip::Busy));

    gate.release.notify_one();
    let finished = running.await.expect("join cycle");
    assert_eq!(finished.skipped, None);
}

#[tokio::test]
async fn batch_generation_stops_when_cancelled() {
    let cancel = Arc::new(AtomicBool::new(false));
    let mailbox = Arc::new(FakeMailbox::with(vec![
        message("1", "a@example.com", "First"),
        message("2", "b@example.com", "Second"),
        message("3", "c@example.com", "Third"),
    ]));
    let completion = Arc::new(ScriptedCompletion {
        cancel_on_call: Some(cancel.clone()),
        ..ScriptedCompletion::new("local", Some("Draft text"))
    });
    let orchestrator = orchestrator(mailbox.clone(), completion.clone(), false);

    let report = orchestrator.generate_batch(&cancel).await.expect("batch");
    assert_eq!(report.pending, 3);
    assert_eq!(report.generated, 1);
    assert!(report.cancelled);
    assert_eq!(orchestrator.stores().drafts.all().len(), 1);
    assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
    assert!(mailbox.sent().is_empty());
}

#[tokio::test]
async fn staged_drafts_are_sent_and_not_resent() {
    let mailbox = Arc::new(FakeMailbox::with(vec![message("5", "Erin <erin@example.com>", "Invoice")]));
    let completion = Arc::new(ScriptedCompletion::new("local", Some("Invoice attached.")));
    let orchestrator = orchestrator(mailbox.clone(), completion, false);

    let draft = orchestrator.regenerate(&"5".into()).await.expect("draft");
    assert_eq!(draft.body, "Invoice attached.");

    let outcomes = orchestrator.send_all_staged().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].outcome, ReplyOutcome::Replied);
    assert!(orchestrator.stores().drafts.all().is_empty());
    assert!(orchestrator.stores().replied.contains(&"5".into()));

    let again = orchestrator.send_staged(&"5".into()).await;
    assert!(matches!(again, Err(OrchestratorError::AlreadyReplied(_))));
    assert_eq!(mailbox.sent().len(), 1);
}

#[tokio::test]
async fn batch_is_refused_in_auto_send_mode() {
    let mailbox = Arc::new(FakeMailbox::with(vec![message("1", "a@example.com", "First")]));
    let completion = Arc::new(ScriptedCompletion::new("local", Some("Draft")));
    let orchestrator = orchestrator(mailbox, completion, true);

    let cancel = AtomicBool::new(false);
    let refused = orchestrator.generate_batch(&cancel).await;
    assert!(matches!(refused, Err(OrchestratorError::AutoSendActive)));
}

#[tokio::test]
async fn unreachable_full_fetch_leaves_message_for_next_cycle() {
    let mailbox = Arc::new(FakeMailbox {
        fail_full_fetch: true,
        ..FakeMailbox::with(vec![message("12", "fay@example.com", "Opening hours")])
    });
    let completion = Arc::new(ScriptedCompletion::new("local", Some("We open at nine.")));
    let orchestrator = orchestrator(mailbox.clone(), completion.clone(), true);

    let report = orchestrator.run_cycle_with(forced()).await;
    assert_eq!(report.candidates, 1);
    assert!(matches!(report.outcomes[0].outcome, ReplyOutcome::Failed(_)));
    assert!(mailbox.sent().is_empty());
    assert!(!orchestrator.stores().replied.contains(&"12".into()));
    assert_eq!(completion.calls.load(Ordering::SeqCst), 0);

    let cancel = AtomicBool::new(false);
    orchestrator
        .stores()
        .settings
        .update(|settings| {
            settings.set_half_auto(true);
            Ok(())
        })
        .expect("switch to half-auto");
    let batch = orchestrator.generate_batch(&cancel).await.expect("batch");
    assert_eq!(batch.generated, 0);
    assert_eq!(batch.errors.len(), 1);
    assert!(orchestrator.stores().drafts.all().is_empty());
}
