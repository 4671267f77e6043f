use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use self::models::{AccountCredentials, AuthState, DailyCount, GeneratedReply, ProviderKind, SentLogEntry};
use self::settings::Settings;
use crate::providers::{Message, MessageId};

pub mod knowledge;
pub mod models;
pub mod settings;
pub mod token_cache;

pub const REPLIED_FILE: &str = "repliedEmails.json";
pub const DRAFTS_FILE: &str = "GeneratedReplies.json";
pub const SNAPSHOT_FILE: &str = "cached_emails.json";
pub const SENT_LOG_FILE: &str = "sentEmailsLog.json";
pub const SETTINGS_FILE: &str = "settings.json";
pub const AUTH_FILE: &str = "auth_state.json";
pub const TOKEN_FILE: &str = "token.json";

pub const SENT_LOG_CAPACITY: usize = 500;
const STATS_WINDOW_ENTRIES: usize = 100;
const STATS_DAYS: i64 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

/// One JSON document on disk. Reads never fail: a missing or unreadable
/// file yields `T::default()`.
#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> T {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return T::default(),
            Err(error) => {
                warn!("failed to read {}: {}", self.path.display(), error);
                return T::default();
            }
        };

        if raw.trim().is_empty() {
            return T::default();
        }

        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(error) => {
                warn!("ignoring corrupt {}: {}", self.path.display(), error);
                T::default()
            }
        }
    }

    pub fn write(&self, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let rendered = serde_json::to_string_pretty(value)?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        std::fs::write(&temp, rendered)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }

    pub fn remove(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Ids that already received a reply. Membership is append-only.
#[derive(Debug)]
pub struct RepliedStore {
    file: JsonStore<Vec<MessageId>>,
    ids: Mutex<HashSet<MessageId>>,
}

impl RepliedStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let file: JsonStore<Vec<MessageId>> = JsonStore::new(path);
        let ids = file.read().into_iter().collect();
        Self {
            file,
            ids: Mutex::new(ids),
        }
    }

    // A poisoned set still holds every recorded id; keep using it.
    fn ids(&self) -> MutexGuard<'_, HashSet<MessageId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids().contains(id)
    }

    /// Updates memory first; a failed write leaves the id recorded in memory.
    pub fn record(&self, id: &MessageId) -> Result<(), StoreError> {
        let snapshot = {
            let mut ids = self.ids();
            if !ids.insert(id.clone()) {
                return Ok(());
            }
            ids.iter().cloned().collect::<BTreeSet<_>>()
        };

        self.file
            .write(&snapshot.into_iter().collect::<Vec<_>>())
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct DraftStore {
    file: JsonStore<BTreeMap<String, GeneratedReply>>,
}

impl DraftStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonStore::new(path),
        }
    }

    pub fn all(&self) -> BTreeMap<String, GeneratedReply> {
        self.file.read()
    }

    pub fn get(&self, id: &MessageId) -> Option<GeneratedReply> {
        self.file.read().remove(id.as_str())
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.file.read().contains_key(id.as_str())
    }

    pub fn put(&self, id: &MessageId, reply: GeneratedReply) -> Result<(), StoreError> {
        let mut drafts = self.file.read();
        drafts.insert(id.to_string(), reply);
        self.file.write(&drafts)
    }

    pub fn remove(&self, id: &MessageId) -> Result<(), StoreError> {
        let mut drafts = self.file.read();
        if drafts.remove(id.as_str()).is_some() {
            self.file.write(&drafts)?;
        }
        Ok(())
    }
}

/// Last filtered unread listing, persisted for offline display.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    file: JsonStore<Vec<Message>>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonStore::new(path),
        }
    }

    pub fn read(&self) -> Vec<Message> {
        self.file.read()
    }

    pub fn replace(&self, messages: &[Message]) -> Result<(), StoreError> {
        self.file.write(&messages.to_vec())
    }

    pub fn remove(&self, id: &MessageId) -> Result<(), StoreError> {
        let mut messages = self.file.read();
        let before = messages.len();
        messages.retain(|message| &message.id != id);
        if messages.len() != before {
            self.file.write(&messages)?;
        }
        Ok(())
    }

    pub fn find(&self, id: &MessageId) -> Option<Message> {
        self.file.read().into_iter().find(|message| &message.id == id)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.file.remove()
    }
}

#[derive(Debug, Clone)]
pub struct SentLog {
    file: JsonStore<Vec<SentLogEntry>>,
}

impl SentLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonStore::new(path),
        }
    }

    pub fn entries(&self) -> Vec<SentLogEntry> {
        self.file.read()
    }

    pub fn len(&self) -> usize {
        self.file.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends and drops the oldest entries beyond [`SENT_LOG_CAPACITY`].
    pub fn append(&self, entry: SentLogEntry) -> Result<(), StoreError> {
        let mut entries = self.file.read();
        entries.push(entry);
        if entries.len() > SENT_LOG_CAPACITY {
            let overflow = entries.len() - SENT_LOG_CAPACITY;
            entries.drain(..overflow);
        }
        self.file.write(&entries)
    }

    /// Sends per day for the five days ending `today`, oldest first, counted
    /// over the most recent hundred entries.
    pub fn daily_counts(&self, today: NaiveDate) -> Vec<DailyCount> {
        let entries = self.file.read();
        let recent = &entries[entries.len().saturating_sub(STATS_WINDOW_ENTRIES)..];

        (0..STATS_DAYS)
            .rev()
            .map(|offset| {
                let date = today - Duration::days(offset);
                let count = recent
                    .iter()
                    .filter(|entry| entry.date.date_naive() == date)
                    .count();
                DailyCount { date, count }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AuthStore {
    file: JsonStore<AuthState>,
}

impl AuthStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonStore::new(path),
        }
    }

    pub fn load(&self) -> AuthState {
        self.file.read()
    }

    pub fn set_gmail(&self, credentials: AccountCredentials) -> Result<AuthState, StoreError> {
        self.replace(ProviderKind::Gmail, credentials)
    }

    pub fn set_imap(&self, credentials: AccountCredentials) -> Result<AuthState, StoreError> {
        if credentials.imap_host.as_deref().map_or(true, |host| host.trim().is_empty()) {
            return Err(StoreError::Config("imap login requires a host".to_string()));
        }
        self.replace(ProviderKind::Imap, credentials)
    }

    pub fn logout(&self) -> Result<(), StoreError> {
        self.file.write(&AuthState::default())
    }

    fn replace(
        &self,
        provider: ProviderKind,
        credentials: AccountCredentials,
    ) -> Result<AuthState, StoreError> {
        if credentials.email.trim().is_empty() {
            return Err(StoreError::Config("login requires an email address".to_string()));
        }
        let state = AuthState {
            is_authenticated: true,
            provider: Some(provider),
            credentials: Some(credentials),
        };
        self.file.write(&state)?;
        Ok(state)
    }
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    file: JsonStore<Settings>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonStore::new(path),
        }
    }

    pub fn load(&self) -> Settings {
        self.file.read().normalized()
    }

    pub fn save(&self, settings: &Settings) -> Result<(), StoreError> {
        self.file.write(&settings.clone().normalized())
    }

    pub fn update<F>(&self, apply: F) -> Result<Settings, StoreError>
    where
        F: FnOnce(&mut Settings) -> Result<(), StoreError>,
    {
        let mut settings = self.load();
        apply(&mut settings)?;
        let settings = settings.normalized();
        self.file.write(&settings)?;
        Ok(settings)
    }
}

/// Every persisted document under one data directory.
#[derive(Debug)]
pub struct StateStores {
    pub data_dir: PathBuf,
    pub replied: RepliedStore,
    pub drafts: DraftStore,
    pub snapshot: SnapshotStore,
    pub sent_log: SentLog,
    pub auth: AuthStore,
    pub settings: SettingsStore,
    pub knowledge: knowledge::KnowledgeStore,
}

impl StateStores {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            replied: RepliedStore::open(data_dir.join(REPLIED_FILE)),
            drafts: DraftStore::new(data_dir.join(DRAFTS_FILE)),
            snapshot: SnapshotStore::new(data_dir.join(SNAPSHOT_FILE)),
            sent_log: SentLog::new(data_dir.join(SENT_LOG_FILE)),
            auth: AuthStore::new(data_dir.join(AUTH_FILE)),
            settings: SettingsStore::new(data_dir.join(SETTINGS_FILE)),
            knowledge: knowledge::KnowledgeStore::open(data_dir),
        })
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE)
    }

    pub fn today() -> NaiveDate {
        Utc::now().date_naive()
    }
}
