use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::providers::{FetchMode, Message, MessageId, ProviderClient, ProviderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Minimum gap between two full fetches.
    pub min_fetch_interval: Duration,
    /// Minimum gap before a metadata-only fetch, measured from any fetch.
    pub metadata_interval: Duration,
    pub max_age: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_fetch_interval: Duration::from_secs(30),
            metadata_interval: Duration::from_secs(15),
            max_age: Duration::from_secs(300),
            max_entries: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub message: Message,
    pub cached_at: Instant,
    pub has_body: bool,
}

impl CacheEntry {
    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.cached_at) > max_age
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub new_ids: Vec<MessageId>,
    pub removed_ids: Vec<MessageId>,
}

impl Reconciliation {
    pub fn has_new(&self) -> bool {
        !self.new_ids.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        self.has_new() || !self.removed_ids.is_empty()
    }
}

/// Unread messages keyed by id, plus fetch bookkeeping for throttling.
#[derive(Debug)]
pub struct MailCache {
    config: CacheConfig,
    entries: HashMap<MessageId, CacheEntry>,
    last_fetch: Option<Instant>,
    last_full_fetch: Option<Instant>,
}

impl MailCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            last_fetch: None,
            last_full_fetch: None,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn should_fetch(&self, metadata_only: bool) -> bool {
        let now = Instant::now();
        if metadata_only {
            self.last_fetch
                .map_or(true, |at| now.saturating_duration_since(at) >= self.config.metadata_interval)
        } else {
            self.last_full_fetch
                .map_or(true, |at| now.saturating_duration_since(at) >= self.config.min_fetch_interval)
        }
    }

    pub fn mark_fetched(&mut self, mode: FetchMode) {
        let now = Instant::now();
        self.last_fetch = Some(now);
        if mode.has_body() {
            self.last_full_fetch = Some(now);
        }
    }

    /// True when no full fetch has happened within `max_age` or any entry has
    /// outlived it.
    pub fn is_stale(&self) -> bool {
        let now = Instant::now();
        let cache_stale = self
            .last_full_fetch
            .map_or(true, |at| now.saturating_duration_since(at) > self.config.max_age);
        cache_stale
            || self
                .entries
                .values()
                .any(|entry| entry.is_stale(now, self.config.max_age))
    }

    /// Drops every cached id missing from `live_ids` and reports the ids the
    /// cache has not seen yet.
    pub fn reconcile(&mut self, live_ids: &[MessageId]) -> Reconciliation {
        let live: HashSet<&MessageId> = live_ids.iter().collect();

        let mut removed_ids: Vec<MessageId> = self
            .entries
            .keys()
            .filter(|id| !live.contains(id))
            .cloned()
            .collect();
        removed_ids.sort();
        for id in &removed_ids {
            self.entries.remove(id);
        }

        let mut seen = HashSet::new();
        let new_ids = live_ids
            .iter()
            .filter(|id| !self.entries.contains_key(*id) && seen.insert(*id))
            .cloned()
            .collect();

        Reconciliation {
            new_ids,
            removed_ids,
        }
    }

    pub fn upsert(&mut self, messages: Vec<Message>, has_body: bool) {
        let now = Instant::now();
        for message in messages {
            // A header-only refresh must not replace a cached body.
            if !has_body
                && self
                    .entries
                    .get(&message.id)
                    .is_some_and(|existing| existing.has_body)
            {
                continue;
            }
            self.entries.insert(
                message.id.clone(),
                CacheEntry {
                    message,
                    cached_at: now,
                    has_body,
                },
            );
        }
        self.enforce_capacity();
    }

    fn enforce_capacity(&mut self) {
        if self.entries.len() <= self.config.max_entries {
            return;
        }
        let mut by_age: Vec<(Instant, MessageId)> = self
            .entries
            .iter()
            .map(|(id, entry)| (entry.cached_at, id.clone()))
            .collect();
        by_age.sort();
        let overflow = self.entries.len() - self.config.max_entries;
        for (_, id) in by_age.into_iter().take(overflow) {
            self.entries.remove(&id);
        }
    }

    pub fn evict(&mut self, id: &MessageId) -> Option<CacheEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    /// Cached messages, newest first.
    pub fn get_all(&self) -> Vec<Message> {
        let mut entries: Vec<&CacheEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.message
                .timestamp()
                .cmp(&a.message.timestamp())
                .then_with(|| b.cached_at.cmp(&a.cached_at))
                .then_with(|| a.message.id.cmp(&b.message.id))
        });
        entries.into_iter().map(|entry| entry.message.clone()).collect()
    }

    pub fn ids_without_body(&self, ids: &[MessageId]) -> Vec<MessageId> {
        ids.iter()
            .filter(|id| self.entries.get(*id).is_some_and(|entry| !entry.has_body))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub force: bool,
    pub mode: FetchMode,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            force: false,
            mode: FetchMode::Full,
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Provider access routed through the cache. Overlapping or throttled
/// requests are answered from the cached snapshot.
pub struct CachedMailbox {
    provider: Arc<dyn ProviderClient>,
    cache: Mutex<MailCache>,
    in_flight: AtomicBool,
}

impl CachedMailbox {
    pub fn new(provider: Arc<dyn ProviderClient>, config: CacheConfig) -> Self {
        Self {
            provider,
            cache: Mutex::new(MailCache::new(config)),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ProviderClient> {
        &self.provider
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.cache().get_all()
    }

    pub fn cached(&self, id: &MessageId) -> Option<CacheEntry> {
        self.cache().get(id).cloned()
    }

    pub fn evict(&self, id: &MessageId) {
        self.cache().evict(id);
    }

    pub fn clear(&self) {
        self.cache().clear();
    }

    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache().is_empty()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, MailCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn unread(&self, options: FetchOptions) -> Result<Vec<Message>, ProviderError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("fetch already in flight, serving cached snapshot");
            return Ok(self.snapshot());
        }
        let _guard = InFlightGuard(&self.in_flight);

        let metadata_only = options.mode == FetchMode::MetadataOnly;
        let stale = {
            let cache = self.cache();
            let stale = cache.is_stale();
            if !options.force && !cache.is_empty() && !stale && !cache.should_fetch(metadata_only)
            {
                debug!("fetch throttled, serving {} cached messages", cache.len());
                return Ok(cache.get_all());
            }
            stale
        };

        let live_ids = self.provider.list_unread_ids().await?;
        if live_ids.is_empty() {
            let mut cache = self.cache();
            cache.clear();
            cache.mark_fetched(options.mode);
            return Ok(Vec::new());
        }

        let (to_fetch, mode) = {
            let mut cache = self.cache();
            let reconciliation = cache.reconcile(&live_ids);
            if reconciliation.has_changes() {
                debug!(
                    "unread changed: {} new, {} removed",
                    reconciliation.new_ids.len(),
                    reconciliation.removed_ids.len()
                );
            }

            if (stale || options.force) && !metadata_only {
                (live_ids.clone(), FetchMode::Full)
            } else if metadata_only {
                (reconciliation.new_ids, FetchMode::MetadataOnly)
            } else {
                let mut ids = reconciliation.new_ids;
                ids.extend(cache.ids_without_body(&live_ids));
                (ids, FetchMode::Full)
            }
        };

        let fetched = if to_fetch.is_empty() {
            Vec::new()
        } else {
            self.provider.fetch_messages(&to_fetch, mode).await?
        };

        let mut cache = self.cache();
        cache.upsert(fetched, mode.has_body());
        cache.mark_fetched(mode);
        Ok(cache.get_all())
    }
}
