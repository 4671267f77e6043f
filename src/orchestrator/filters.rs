use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;

use crate::providers::Message;
use crate::store::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ProviderSpam,
    SpamKeyword,
    IgnoredSender,
    OutOfDateRange,
    NoReply,
    AlreadyReplied,
    InProgress,
    NotFound,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::ProviderSpam => "provider spam",
            Self::SpamKeyword => "spam keyword",
            Self::IgnoredSender => "ignored sender",
            Self::OutOfDateRange => "out of date range",
            Self::NoReply => "no-reply sender",
            Self::AlreadyReplied => "already replied",
            Self::InProgress => "already in progress",
            Self::NotFound => "message gone",
        };
        f.write_str(label)
    }
}

/// The pure part of a cycle: which fetched messages are candidates.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    spam: Option<Regex>,
    ignored: Vec<String>,
    min: Option<DateTime<Utc>>,
    max: Option<DateTime<Utc>>,
}

impl MessageFilter {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            spam: keyword_regex(&settings.spam_keywords),
            ignored: settings
                .ignored_emails
                .iter()
                .map(|entry| entry.trim().to_lowercase())
                .filter(|entry| !entry.is_empty())
                .collect(),
            min: settings.min_date().map(start_of_day),
            max: settings.max_date().map(end_of_day),
        }
    }

    /// First matching reason in filter order, or `None` for a candidate.
    pub fn classify(&self, message: &Message) -> Option<SkipReason> {
        if message.is_provider_spam() {
            return Some(SkipReason::ProviderSpam);
        }

        if let Some(spam) = &self.spam {
            if spam.is_match(&message.subject) || spam.is_match(&message.from) {
                return Some(SkipReason::SpamKeyword);
            }
        }

        let from = message.from.to_lowercase();
        if self.ignored.iter().any(|entry| from.contains(entry.as_str())) {
            return Some(SkipReason::IgnoredSender);
        }

        if self.min.is_some() || self.max.is_some() {
            let Some(timestamp) = message.timestamp() else {
                return Some(SkipReason::OutOfDateRange);
            };
            if self.min.is_some_and(|min| timestamp < min) || self.max.is_some_and(|max| timestamp > max) {
                return Some(SkipReason::OutOfDateRange);
            }
        }

        None
    }

    pub fn partition(&self, messages: Vec<Message>) -> (Vec<Message>, Vec<(Message, SkipReason)>) {
        let mut kept = Vec::with_capacity(messages.len());
        let mut skipped = Vec::new();
        for message in messages {
            match self.classify(&message) {
                Some(reason) => skipped.push((message, reason)),
                None => kept.push(message),
            }
        }
        (kept, skipped)
    }
}

/// Whole-word, case-insensitive alternation over the escaped keywords.
pub fn keyword_regex(keywords: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|keyword| keyword.trim())
        .filter(|keyword| !keyword.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).ok()
}

pub fn is_noreply(message: &Message) -> bool {
    let haystack = format!("{} {}", message.subject, message.from).to_lowercase();
    ["noreply", "no-reply", "no reply"]
        .iter()
        .any(|needle| haystack.contains(needle))
}

/// Inclusive `HH:MM` window compared lexically, as stored in settings.
pub fn within_send_window(now: NaiveTime, start: &str, end: &str) -> bool {
    let current = now.format("%H:%M").to_string();
    start.trim() <= current.as_str() && current.as_str() <= end.trim()
}

/// Local midnight that opens `day`, as an instant.
fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| local_fallback(naive))
}

fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    let last = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
    let naive = day.and_time(last);
    Local
        .from_local_datetime(&naive)
        .latest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| local_fallback(naive))
}

// Wall-clock time skipped by a DST jump: use the current local offset.
fn local_fallback(naive: NaiveDateTime) -> DateTime<Utc> {
    let offset = *Local::now().offset();
    naive.and_utc() - chrono::Duration::seconds(i64::from(offset.local_minus_utc()))
}
