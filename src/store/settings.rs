use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StoreError;

pub const DEFAULT_SPAM_KEYWORDS: &[&str] = &[
    "hirlevel",
    "no-reply",
    "noreply",
    "no reply",
    "spam",
    "junk",
    "promóció",
    "reklám",
    "ad",
    "free money",
    "guaranteed",
    "amazing deal",
    "act now",
    "limited time",
    "click here",
    "buy now",
];

const MIN_POLL_INTERVAL_SECS: u64 = 5;

/// User preferences persisted in `settings.json`. Every field has a default
/// so partial files from older versions load cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub auto_send: bool,
    pub half_auto: bool,
    pub auto_send_start_time: String,
    pub auto_send_end_time: String,
    pub greeting: String,
    pub signature: String,
    pub signature_text: String,
    pub signature_image: String,
    pub ignored_emails: Vec<String>,
    pub min_email_date: String,
    pub max_email_date: String,
    pub from_date: String,
    pub notify_on_auto_reply: bool,
    pub notification_email: String,
    pub web_urls: Vec<String>,
    pub activation_email: Option<String>,
    pub spam_keywords: Vec<String>,
    pub poll_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_send: false,
            half_auto: false,
            auto_send_start_time: "08:00".to_string(),
            auto_send_end_time: "16:00".to_string(),
            greeting: String::new(),
            signature: String::new(),
            signature_text: String::new(),
            signature_image: String::new(),
            ignored_emails: Vec::new(),
            min_email_date: String::new(),
            max_email_date: String::new(),
            from_date: String::new(),
            notify_on_auto_reply: false,
            notification_email: String::new(),
            web_urls: Vec::new(),
            activation_email: None,
            spam_keywords: DEFAULT_SPAM_KEYWORDS
                .iter()
                .map(|keyword| keyword.to_string())
                .collect(),
            poll_interval_secs: 30,
        }
    }
}

impl Settings {
    /// Applies the load-time invariants: auto-send beats half-auto and the
    /// ignore list holds no blank entries.
    pub fn normalized(mut self) -> Self {
        if self.auto_send && self.half_auto {
            self.half_auto = false;
        }
        self.ignored_emails = clean_list(std::mem::take(&mut self.ignored_emails));
        self.web_urls = clean_list(std::mem::take(&mut self.web_urls));
        self
    }

    pub fn set_auto_send(&mut self, enabled: bool) {
        self.auto_send = enabled;
        if enabled {
            self.half_auto = false;
        }
    }

    pub fn set_half_auto(&mut self, enabled: bool) {
        self.half_auto = enabled;
        if enabled {
            self.auto_send = false;
        }
    }

    pub fn set_ignored_emails(&mut self, entries: Vec<String>) {
        self.ignored_emails = clean_list(entries);
    }

    pub fn min_date(&self) -> Option<NaiveDate> {
        parse_day(&self.min_email_date).or_else(|| parse_day(&self.from_date))
    }

    pub fn max_date(&self) -> Option<NaiveDate> {
        parse_day(&self.max_email_date)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }

    pub fn signature_text_or_default(&self) -> &str {
        let text = self.signature_text.trim();
        if text.is_empty() {
            "AiMail"
        } else {
            text
        }
    }

    /// Sets one field by its camelCase name from command-line text.
    ///
    /// Booleans accept `on`/`off`, lists are comma separated and an empty
    /// value clears optional fields.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<(), StoreError> {
        let mut document = serde_json::to_value(&*self)?;
        let object = document
            .as_object_mut()
            .ok_or_else(|| StoreError::Config("settings are not a JSON object".to_string()))?;
        let current = object
            .get(key)
            .ok_or_else(|| StoreError::Config(format!("unknown setting '{key}'")))?;

        let value = coerce_value(key, current, raw)?;
        object.insert(key.to_string(), value);

        let mut updated: Settings = serde_json::from_value(document)?;
        match key {
            "autoSend" => updated.set_auto_send(updated.auto_send),
            "halfAuto" => updated.set_half_auto(updated.half_auto),
            _ => {}
        }
        *self = updated.normalized();
        Ok(())
    }
}

fn coerce_value(key: &str, current: &Value, raw: &str) -> Result<Value, StoreError> {
    let raw = raw.trim();
    let invalid = || StoreError::Config(format!("invalid value '{raw}' for setting '{key}'"));

    match current {
        Value::Bool(_) => match raw.to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "off" | "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
        Value::Number(_) => raw
            .parse::<u64>()
            .map(Value::from)
            .map_err(|_| invalid()),
        Value::Array(_) => Ok(Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| Value::String(entry.to_string()))
                .collect(),
        )),
        Value::Null if raw.is_empty() => Ok(Value::Null),
        _ if key == "activationEmail" && raw.is_empty() => Ok(Value::Null),
        _ => Ok(Value::String(raw.to_string())),
    }
}

fn clean_list(entries: Vec<String>) -> Vec<String> {
    entries
        .into_iter()
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn parse_day(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y.%m.%d"))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y/%m/%d"))
        .ok()
}
