use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Provider-scoped message identifier. Gmail hands out hex strings, IMAP
/// hands out numeric UIDs; both are kept as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u32> for MessageId {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Self(text),
            Raw::Number(number) => Self(number.to_string()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(skip)]
    pub content: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineImage {
    pub mime_type: String,
    #[serde(skip)]
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub id: MessageId,
    pub from: String,
    pub subject: String,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_date: Option<i64>,
    pub snippet: String,
    pub body: String,
    pub label_ids: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub images: Vec<InlineImage>,
}

impl Message {
    /// Best-effort receive time; `None` when neither the internal date nor
    /// the `Date` header can be understood.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        if let Some(ms) = self.internal_date {
            if let Some(parsed) = Utc.timestamp_millis_opt(ms).single() {
                return Some(parsed);
            }
        }
        parse_message_date(&self.date)
    }

    pub fn is_provider_spam(&self) -> bool {
        self.label_ids.iter().any(|label| label == "SPAM")
    }

    pub fn sender_address(&self) -> String {
        extract_email_address(&self.from)
    }

    pub fn reply_subject(&self) -> String {
        let subject = self.subject.trim();
        if subject.to_ascii_lowercase().starts_with("re:") {
            subject.to_string()
        } else {
            format!("Re: {subject}")
        }
    }
}

/// One outgoing part other than the HTML body.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingPart {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
    /// Set for inline parts referenced as `cid:{content_id}` from the body.
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body_html: String,
    pub parts: Vec<OutgoingPart>,
}

pub fn parse_message_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Some(parsed) = parse_lenient_date(raw) {
        return Some(parsed);
    }

    // Catches RFC 2822 variants chrono rejects (missing weekday, odd zones).
    mailparse::dateparse(raw)
        .ok()
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
}

fn parse_lenient_date(raw: &str) -> Option<DateTime<Utc>> {
    static LENIENT: OnceLock<Option<Regex>> = OnceLock::new();
    let lenient = LENIENT
        .get_or_init(|| Regex::new(r"(\d{4})[.\-/ ](\d{1,2})[.\-/ ](\d{1,2})").ok())
        .as_ref()?;
    let captures = lenient.captures(raw)?;
    let year = captures[1].parse::<i32>().ok()?;
    let month = captures[2].parse::<u32>().ok()?;
    let day = captures[3].parse::<u32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

/// Pulls the bare address out of `"Name" <user@host>`; returns the trimmed
/// input when there are no angle brackets.
pub fn extract_email_address(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(start) = raw.rfind('<') {
        if let Some(end) = raw.rfind('>') {
            if end > start {
                let address = raw[start + 1..end].trim();
                if !address.is_empty() {
                    return address.to_string();
                }
            }
        }
    }
    raw.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    use super::{extract_email_address, parse_message_date, Message, MessageId};

    #[test]
    fn message_id_accepts_numbers_and_serializes_as_string() {
        let parsed: MessageId = serde_json::from_value(json!(4711)).expect("numeric id");
        assert_eq!(parsed.as_str(), "4711");
        assert_eq!(
            serde_json::to_value(&parsed).expect("serialize id"),
            json!("4711")
        );
    }

    #[test]
    fn snapshot_omits_attachment_bytes() {
        let mut message = Message {
            id: "abc".into(),
            subject: "Quote".to_string(),
            ..Message::default()
        };
        message.attachments.push(super::Attachment {
            filename: "offer.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: 3,
            content: vec![1, 2, 3],
            remote_id: None,
        });

        let value = serde_json::to_value(&message).expect("serialize message");
        assert_eq!(value["attachments"][0]["filename"], "offer.pdf");
        assert!(value["attachments"][0].get("content").is_none());
        assert!(value.get("labelIds").is_some());
    }

    #[test]
    fn date_parsing_falls_back_through_formats() {
        let rfc2822 = parse_message_date("Tue, 1 Jul 2025 10:52:37 +0200").expect("rfc2822");
        assert_eq!(rfc2822.hour(), 8);

        let rfc3339 = parse_message_date("2025-07-01T10:00:00Z").expect("rfc3339");
        assert_eq!(rfc3339.day(), 1);

        let lenient = parse_message_date("2025.07.03. 14:22").expect("lenient");
        assert_eq!((lenient.month(), lenient.day()), (7, 3));

        assert!(parse_message_date("yesterday").is_none());
        assert!(parse_message_date("").is_none());
    }

    #[test]
    fn internal_date_wins_over_header() {
        let message = Message {
            date: "Tue, 1 Jul 2025 10:52:37 +0200".to_string(),
            internal_date: Some(0),
            ..Message::default()
        };
        assert_eq!(message.timestamp().map(|ts| ts.year()), Some(1970));
    }

    #[test]
    fn extracts_bare_address() {
        assert_eq!(
            extract_email_address("\"Kiss Anna\" <anna@example.com>"),
            "anna@example.com"
        );
        assert_eq!(extract_email_address(" bob@example.com "), "bob@example.com");
    }

    #[test]
    fn reply_subject_is_not_doubled() {
        let message = Message {
            subject: "RE: invoice".to_string(),
            ..Message::default()
        };
        assert_eq!(message.reply_subject(), "RE: invoice");

        let fresh = Message {
            subject: "invoice".to_string(),
            ..Message::default()
        };
        assert_eq!(fresh.reply_subject(), "Re: invoice");
    }
}
