use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::orchestrator::{BatchReport, CycleReport, CycleSkip, MessageOutcome, ReplyOutcome};
use crate::output::{DraftItem, StatusSummary};
use crate::providers::Message;
use crate::store::models::{DailyCount, SentLogEntry};
use crate::store::settings::Settings;

const ID_WIDTH: usize = 18;
const FROM_WIDTH: usize = 28;
const SUBJECT_WIDTH: usize = 48;
const DATE_WIDTH: usize = 12;
const PREVIEW_WIDTH: usize = 60;

pub fn format_messages(messages: &[Message]) -> String {
    if messages.is_empty() {
        return "No unread emails.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<from$}  {:<subject$}  {:<date$}\n",
        "ID",
        "From",
        "Subject",
        "Date",
        id = ID_WIDTH,
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH,
        date = DATE_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(DATE_WIDTH)
    ));

    for message in messages {
        let date = message
            .timestamp()
            .map(relative_date)
            .unwrap_or_else(|| message.date.clone());
        out.push_str(&format!(
            "{:<id$}  {}  {}  {}\n",
            truncate_for_width(message.id.as_str(), ID_WIDTH),
            pad(&truncate_for_width(or_placeholder(&message.from, "(unknown)"), FROM_WIDTH), FROM_WIDTH),
            pad(&truncate_for_width(or_placeholder(&message.subject, "(no subject)"), SUBJECT_WIDTH), SUBJECT_WIDTH),
            truncate_for_width(&date, DATE_WIDTH),
            id = ID_WIDTH
        ));
    }

    out
}

pub fn format_message(message: &Message) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", message.id));
    out.push_str(&format!("Subject: {}\n", or_placeholder(&message.subject, "(no subject)")));
    out.push_str(&format!("From: {}\n", or_placeholder(&message.from, "(unknown)")));
    match message.timestamp() {
        Some(timestamp) => out.push_str(&format!("Date: {} ({})\n", message.date, relative_date(timestamp))),
        None => out.push_str(&format!("Date: {}\n", message.date)),
    }
    if !message.label_ids.is_empty() {
        out.push_str(&format!("Labels: {}\n", message.label_ids.join(", ")));
    }
    if !message.attachments.is_empty() {
        let names: Vec<String> = message
            .attachments
            .iter()
            .map(|attachment| format!("{} ({} bytes)", attachment.filename, attachment.size))
            .collect();
        out.push_str(&format!("Attachments: {}\n", names.join(", ")));
    }
    if !message.images.is_empty() {
        out.push_str(&format!("Images: {}\n", message.images.len()));
    }

    out.push('\n');
    out.push_str("Body\n");
    out.push_str("----\n");
    let body = if message.body.trim().is_empty() {
        or_placeholder(&message.snippet, "(empty)")
    } else {
        message.body.as_str()
    };
    out.push_str(body);
    out.push('\n');
    out
}

pub fn format_drafts(drafts: &[DraftItem]) -> String {
    if drafts.is_empty() {
        return "No staged drafts.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<subject$}  {}\n",
        "ID",
        "Subject",
        "Preview",
        id = ID_WIDTH,
        subject = SUBJECT_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(PREVIEW_WIDTH)
    ));
    for draft in drafts {
        let preview = draft.body.split_whitespace().collect::<Vec<_>>().join(" ");
        out.push_str(&format!(
            "{:<id$}  {}  {}\n",
            truncate_for_width(&draft.id, ID_WIDTH),
            pad(&truncate_for_width(&draft.subject, SUBJECT_WIDTH), SUBJECT_WIDTH),
            truncate_for_width(&preview, PREVIEW_WIDTH),
            id = ID_WIDTH
        ));
    }
    out
}

pub fn format_draft(draft: &DraftItem) -> String {
    format!(
        "ID: {}\nSubject: {}\n\n{}\n",
        draft.id, draft.subject, draft.body
    )
}

pub fn format_sent_log(entries: &[SentLogEntry]) -> String {
    if entries.is_empty() {
        return "Nothing sent yet.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<date$}  {:<to$}  {}\n",
        "Sent",
        "To",
        "Subject",
        date = DATE_WIDTH,
        to = FROM_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}\n",
        "-".repeat(DATE_WIDTH),
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH)
    ));
    for entry in entries.iter().rev() {
        out.push_str(&format!(
            "{:<date$}  {}  {}\n",
            truncate_for_width(&relative_date(entry.date), DATE_WIDTH),
            pad(&truncate_for_width(&entry.to, FROM_WIDTH), FROM_WIDTH),
            truncate_for_width(&entry.subject, SUBJECT_WIDTH),
            date = DATE_WIDTH
        ));
    }
    out
}

pub fn format_reply_stats(counts: &[DailyCount]) -> String {
    let total: usize = counts.iter().map(|day| day.count).sum();
    let peak = counts.iter().map(|day| day.count).max().unwrap_or(0);

    let mut out = String::new();
    out.push_str("Replies per day\n");
    out.push_str("===============\n");
    for day in counts {
        let bar = if peak == 0 {
            String::new()
        } else {
            "#".repeat((day.count * 30).div_ceil(peak))
        };
        out.push_str(&format!("{}  {:>4}  {}\n", day.date.format("%Y-%m-%d"), day.count, bar));
    }
    out.push_str(&format!("Total: {total}\n"));
    out
}

pub fn format_cycle(report: &CycleReport) -> String {
    if let Some(reason) = &report.skipped {
        return match reason {
            CycleSkip::Busy => "Cycle skipped: another cycle is running.".to_string(),
            CycleSkip::Offline => "Cycle skipped: offline.".to_string(),
            CycleSkip::ProviderUnavailable(detail) => format!("Cycle skipped: provider unavailable ({detail})."),
        };
    }

    let mut out = format!(
        "Fetched {} unread, {} candidate(s), {} replied.\n",
        report.fetched,
        report.candidates,
        report.replied()
    );
    if !report.outcomes.is_empty() {
        out.push('\n');
        out.push_str(&format_outcomes(&report.outcomes));
    }
    out
}

pub fn format_outcomes(outcomes: &[MessageOutcome]) -> String {
    if outcomes.is_empty() {
        return "Nothing to send.".to_string();
    }

    let mut out = String::new();
    for entry in outcomes {
        let status = match &entry.outcome {
            ReplyOutcome::Replied => "replied".to_string(),
            ReplyOutcome::Skipped(reason) => format!("skipped ({reason})"),
            ReplyOutcome::Failed(error) => format!("\u{1b}[31mfailed\u{1b}[0m ({error})"),
        };
        out.push_str(&format!(
            "{:<id$}  {}\n",
            truncate_for_width(entry.id.as_str(), ID_WIDTH),
            status,
            id = ID_WIDTH
        ));
    }
    out
}

pub fn format_batch(report: &BatchReport) -> String {
    let mut out = format!("Generated {} of {} draft(s)", report.generated, report.pending);
    if report.cancelled {
        out.push_str(" (cancelled)");
    }
    out.push_str(".\n");
    for error in &report.errors {
        out.push_str(&format!("  error: {error}\n"));
    }
    out
}

/// One `key = value` line per setting, keys as stored on disk.
pub fn format_settings(settings: &Settings) -> Result<String> {
    let value = serde_json::to_value(settings)?;
    let mut out = String::new();
    if let Value::Object(fields) = value {
        let width = fields.keys().map(|key| key.len()).max().unwrap_or(0);
        for (key, field) in fields {
            let rendered = match field {
                Value::String(text) => text,
                Value::Null => "-".to_string(),
                Value::Array(items) => items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string).unwrap_or_else(|| item.to_string()))
                    .collect::<Vec<_>>()
                    .join(", "),
                other => other.to_string(),
            };
            out.push_str(&format!("{key:<width$}  {rendered}\n"));
        }
    }
    Ok(out)
}

pub fn format_status(status: &StatusSummary) -> String {
    let mut out = String::new();
    out.push_str("AiMail Status\n");
    out.push_str("=============\n");
    out.push_str(&format!("Data dir:  {}\n", status.data_dir));
    if status.authenticated {
        out.push_str(&format!(
            "Account:   {} ({})\n",
            status.account.as_deref().unwrap_or("(unknown)"),
            status.provider.as_deref().unwrap_or("-")
        ));
    } else {
        out.push_str("Account:   not logged in\n");
    }
    out.push_str(&format!("Mode:      {}\n", status.mode));
    out.push_str(&format!("Window:    {}\n", status.send_window));
    out.push_str(&format!("Replied:   {}\n", status.replied));
    out.push_str(&format!("Drafts:    {}\n", status.drafts));
    out.push_str(&format!("Sent log:  {}\n", status.sent));
    out.push_str(&format!("Unread:    {}\n", status.snapshot));
    out.push_str(&format!("Knowledge: {} chunk(s)\n", status.knowledge_chunks));
    if status.demo_over {
        out.push_str("\u{1b}[31mTrial is over.\u{1b}[0m\n");
    }
    out
}

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.trim().is_empty() {
        placeholder
    } else {
        value
    }
}

fn relative_date(timestamp: DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(timestamp);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    timestamp.format("%Y-%m-%d").to_string()
}

/// `format!` pads by char count; wide glyphs need display-width padding.
fn pad(value: &str, width: usize) -> String {
    let used = UnicodeWidthStr::width(value);
    format!("{value}{}", " ".repeat(width.saturating_sub(used)))
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, Utc};

    use crate::orchestrator::filters::SkipReason;
    use crate::orchestrator::{BatchReport, MessageOutcome, ReplyOutcome};
    use crate::providers::Message;
    use crate::store::models::DailyCount;
    use crate::store::settings::Settings;

    use super::{
        format_batch, format_message, format_messages, format_outcomes, format_reply_stats, format_settings,
        truncate_for_width,
    };

    fn sample_message() -> Message {
        Message {
            id: "18f2a".into(),
            from: "Client Name <client@example.com>".to_string(),
            subject: "A very long subject line that should be truncated in table output because it exceeds width"
                .to_string(),
            internal_date: Some((Utc::now() - Duration::hours(2)).timestamp_millis()),
            body: "Could you send a quote?".to_string(),
            ..Message::default()
        }
    }

    #[test]
    fn message_table_has_headers_and_truncates() {
        let rendered = format_messages(&[sample_message()]);
        assert!(rendered.contains("From"));
        assert!(rendered.contains("Subject"));
        assert!(rendered.contains("2h ago"));
        assert!(rendered.contains('…'));
        assert_eq!(format_messages(&[]), "No unread emails.");
    }

    #[test]
    fn message_detail_shows_body() {
        let rendered = format_message(&sample_message());
        assert!(rendered.contains("ID: 18f2a"));
        assert!(rendered.contains("Could you send a quote?"));
    }

    #[test]
    fn width_truncation_respects_wide_chars() {
        assert_eq!(truncate_for_width("short", 10), "short");
        assert_eq!(truncate_for_width("árvíztűrő tükörfúrógép", 8), "árvíztű…");
        assert_eq!(truncate_for_width("日本語テキスト", 5), "日本…");
    }

    #[test]
    fn outcomes_show_skip_reason() {
        let rendered = format_outcomes(&[MessageOutcome {
            id: "7".into(),
            outcome: ReplyOutcome::Skipped(SkipReason::NoReply),
        }]);
        assert!(rendered.contains("skipped (no-reply sender)"));
    }

    #[test]
    fn stats_total_and_bars() {
        let day = |d| NaiveDate::from_ymd_opt(2025, 3, d).expect("date");
        let rendered = format_reply_stats(&[
            DailyCount { date: day(1), count: 0 },
            DailyCount { date: day(2), count: 3 },
        ]);
        assert!(rendered.contains("2025-03-01     0  \n"));
        assert!(rendered.contains(&format!("2025-03-02     3  {}\n", "#".repeat(30))));
        assert!(rendered.ends_with("Total: 3\n"));
    }

    #[test]
    fn batch_summary_mentions_cancellation() {
        let rendered = format_batch(&BatchReport {
            pending: 4,
            generated: 1,
            cancelled: true,
            errors: vec![],
        });
        assert_eq!(rendered, "Generated 1 of 4 draft(s) (cancelled).\n");
    }

    #[test]
    fn settings_render_as_key_value_lines() {
        let rendered = format_settings(&Settings::default()).expect("settings");
        assert!(rendered.lines().any(|line| line.starts_with("autoSendStartTime") && line.ends_with("08:00")));
        assert!(rendered.lines().any(|line| line.starts_with("activationEmail") && line.ends_with('-')));
    }
}
