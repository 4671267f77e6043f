pub mod json;
pub mod table;

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::orchestrator::{BatchReport, CycleReport, MessageOutcome};
use crate::providers::Message;
use crate::store::models::{DailyCount, GeneratedReply, SentLogEntry};
use crate::store::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// What `aimail status` reports.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub data_dir: String,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub mode: String,
    pub send_window: String,
    pub replied: usize,
    pub drafts: usize,
    pub sent: usize,
    pub snapshot: usize,
    pub knowledge_chunks: usize,
    pub demo_over: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftItem {
    pub id: String,
    pub subject: String,
    pub body: String,
}

pub fn draft_items(drafts: &BTreeMap<String, GeneratedReply>) -> Vec<DraftItem> {
    drafts
        .iter()
        .map(|(id, reply)| DraftItem {
            id: id.clone(),
            subject: reply.subject.clone(),
            body: reply.body.clone(),
        })
        .collect()
}

pub fn format_messages(format: OutputFormat, messages: &[Message]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_messages(messages)),
        OutputFormat::Json => json::format_value(messages),
    }
}

pub fn format_message(format: OutputFormat, message: &Message) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_message(message)),
        OutputFormat::Json => json::format_value(message),
    }
}

pub fn format_drafts(format: OutputFormat, drafts: &[DraftItem]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_drafts(drafts)),
        OutputFormat::Json => json::format_value(drafts),
    }
}

pub fn format_draft(format: OutputFormat, draft: &DraftItem) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_draft(draft)),
        OutputFormat::Json => json::format_value(draft),
    }
}

pub fn format_sent_log(format: OutputFormat, entries: &[SentLogEntry]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_sent_log(entries)),
        OutputFormat::Json => json::format_value(entries),
    }
}

pub fn format_reply_stats(format: OutputFormat, counts: &[DailyCount]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_reply_stats(counts)),
        OutputFormat::Json => json::format_value(counts),
    }
}

pub fn format_cycle(format: OutputFormat, report: &CycleReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_cycle(report)),
        OutputFormat::Json => json::format_value(report),
    }
}

pub fn format_batch(format: OutputFormat, report: &BatchReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_batch(report)),
        OutputFormat::Json => json::format_value(report),
    }
}

pub fn format_outcomes(format: OutputFormat, outcomes: &[MessageOutcome]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_outcomes(outcomes)),
        OutputFormat::Json => json::format_value(outcomes),
    }
}

pub fn format_settings(format: OutputFormat, settings: &Settings) -> Result<String> {
    match format {
        OutputFormat::Table => table::format_settings(settings),
        OutputFormat::Json => json::format_value(settings),
    }
}

pub fn format_status(format: OutputFormat, status: &StatusSummary) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_status(status)),
        OutputFormat::Json => json::format_value(status),
    }
}
