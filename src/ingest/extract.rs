use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use zip::ZipArchive;

use super::sheet::{read_workbook, workbook_text};
use crate::providers::mime::{html_to_text, parse_raw_message};
use crate::providers::{Attachment, MessageId};

/// Extracted text must be longer than this (trimmed) to count.
pub const MIN_TEXT_CHARS: usize = 10;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf: {0}")]
    Pdf(String),

    #[error("spreadsheet: {0}")]
    Spreadsheet(String),

    #[error("document: {0}")]
    Document(String),

    #[error("embedded message: {0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Pdf,
    Spreadsheet,
    Docx,
    Email,
    Text,
}

impl AttachmentKind {
    /// Extension first, then mime type.
    pub fn detect(filename: &str, mime_type: &str) -> Option<Self> {
        let name = filename.trim().to_ascii_lowercase();
        let mime = mime_type.trim().to_ascii_lowercase();
        let extension = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");

        match extension {
            "pdf" => return Some(Self::Pdf),
            "xlsx" | "xls" | "xlsm" | "ods" => return Some(Self::Spreadsheet),
            "docx" => return Some(Self::Docx),
            "eml" => return Some(Self::Email),
            "txt" | "csv" | "md" | "json" | "htm" | "html" => return Some(Self::Text),
            _ => {}
        }

        if mime.contains("pdf") {
            Some(Self::Pdf)
        } else if mime.contains("spreadsheet") || mime.contains("ms-excel") {
            Some(Self::Spreadsheet)
        } else if mime.contains("wordprocessingml") {
            Some(Self::Docx)
        } else if mime == "message/rfc822" {
            Some(Self::Email)
        } else if mime.starts_with("text/") {
            Some(Self::Text)
        } else {
            None
        }
    }
}

/// `Ok(None)` for unsupported types and for text too short to be useful.
pub fn extract_text(attachment: &Attachment) -> Result<Option<String>, ExtractionError> {
    let Some(kind) = AttachmentKind::detect(&attachment.filename, &attachment.mime_type) else {
        return Ok(None);
    };
    let bytes = attachment.content.as_slice();

    let text = match kind {
        AttachmentKind::Pdf => extract_pdf(bytes)?,
        AttachmentKind::Spreadsheet => workbook_text(&read_workbook(bytes.to_vec())?),
        AttachmentKind::Docx => extract_docx(bytes)?,
        AttachmentKind::Email => extract_eml(bytes)?,
        AttachmentKind::Text => {
            let raw = String::from_utf8_lossy(bytes).into_owned();
            if attachment.mime_type.eq_ignore_ascii_case("text/html")
                || attachment.filename.to_ascii_lowercase().ends_with(".html")
            {
                html_to_text(&raw)
            } else {
                raw
            }
        }
    };

    Ok(meaningful(text))
}

fn meaningful(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.chars().count() > MIN_TEXT_CHARS {
        Some(trimmed.to_string())
    } else {
        None
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractionError> {
    let owned = bytes.to_vec();
    std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem(&owned))
        .map_err(|_| ExtractionError::Pdf("pdf parser panicked".to_string()))?
        .map_err(|error| ExtractionError::Pdf(error.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|error| ExtractionError::Document(format!("open docx package: {error}")))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|error| ExtractionError::Document(format!("word/document.xml: {error}")))?
        .read_to_string(&mut xml)?;

    document_xml_text(&xml)
}

fn document_xml_text(xml: &str) -> Result<String, ExtractionError> {
    let mut reader = Reader::from_str(xml);
    let mut text = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text_run = true,
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" => text.push('\t'),
                b"w:br" | b"w:cr" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) if in_text_run => {
                text.push_str(&e.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text_run = false,
                b"w:p" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(error) => {
                return Err(ExtractionError::Document(format!(
                    "xml at {}: {error}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
    }

    Ok(text)
}

fn extract_eml(bytes: &[u8]) -> Result<String, ExtractionError> {
    let message = parse_raw_message(MessageId::from("embedded"), bytes)
        .map_err(|error| ExtractionError::Message(error.to_string()))?;

    Ok(format!(
        "Subject: {}\nFrom: {}\n\n{}",
        message.subject, message.from, message.body
    ))
}
