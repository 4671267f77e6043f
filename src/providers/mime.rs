use std::path::Path;
use std::sync::OnceLock;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use regex::Regex;
use uuid::Uuid;

use super::message::{Attachment, InlineImage, Message, MessageId, OutgoingMessage};
use super::ProviderError;

const SNIPPET_CHARS: usize = 200;
const BASE64_LINE: usize = 76;
const QP_LINE: usize = 76;

fn regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Parses an RFC 822 message (or just its header block) into a [`Message`].
pub fn parse_raw_message(id: MessageId, raw: &[u8]) -> Result<Message, ProviderError> {
    let parsed = parse_mail(raw).map_err(|error| ProviderError::Parse(format!("message {id}: {error}")))?;

    let from = parsed.headers.get_first_value("From").unwrap_or_default();
    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
    let date = parsed.headers.get_first_value("Date").unwrap_or_default();

    let mut parts = CollectedParts::default();
    collect_parts(&parsed, &mut parts);

    let body = match (parts.plain.is_empty(), parts.html.is_empty()) {
        (false, _) => parts.plain.join("\n\n"),
        (true, false) => html_to_text(&parts.html.join("\n")),
        (true, true) => String::new(),
    };
    for html in &parts.html {
        parts.images.extend(extract_data_uri_images(html));
    }

    Ok(Message {
        id,
        from,
        subject,
        date,
        internal_date: None,
        snippet: make_snippet(&body),
        body: body.trim().to_string(),
        label_ids: Vec::new(),
        attachments: parts.attachments,
        images: parts.images,
    })
}

#[derive(Default)]
struct CollectedParts {
    plain: Vec<String>,
    html: Vec<String>,
    attachments: Vec<Attachment>,
    images: Vec<InlineImage>,
}

fn collect_parts(part: &ParsedMail<'_>, collected: &mut CollectedParts) {
    if !part.subparts.is_empty() {
        for subpart in &part.subparts {
            collect_parts(subpart, collected);
        }
        return;
    }

    let mime_type = part.ctype.mimetype.to_ascii_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());
    let is_attachment =
        matches!(disposition.disposition, DispositionType::Attachment) || filename.is_some();

    if is_attachment || mime_type.starts_with("image/") {
        let Ok(content) = part.get_body_raw() else {
            return;
        };
        if mime_type.starts_with("image/") {
            collected.images.push(InlineImage {
                mime_type: mime_type.clone(),
                data: STANDARD.encode(&content),
                description: None,
            });
        }
        collected.attachments.push(Attachment {
            filename: filename.unwrap_or_else(|| "attachment".to_string()),
            mime_type,
            size: content.len() as u64,
            content,
            remote_id: None,
        });
        return;
    }

    if mime_type.starts_with("text/plain") {
        if let Ok(body) = part.get_body() {
            if !body.trim().is_empty() {
                collected.plain.push(body);
            }
        }
    } else if mime_type.starts_with("text/html") {
        if let Ok(body) = part.get_body() {
            if !body.trim().is_empty() {
                collected.html.push(body);
            }
        }
    }
}

pub fn make_snippet(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SNIPPET_CHARS).collect()
}

/// Renders HTML as plain text. Table contents are repeated after a
/// `[TABLES]` marker with tab-separated cells so row structure survives.
pub fn html_to_text(html: &str) -> String {
    let text = std::panic::catch_unwind(|| {
        html2text::from_read(html.as_bytes(), 120)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .unwrap_or_else(|_| strip_tags(html));

    let tables = linearize_tables(html);
    if tables.is_empty() {
        return text;
    }

    let mut rendered = text;
    rendered.push_str("\n\n[TABLES]\n");
    for (index, rows) in tables.iter().enumerate() {
        rendered.push_str(&format!("Table {}:\n", index + 1));
        for row in rows {
            rendered.push_str(&row.join("\t"));
            rendered.push('\n');
        }
    }
    rendered.trim_end().to_string()
}

fn linearize_tables(html: &str) -> Vec<Vec<Vec<String>>> {
    static TABLE: OnceLock<Option<Regex>> = OnceLock::new();
    static ROW: OnceLock<Option<Regex>> = OnceLock::new();
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    let (Some(table), Some(row), Some(cell)) = (
        regex(&TABLE, r"(?is)<table\b[^>]*>(.*?)</table>"),
        regex(&ROW, r"(?is)<tr\b[^>]*>(.*?)</tr>"),
        regex(&CELL, r"(?is)<t[dh]\b[^>]*>(.*?)</t[dh]>"),
    ) else {
        return Vec::new();
    };

    table
        .captures_iter(html)
        .map(|table_match| {
            row.captures_iter(&table_match[1])
                .map(|row_match| {
                    cell.captures_iter(&row_match[1])
                        .map(|cell_match| {
                            strip_tags(&cell_match[1])
                                .split_whitespace()
                                .collect::<Vec<_>>()
                                .join(" ")
                        })
                        .collect::<Vec<_>>()
                })
                .filter(|cells| cells.iter().any(|cell| !cell.is_empty()))
                .collect::<Vec<_>>()
        })
        .filter(|rows| !rows.is_empty())
        .collect()
}

fn strip_tags(html: &str) -> String {
    static TAG: OnceLock<Option<Regex>> = OnceLock::new();
    match regex(&TAG, r"(?is)<[^>]+>") {
        Some(tag) => html_entity_decode(&tag.replace_all(html, " ")),
        None => html_entity_decode(html),
    }
}

pub fn html_entity_decode(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Finds `data:image/...;base64,` URIs embedded in HTML.
pub fn extract_data_uri_images(html: &str) -> Vec<InlineImage> {
    static DATA_URI: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(pattern) = regex(&DATA_URI, r"data:(image/[A-Za-z0-9.+\-]+);base64,([A-Za-z0-9+/=]+)") else {
        return Vec::new();
    };
    pattern
        .captures_iter(html)
        .map(|captures| InlineImage {
            mime_type: captures[1].to_ascii_lowercase(),
            data: captures[2].to_string(),
            description: None,
        })
        .collect()
}

/// RFC 2047 B-encoding for non-ASCII subjects.
pub fn encode_subject(subject: &str) -> String {
    if subject.is_ascii() {
        subject.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(subject.as_bytes()))
    }
}

fn wrap_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE * 2 + 2);
    for line in encoded.as_bytes().chunks(BASE64_LINE) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push_str("\r\n");
    }
    out
}

fn quoted_printable(text: &str) -> String {
    let mut out = String::new();
    for (index, line) in text.split('\n').enumerate() {
        if index > 0 {
            out.push_str("\r\n");
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        let bytes = line.as_bytes();
        let mut width = 0;
        for (position, &byte) in bytes.iter().enumerate() {
            let is_last = position + 1 == bytes.len();
            let literal = match byte {
                b'=' => false,
                b' ' | b'\t' => !is_last,
                33..=126 => true,
                _ => false,
            };
            let encoded = if literal {
                (byte as char).to_string()
            } else {
                format!("={byte:02X}")
            };
            if width + encoded.len() > QP_LINE - 1 {
                out.push_str("=\r\n");
                width = 0;
            }
            width += encoded.len();
            out.push_str(&encoded);
        }
    }
    out
}

/// Serializes an outgoing reply as `multipart/related`: the HTML body first,
/// then inline parts (referenced by `cid:`) and regular attachments.
pub fn build_raw_mime(from: Option<&str>, message: &OutgoingMessage) -> String {
    let boundary = format!("related_{}", Uuid::new_v4().simple());
    let mut raw = String::new();

    if let Some(from) = from {
        raw.push_str(&format!("From: {from}\r\n"));
    }
    raw.push_str(&format!("To: {}\r\n", message.to));
    raw.push_str(&format!("Subject: {}\r\n", encode_subject(&message.subject)));
    raw.push_str("MIME-Version: 1.0\r\n");
    raw.push_str(&format!(
        "Content-Type: multipart/related;\r\n boundary=\"{boundary}\"\r\n\r\n"
    ));

    raw.push_str(&format!("--{boundary}\r\n"));
    raw.push_str("Content-Type: text/html; charset=\"UTF-8\"\r\n");
    if message.body_html.is_ascii() && message.body_html.lines().all(|line| line.len() <= 998) {
        raw.push_str("Content-Transfer-Encoding: 7bit\r\n\r\n");
        raw.push_str(&message.body_html.replace("\r\n", "\n").replace('\n', "\r\n"));
    } else {
        raw.push_str("Content-Transfer-Encoding: quoted-printable\r\n\r\n");
        raw.push_str(&quoted_printable(&message.body_html));
    }
    raw.push_str("\r\n");

    for part in &message.parts {
        let filename = encode_subject(&part.filename);
        raw.push_str(&format!("--{boundary}\r\n"));
        raw.push_str(&format!(
            "Content-Type: {}; name=\"{}\"\r\n",
            part.content_type, filename
        ));
        raw.push_str("Content-Transfer-Encoding: base64\r\n");
        match &part.content_id {
            Some(content_id) => {
                raw.push_str(&format!("Content-ID: <{content_id}>\r\n"));
                raw.push_str(&format!("Content-Disposition: inline; filename=\"{filename}\"\r\n\r\n"));
            }
            None => {
                raw.push_str(&format!(
                    "Content-Disposition: attachment; filename=\"{filename}\"\r\n\r\n"
                ));
            }
        }
        raw.push_str(&wrap_base64(&part.data));
    }

    raw.push_str(&format!("--{boundary}--\r\n"));
    raw
}

/// Gmail's `raw` field: the whole message, base64url without padding.
pub fn encode_for_gmail(raw: &str) -> String {
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

pub fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "zip" => "application/zip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ods" => "application/vnd.oasis.opendocument.spreadsheet",
        "eml" => "message/rfc822",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;

    use super::{
        build_raw_mime, encode_for_gmail, encode_subject, extract_data_uri_images,
        guess_content_type, html_to_text, parse_raw_message,
    };
    use crate::providers::message::{OutgoingMessage, OutgoingPart};

    const MULTIPART: &str = "From: =?UTF-8?B?S2lzcyDDgWdpIA==?= <agi@example.com>\r\n\
Subject: =?UTF-8?Q?=C3=81raj=C3=A1nlat?=\r\n\
Date: Tue, 1 Jul 2025 10:52:37 +0200\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Kerem az arajanlatot.\r\n\
--b1\r\n\
Content-Type: text/csv; name=\"prices.csv\"\r\n\
Content-Disposition: attachment; filename=\"prices.csv\"\r\n\
\r\n\
item,price\r\n\
--b1\r\n\
Content-Type: image/png\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--b1--\r\n";

    #[test]
    fn parses_multipart_with_encoded_headers() {
        let message = parse_raw_message("17".into(), MULTIPART.as_bytes()).expect("parse message");

        assert_eq!(message.id.as_str(), "17");
        assert_eq!(message.subject, "Árajánlat");
        assert!(message.from.contains("agi@example.com"));
        assert_eq!(message.body, "Kerem az arajanlatot.");
        assert_eq!(message.attachments.len(), 2);
        assert_eq!(message.attachments[0].filename, "prices.csv");
        assert!(String::from_utf8_lossy(&message.attachments[0].content).contains("item,price"));
        assert_eq!(message.images.len(), 1);
        assert_eq!(message.images[0].mime_type, "image/png");
        assert!(message.timestamp().is_some());
    }

    #[test]
    fn header_only_input_yields_empty_body() {
        let raw = "From: a@example.com\r\nSubject: hello\r\n\r\n";
        let message = parse_raw_message("1".into(), raw.as_bytes()).expect("parse headers");
        assert_eq!(message.subject, "hello");
        assert!(message.body.is_empty());
        assert!(message.attachments.is_empty());
    }

    #[test]
    fn html_tables_are_linearized() {
        let html = "<p>Prices below</p><table><tr><th>Item</th><th>Price</th></tr>\
<tr><td>Tea</td><td>4&nbsp;EUR</td></tr></table>";
        let text = html_to_text(html);
        assert!(text.contains("Prices below"));
        assert!(text.contains("[TABLES]\nTable 1:\nItem\tPrice\nTea\t4 EUR"));
    }

    #[test]
    fn finds_inline_data_uri_images() {
        let html = r#"<img src="data:image/PNG;base64,iVBORw0KGgo="><img src="https://x/y.png">"#;
        let images = extract_data_uri_images(html);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].mime_type, "image/png");
        assert_eq!(images[0].data, "iVBORw0KGgo=");
    }

    #[test]
    fn subject_is_b_encoded_only_when_needed() {
        assert_eq!(encode_subject("Re: hello"), "Re: hello");
        let encoded = encode_subject("Re: Árajánlat");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        let inner = encoded.trim_start_matches("=?UTF-8?B?").trim_end_matches("?=");
        let decoded = STANDARD.decode(inner).expect("decode subject");
        assert_eq!(String::from_utf8(decoded).expect("utf8"), "Re: Árajánlat");
    }

    #[test]
    fn composes_multipart_related_with_cid_part() {
        let message = OutgoingMessage {
            to: "customer@example.com".to_string(),
            subject: "Re: Árajánlat".to_string(),
            body_html: "Köszönjük<br><img src=\"cid:signature\" style=\"width:25%\">".to_string(),
            parts: vec![
                OutgoingPart {
                    filename: "signature.png".to_string(),
                    content_type: "image/png".to_string(),
                    data: vec![0u8; 200],
                    content_id: Some("signature".to_string()),
                },
                OutgoingPart {
                    filename: "terms.pdf".to_string(),
                    content_type: "application/pdf".to_string(),
                    data: b"%PDF-1.4".to_vec(),
                    content_id: None,
                },
            ],
        };

        let raw = build_raw_mime(Some("owner@example.com"), &message);
        assert!(raw.contains("Content-Type: multipart/related;\r\n boundary="));
        assert!(raw.contains("Subject: =?UTF-8?B?"));
        assert!(raw.contains("Content-ID: <signature>"));
        assert!(raw.contains("Content-Disposition: attachment; filename=\"terms.pdf\""));
        assert!(raw.contains("Content-Transfer-Encoding: quoted-printable"));
        assert!(raw
            .lines()
            .all(|line| line.len() <= 78), "every line fits the 76 column limit");

        let parsed = mailparse::parse_mail(raw.as_bytes()).expect("reparse composed mime");
        assert_eq!(parsed.subparts.len(), 3);
        let html = parsed.subparts[0].get_body().expect("html body");
        assert!(html.contains("Köszönjük"));

        let encoded = encode_for_gmail(&raw);
        assert!(!encoded.contains('='));
        assert_eq!(
            URL_SAFE_NO_PAD.decode(encoded).expect("decode raw"),
            raw.as_bytes()
        );
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(guess_content_type(Path::new("logo.PNG")), "image/png");
        assert_eq!(guess_content_type(Path::new("notes")), "application/octet-stream");
    }
}
