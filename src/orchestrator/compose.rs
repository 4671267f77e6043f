use std::path::Path;

use tracing::warn;

use crate::providers::mime::{guess_content_type, html_escape};
use crate::providers::{Message, OutgoingMessage, OutgoingPart};
use crate::store::settings::Settings;

pub const SIGNATURE_CID: &str = "signature";

fn text_to_html(text: &str) -> String {
    html_escape(text).replace("\r\n", "\n").replace('\n', "<br>")
}

/// HTML body of a reply: text, signature line, optional signature image
/// reference and an optional quote of the message being answered.
pub fn reply_html(body: &str, signature_text: &str, has_signature_image: bool, original: Option<&Message>) -> String {
    let mut html = text_to_html(body);

    if !signature_text.is_empty() {
        html.push_str("<br><br>");
        html.push_str(&text_to_html(signature_text));
    }
    if has_signature_image {
        html.push_str(&format!("<br><img src=\"cid:{SIGNATURE_CID}\" style=\"width:25%\">"));
    }

    if let Some(original) = original {
        let from = if original.from.trim().is_empty() {
            "Unknown sender"
        } else {
            original.from.as_str()
        };
        html.push_str("<br><br>--- Original message ---");
        html.push_str(&format!("<br><br><strong>From:</strong> {}", html_escape(from)));
        html.push_str(&format!("<br><strong>Subject:</strong> {}", html_escape(&original.subject)));
        html.push_str(&format!(
            "<br><br><strong>Message:</strong><br>{}",
            text_to_html(&original.body)
        ));
    }

    format!("<html><body>{html}</body></html>")
}

/// Every regular file in `dir`, sorted by name. A missing directory is empty.
pub async fn read_attachment_dir(dir: &Path) -> Vec<OutgoingPart> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };

    let mut paths = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.is_ok_and(|kind| kind.is_file()) {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut parts = Vec::with_capacity(paths.len());
    for path in paths {
        match tokio::fs::read(&path).await {
            Ok(data) => parts.push(OutgoingPart {
                filename: file_name(&path),
                content_type: guess_content_type(&path).to_string(),
                data,
                content_id: None,
            }),
            Err(error) => warn!("skipping attachment {}: {}", path.display(), error),
        }
    }
    parts
}

async fn signature_part(settings: &Settings) -> Option<OutgoingPart> {
    let raw = settings.signature_image.trim();
    if raw.is_empty() {
        return None;
    }
    let path = Path::new(raw);
    match tokio::fs::read(path).await {
        Ok(data) => Some(OutgoingPart {
            filename: file_name(path),
            content_type: guess_content_type(path).to_string(),
            data,
            content_id: Some(SIGNATURE_CID.to_string()),
        }),
        Err(error) => {
            warn!("signature image {} unavailable: {}", path.display(), error);
            None
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string())
}

/// Builds the outgoing reply with the configured signature and the files
/// from `attachments_dir`.
pub async fn compose_reply(
    to: &str,
    subject: &str,
    body: &str,
    settings: &Settings,
    attachments_dir: &Path,
    original: Option<&Message>,
) -> OutgoingMessage {
    let signature = signature_part(settings).await;
    let body_html = reply_html(
        body,
        settings.signature_text_or_default(),
        signature.is_some(),
        original,
    );

    let mut parts = read_attachment_dir(attachments_dir).await;
    parts.extend(signature);

    OutgoingMessage {
        to: to.to_string(),
        subject: subject.to_string(),
        body_html,
        parts,
    }
}
