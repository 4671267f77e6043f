use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;

use aimail::ingest::AttachmentIngestor;
use aimail::providers::{Attachment, Message};
use aimail::services::completion::{CompletionError, CompletionOptions, CompletionProvider};
use aimail::store::knowledge::{detect_cell_reference, parse_cell_reference};
use aimail::store::models::SentLogEntry;
use aimail::store::{StateStores, SENT_LOG_CAPACITY, SETTINGS_FILE};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("aimail-store-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root
}

/// Every text embeds to the same direction, so any stored chunk is a perfect match.
struct FlatEmbedder;

#[async_trait]
impl CompletionProvider for FlatEmbedder {
    fn name(&self) -> &str {
        "flat"
    }

    async fn complete(&self, _: &str, _: &str, _: &CompletionOptions) -> Result<String, CompletionError> {
        Err(CompletionError::Empty)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CompletionError> {
        Ok(texts.iter().map(|_| vec![0.5, 0.5, 0.0]).collect())
    }

    async fn describe_image(&self, _: &str, _: &str, _: &str) -> Result<String, CompletionError> {
        Err(CompletionError::Unavailable("no vision".to_string()))
    }
}

fn price_workbook() -> Vec<u8> {
    let parts = [
        (
            "[Content_Types].xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#,
        ),
        (
            "_rels/.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#,
        ),
        (
            "xl/workbook.xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Prices" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        ),
        (
            "xl/_rels/workbook.xml.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#,
        ),
        (
            "xl/worksheets/sheet1.xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>Item</t></is></c><c r="B1" t="inlineStr"><is><t>Price</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>Chair</t></is></c><c r="B2"><v>40</v></c></row></sheetData></worksheet>"#,
        ),
    ];

    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut buffer);
        for (name, body) in parts {
            writer
                .start_file(name, SimpleFileOptions::default())
                .expect("start xlsx part");
            writer.write_all(body.as_bytes()).expect("write xlsx part");
        }
        writer.finish().expect("finish xlsx");
    }
    buffer.into_inner()
}

#[test]
fn sent_log_keeps_the_newest_entries() {
    let stores = StateStores::open(&temp_root()).expect("open stores");
    for index in 0..SENT_LOG_CAPACITY + 5 {
        stores
            .sent_log
            .append(SentLogEntry {
                id: index.to_string(),
                to: "client@example.com".to_string(),
                subject: format!("Re: #{index}"),
                date: Utc::now(),
                body: "Thanks".to_string(),
                signature_text: "AiMail".to_string(),
                signature_image: String::new(),
            })
            .expect("append sent entry");
    }

    let entries = stores.sent_log.entries();
    assert_eq!(entries.len(), SENT_LOG_CAPACITY);
    assert_eq!(entries[0].subject, "Re: #5");
    assert_eq!(entries[SENT_LOG_CAPACITY - 1].subject, format!("Re: #{}", SENT_LOG_CAPACITY + 4));

    let today = stores.sent_log.daily_counts(StateStores::today());
    assert_eq!(today.last().map(|day| day.count), Some(100));
}

#[test]
fn partial_settings_file_merges_with_defaults() {
    let root = temp_root();
    std::fs::write(
        root.join(SETTINGS_FILE),
        r#"{"autoSend": true, "halfAuto": true, "greeting": "Kedves Ügyfelünk!", "ignoredEmails": [" boss@example.com ", ""]}"#,
    )
    .expect("write settings");

    let stores = StateStores::open(&root).expect("open stores");
    let settings = stores.settings.load();
    assert!(settings.auto_send);
    assert!(!settings.half_auto);
    assert_eq!(settings.greeting, "Kedves Ügyfelünk!");
    assert_eq!(settings.ignored_emails, vec!["boss@example.com".to_string()]);
    assert_eq!(settings.auto_send_start_time, "08:00");
    assert_eq!(settings.auto_send_end_time, "16:00");
    assert_eq!(settings.poll_interval_secs, 30);
    assert!(settings.spam_keywords.iter().any(|keyword| keyword == "buy now"));
    assert_eq!(settings.activation_email, None);
}

#[test]
fn reply_modes_exclude_each_other() {
    let stores = StateStores::open(&temp_root()).expect("open stores");

    let settings = stores
        .settings
        .update(|settings| {
            settings.set_auto_send(true);
            Ok(())
        })
        .expect("enable auto-send");
    assert!(settings.auto_send && !settings.half_auto);

    let settings = stores
        .settings
        .update(|settings| settings.set_value("halfAuto", "on"))
        .expect("enable half-auto");
    assert!(settings.half_auto && !settings.auto_send);

    let reloaded = stores.settings.load();
    assert!(reloaded.half_auto && !reloaded.auto_send);

    let unknown = stores
        .settings
        .update(|settings| settings.set_value("colour", "blue"));
    assert!(unknown.is_err());
}

#[tokio::test]
async fn spreadsheet_attachment_cells_are_tagged_and_found() {
    let stores = Arc::new(StateStores::open(&temp_root()).expect("open stores"));
    let ingestor = AttachmentIngestor::new(Arc::new(FlatEmbedder), stores.clone());
    let workbook = price_workbook();
    let mut message = Message {
        id: "m-1".into(),
        from: "supplier@example.com".to_string(),
        subject: "New prices".to_string(),
        date: "2025-03-10T09:00:00Z".to_string(),
        attachments: vec![Attachment {
            filename: "prices.xlsx".to_string(),
            mime_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
            size: workbook.len() as u64,
            content: workbook,
            remote_id: None,
        }],
        ..Message::default()
    };

    let report = ingestor.ingest_message(&mut message).await;
    assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
    assert_eq!(report.attachments_processed, 1);
    assert_eq!(report.cells_written, 4);
    assert_eq!(report.chunks_written, 1);

    let chunks = stores.knowledge.chunks();
    let price = chunks
        .iter()
        .find(|chunk| chunk.id == "m-1-att-prices.xlsx-sheet-Prices-cell-B2")
        .expect("tagged price cell");
    assert_eq!(price.text, "40");
    assert_eq!(price.source.from, "supplier@example.com");

    let exact = parse_cell_reference("prices!b2").expect("reference");
    let found = stores.knowledge.lookup_reference(&exact).expect("cell by reference");
    assert_eq!(found.text, "40");

    let embedded = detect_cell_reference("What is in Prices!A2 at the moment?").expect("embedded reference");
    let found = stores.knowledge.lookup_reference(&embedded).expect("cell from free text");
    assert_eq!(found.address, "Prices!A2");
    assert_eq!(found.text, "Chair");

    let query = ingestor.embed("how much is a chair").await.expect("query vector");
    let nearest = stores.knowledge.nearest(&query, 4);
    assert_eq!(nearest.len(), 1);
    assert!(nearest[0].chunk.text.contains("Chair,40"));
    assert!((nearest[0].score - 1.0).abs() < 1e-5);
}
