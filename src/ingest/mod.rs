use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::providers::mime::guess_content_type;
use crate::providers::{Attachment, InlineImage, Message};
use crate::services::completion::CompletionProvider;
use crate::store::knowledge::{CellRef, KnowledgeChunk, SourceMetadata};
use crate::store::{StateStores, StoreError};

pub mod chunk;
pub mod extract;
pub mod sheet;

use self::chunk::{chunk_text, window_for_tokens};
use self::extract::{extract_text, AttachmentKind, ExtractionError};
use self::sheet::{read_workbook, workbook_cells, workbook_text, SheetCell};

/// Token budget per chunk for attachment text.
pub const ATTACHMENT_MAX_TOKENS: usize = 2_000;
const EMBED_SUBCHUNK_CHARS: usize = 2_000;
const EMBED_BATCH_SIZE: usize = 20;
const MAX_IMAGES_PER_MESSAGE: usize = 10;
const IMAGE_DESCRIPTION_MAX_CHARS: usize = 1_000;
pub const IMAGE_PROMPT: &str =
    "Describe this image in detail. Transcribe any visible text, numbers or tables.";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ingest task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub attachments_processed: usize,
    pub chunks_written: usize,
    pub cells_written: usize,
    pub images_described: usize,
    pub errors: Vec<String>,
}

/// Where a piece of text came from; `source_id` doubles as the document id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSource {
    pub source_id: Option<String>,
    pub filename: Option<String>,
    pub from: String,
    pub subject: String,
    pub date: String,
}

impl IngestSource {
    fn for_attachment(message: &Message, attachment: &Attachment) -> Self {
        Self {
            source_id: Some(format!("{}-att-{}", message.id, attachment.filename)),
            filename: Some(attachment.filename.clone()),
            from: message.from.clone(),
            subject: message.subject.clone(),
            date: if message.date.is_empty() {
                Utc::now().to_rfc3339()
            } else {
                message.date.clone()
            },
        }
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            filename: self.filename.clone().unwrap_or_default(),
            from: self.from.clone(),
            subject: self.subject.clone(),
            date: self.date.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AttachmentOutcome {
    chunks: usize,
    cells: usize,
}

/// Turns attachments into knowledge chunks with embeddings.
#[derive(Clone)]
pub struct AttachmentIngestor {
    completion: Arc<dyn CompletionProvider>,
    stores: Arc<StateStores>,
}

impl AttachmentIngestor {
    pub fn new(completion: Arc<dyn CompletionProvider>, stores: Arc<StateStores>) -> Self {
        Self { completion, stores }
    }

    /// Whole text first; on failure, 2000-char pieces in batches of 20, then
    /// one piece per call. Successful vectors are mean-pooled.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.completion.embed(&[text.to_string()]).await {
            Ok(vectors) => {
                if let Some(vector) = vectors.into_iter().next().filter(|v| !v.is_empty()) {
                    return Some(vector);
                }
            }
            Err(error) => debug!("whole-text embedding failed, splitting: {}", error),
        }

        let pieces: Vec<String> = chunk_text(text, EMBED_SUBCHUNK_CHARS, 0)
            .into_iter()
            .map(|chunk| chunk.text)
            .collect();
        let mut vectors = Vec::new();
        for batch in pieces.chunks(EMBED_BATCH_SIZE) {
            match self.completion.embed(batch).await {
                Ok(batch_vectors) if batch_vectors.len() == batch.len() => {
                    vectors.extend(batch_vectors.into_iter().filter(|v| !v.is_empty()));
                }
                _ => {
                    for piece in batch {
                        match self.completion.embed(std::slice::from_ref(piece)).await {
                            Ok(single) => {
                                vectors.extend(single.into_iter().take(1).filter(|v| !v.is_empty()))
                            }
                            Err(error) => warn!("embedding piece failed: {}", error),
                        }
                    }
                }
            }
        }

        mean_pool(&vectors)
    }

    /// Chunks, embeds and appends `text`. Chunks already embedded under the
    /// same id are skipped. Returns how many chunks were written.
    pub async fn ingest_text(
        &self,
        text: &str,
        source: &IngestSource,
        max_tokens: usize,
    ) -> Result<usize, IngestError> {
        let (max_chars, overlap_chars) = window_for_tokens(max_tokens);
        let chunks = chunk_text(text, max_chars, overlap_chars);
        if chunks.is_empty() {
            return Ok(0);
        }

        let doc_id = doc_id_for(source.source_id.as_deref(), source.filename.as_deref(), text);
        let existing = self.stores.knowledge.embedded_ids();
        let total_chunks = chunks.len();
        let mut pending = Vec::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let id = format!("{doc_id}-{index}");
            if existing.contains(&id) {
                continue;
            }
            let embedding = self.embed(&chunk.text).await;
            if embedding.is_none() {
                warn!("no embedding for chunk {}", id);
            }
            pending.push(KnowledgeChunk {
                id,
                doc_id: doc_id.clone(),
                chunk_index: index,
                total_chunks,
                text: chunk.text,
                embedding,
                source: source.metadata(),
                start: chunk.start,
                end: chunk.end,
                cell: None,
            });
        }

        self.stores.knowledge.append(&pending)?;
        Ok(pending.len())
    }

    async fn ingest_attachment(
        &self,
        source: IngestSource,
        attachment: Attachment,
    ) -> Result<AttachmentOutcome, IngestError> {
        let (text, cells) = tokio::task::spawn_blocking(move || extract_with_cells(&attachment))
            .await
            .map_err(|error| IngestError::Task(error.to_string()))??;

        let mut outcome = AttachmentOutcome::default();
        if !cells.is_empty() {
            let doc_id = doc_id_for(source.source_id.as_deref(), source.filename.as_deref(), "");
            let total_chunks = cells.len();
            let chunks: Vec<KnowledgeChunk> = cells
                .into_iter()
                .enumerate()
                .map(|(index, cell)| {
                    let text_len = cell.text.chars().count();
                    KnowledgeChunk {
                        id: format!("{doc_id}-sheet-{}-cell-{}{}", cell.sheet, cell.column, cell.row),
                        doc_id: doc_id.clone(),
                        chunk_index: index,
                        total_chunks,
                        text: cell.text,
                        embedding: None,
                        source: source.metadata(),
                        start: 0,
                        end: text_len,
                        cell: Some(CellRef {
                            sheet: cell.sheet,
                            column: cell.column,
                            row: cell.row,
                            address: cell.address,
                        }),
                    }
                })
                .collect();
            self.stores.knowledge.append(&chunks)?;
            outcome.cells = chunks.len();
        }

        if let Some(text) = text {
            outcome.chunks = self.ingest_text(&text, &source, ATTACHMENT_MAX_TOKENS).await?;
        }
        Ok(outcome)
    }

    /// Describes images in place and returns the descriptions in order.
    /// Failures are logged and skipped.
    pub async fn describe_images(&self, images: &mut [InlineImage]) -> Vec<String> {
        let mut descriptions = Vec::new();
        for image in images.iter_mut().take(MAX_IMAGES_PER_MESSAGE) {
            if let Some(existing) = image.description.as_ref() {
                descriptions.push(existing.clone());
                continue;
            }
            match self
                .completion
                .describe_image(&image.data, &image.mime_type, IMAGE_PROMPT)
                .await
            {
                Ok(description) => {
                    let description: String = description
                        .trim()
                        .chars()
                        .take(IMAGE_DESCRIPTION_MAX_CHARS)
                        .collect();
                    if description.is_empty() {
                        continue;
                    }
                    image.description = Some(description.clone());
                    descriptions.push(description);
                }
                Err(error) => warn!("image description failed: {}", error),
            }
        }
        descriptions
    }

    /// Describes the message's images, then ingests every supported
    /// attachment concurrently. One failing attachment never stops the rest.
    pub async fn ingest_message(&self, message: &mut Message) -> IngestReport {
        let mut report = IngestReport {
            images_described: self.describe_images(&mut message.images).await.len(),
            ..IngestReport::default()
        };

        let mut tasks = JoinSet::new();
        for attachment in &message.attachments {
            if attachment.content.is_empty()
                || AttachmentKind::detect(&attachment.filename, &attachment.mime_type).is_none()
            {
                continue;
            }
            let ingestor = self.clone();
            let source = IngestSource::for_attachment(message, attachment);
            let attachment = attachment.clone();
            let filename = attachment.filename.clone();
            tasks.spawn(async move { (filename, ingestor.ingest_attachment(source, attachment).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    report.attachments_processed += 1;
                    report.chunks_written += outcome.chunks;
                    report.cells_written += outcome.cells;
                }
                Ok((filename, Err(error))) => {
                    warn!("attachment {} of {} failed: {}", filename, message.id, error);
                    report.errors.push(format!("{filename}: {error}"));
                }
                Err(error) => report.errors.push(format!("ingest task: {error}")),
            }
        }

        if report.attachments_processed > 0 || !report.errors.is_empty() {
            info!(
                "ingested {} attachment(s) of {}: {} chunk(s), {} cell(s), {} error(s)",
                report.attachments_processed,
                message.id,
                report.chunks_written,
                report.cells_written,
                report.errors.len()
            );
        }
        report
    }

    /// Ingests a local file the same way as a received attachment, under
    /// the `file-{name}` document id.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport, IngestError> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = guess_content_type(path).to_string();
        if AttachmentKind::detect(&filename, &mime_type).is_none() {
            return Err(ExtractionError::Document(format!("unsupported file type: {filename}")).into());
        }

        let content = tokio::fs::read(path).await.map_err(ExtractionError::Io)?;
        let attachment = Attachment {
            filename: filename.clone(),
            mime_type,
            size: content.len() as u64,
            content,
            remote_id: None,
        };
        let source = IngestSource {
            source_id: None,
            filename: Some(filename),
            date: Utc::now().to_rfc3339(),
            ..IngestSource::default()
        };

        let outcome = self.ingest_attachment(source, attachment).await?;
        Ok(IngestReport {
            attachments_processed: 1,
            chunks_written: outcome.chunks,
            cells_written: outcome.cells,
            ..IngestReport::default()
        })
    }
}

fn extract_with_cells(attachment: &Attachment) -> Result<(Option<String>, Vec<SheetCell>), ExtractionError> {
    if AttachmentKind::detect(&attachment.filename, &attachment.mime_type) == Some(AttachmentKind::Spreadsheet) {
        let sheets = read_workbook(attachment.content.clone())?;
        let text = workbook_text(&sheets);
        let text = (text.trim().chars().count() > extract::MIN_TEXT_CHARS).then_some(text);
        return Ok((text, workbook_cells(&sheets)));
    }
    Ok((extract_text(attachment)?, Vec::new()))
}

/// Source id, else `file-{filename}`, else `file-{sha256 prefix}`.
pub fn doc_id_for(source_id: Option<&str>, filename: Option<&str>, text: &str) -> String {
    if let Some(source_id) = source_id.filter(|id| !id.trim().is_empty()) {
        return source_id.to_string();
    }
    if let Some(filename) = filename.filter(|name| !name.trim().is_empty()) {
        return format!("file-{filename}");
    }
    let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
    format!("file-{}", &digest[..8])
}

/// Element-wise mean of vectors sharing the first vector's length.
pub fn mean_pool(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dimension = first.len();
    let matching: Vec<&Vec<f32>> = vectors.iter().filter(|v| v.len() == dimension).collect();

    let mut sum = vec![0.0f32; dimension];
    for vector in &matching {
        for (total, value) in sum.iter_mut().zip(vector.iter()) {
            *total += value;
        }
    }
    let count = matching.len() as f32;
    Some(sum.into_iter().map(|total| total / count).collect())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::{doc_id_for, mean_pool, AttachmentIngestor, IngestSource};
    use crate::providers::{Attachment, InlineImage, Message, MessageId};
    use crate::services::completion::{CompletionError, CompletionOptions, CompletionProvider};
    use crate::store::StateStores;

    /// Rejects inputs longer than `max_input`; vectors are `[chars, 1]`.
    struct FakeEmbedder {
        max_input: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionProvider for FakeEmbedder {
        fn name(&self) -> &str {
            "fake"
        }

        async fn complete(&self, _: &str, _: &str, _: &CompletionOptions) -> Result<String, CompletionError> {
            Err(CompletionError::Empty)
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|text| text.chars().count() > self.max_input) {
                return Err(CompletionError::InvalidResponse("input too long".to_string()));
            }
            Ok(texts
                .iter()
                .map(|text| vec![text.chars().count() as f32, 1.0])
                .collect())
        }

        async fn describe_image(&self, _: &str, mime_type: &str, _: &str) -> Result<String, CompletionError> {
            if mime_type == "image/gif" {
                Err(CompletionError::Unavailable("no vision".to_string()))
            } else {
                Ok(format!("a {mime_type} picture"))
            }
        }
    }

    fn ingestor(max_input: usize) -> (AttachmentIngestor, Arc<StateStores>) {
        let dir = std::env::temp_dir().join(format!("aimail-ingest-{}", Uuid::new_v4()));
        let stores = Arc::new(StateStores::open(&dir).expect("open stores"));
        let completion = Arc::new(FakeEmbedder {
            max_input,
            calls: AtomicUsize::new(0),
        });
        (AttachmentIngestor::new(completion, stores.clone()), stores)
    }

    #[test]
    fn doc_ids_fall_back_in_order() {
        assert_eq!(doc_id_for(Some("42-att-a.pdf"), Some("a.pdf"), "x"), "42-att-a.pdf");
        assert_eq!(doc_id_for(None, Some("a.pdf"), "x"), "file-a.pdf");
        let hashed = doc_id_for(None, None, "hello");
        assert_eq!(hashed, "file-2cf24dba");
    }

    #[test]
    fn mean_pool_ignores_mismatched_lengths() {
        let pooled = mean_pool(&[vec![1.0, 3.0], vec![3.0, 5.0], vec![9.0]]).expect("pooled");
        assert_eq!(pooled, vec![2.0, 4.0]);
        assert!(mean_pool(&[]).is_none());
    }

    #[tokio::test]
    async fn long_text_embedding_falls_back_to_pooled_pieces() {
        let (ingestor, _) = ingestor(2_000);
        let text = "a".repeat(5_000);
        let vector = ingestor.embed(&text).await.expect("pooled vector");
        // Pieces of 2000, 2000 and 1000 chars.
        let expected = (2_000.0 + 2_000.0 + 1_000.0) / 3.0;
        assert!((vector[0] - expected).abs() < 1e-3);
        assert_eq!(vector[1], 1.0);
    }

    #[tokio::test]
    async fn ingest_text_skips_already_embedded_chunks() {
        let (ingestor, stores) = ingestor(100_000);
        let source = IngestSource {
            source_id: Some("doc-1".to_string()),
            ..IngestSource::default()
        };
        let text = "Our shop opens at nine. ".repeat(10);

        let first = ingestor.ingest_text(&text, &source, 2_000).await.expect("first ingest");
        assert_eq!(first, 1);
        let second = ingestor.ingest_text(&text, &source, 2_000).await.expect("second ingest");
        assert_eq!(second, 0);

        let chunks = stores.knowledge.chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "doc-1-0");
        assert!(chunks[0].embedding.is_some());
    }

    #[tokio::test]
    async fn ingest_message_processes_supported_attachments_and_images() {
        let (ingestor, stores) = ingestor(100_000);
        let mut message = Message {
            id: MessageId::from("m-7"),
            from: "client@example.com".to_string(),
            subject: "Question".to_string(),
            attachments: vec![
                Attachment {
                    filename: "terms.txt".to_string(),
                    mime_type: "text/plain".to_string(),
                    size: 0,
                    content: b"Delivery takes three working days.".to_vec(),
                    remote_id: None,
                },
                Attachment {
                    filename: "broken.pdf".to_string(),
                    mime_type: "application/pdf".to_string(),
                    size: 3,
                    content: b"%PD".to_vec(),
                    remote_id: None,
                },
                Attachment {
                    filename: "photo.png".to_string(),
                    mime_type: "image/png".to_string(),
                    size: 2,
                    content: vec![1, 2],
                    remote_id: None,
                },
            ],
            images: vec![
                InlineImage {
                    mime_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                    description: None,
                },
                InlineImage {
                    mime_type: "image/gif".to_string(),
                    data: "AAAA".to_string(),
                    description: None,
                },
            ],
            ..Message::default()
        };

        let report = ingestor.ingest_message(&mut message).await;
        assert_eq!(report.attachments_processed, 1);
        assert_eq!(report.chunks_written, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("broken.pdf"));
        assert_eq!(report.images_described, 1);
        assert_eq!(message.images[0].description.as_deref(), Some("a image/png picture"));
        assert!(message.images[1].description.is_none());

        let chunks = stores.knowledge.chunks();
        assert_eq!(chunks[0].doc_id, "m-7-att-terms.txt");
        assert_eq!(chunks[0].source.from, "client@example.com");
    }

    #[tokio::test]
    async fn local_files_ingest_under_their_name() {
        let (ingestor, stores) = ingestor(100_000);
        let dir = std::env::temp_dir().join(format!("aimail-ingest-file-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create dir");
        let notes = dir.join("faq.txt");
        std::fs::write(&notes, "Opening hours are 8 to 16 on weekdays.").expect("write notes");
        let binary = dir.join("photo.bmp");
        std::fs::write(&binary, [0u8, 1, 2]).expect("write binary");

        let report = ingestor.ingest_file(&notes).await.expect("ingest faq");
        assert_eq!(report.chunks_written, 1);
        assert_eq!(stores.knowledge.chunks()[0].doc_id, "file-faq.txt");
        assert!(ingestor.ingest_file(&binary).await.is_err());

        let _ = std::fs::remove_dir_all(dir);
    }
}
