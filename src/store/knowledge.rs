use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{JsonStore, StoreError};

pub const KNOWLEDGE_FILE: &str = "embeddings_kb.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceMetadata {
    pub filename: String,
    pub from: String,
    pub subject: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRef {
    pub sheet: String,
    pub column: String,
    pub row: u32,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KnowledgeChunk {
    pub id: String,
    pub doc_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub source: SourceMetadata,
    pub start: usize,
    pub end: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell: Option<CellRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellQuery {
    pub sheet: String,
    pub column: String,
    pub row: u32,
}

impl CellQuery {
    pub fn address(&self) -> String {
        format!("{}!{}{}", self.sheet.trim(), self.column, self.row)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellMatch {
    pub address: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub score: f32,
    pub chunk: KnowledgeChunk,
}

/// Chunks extracted from attachments. `embeddings_kb.json` holds every chunk
/// including spreadsheet cells; `embeddings.json` holds the embedded text
/// chunks used for similarity search.
#[derive(Debug)]
pub struct KnowledgeStore {
    knowledge: JsonStore<Vec<KnowledgeChunk>>,
    embeddings: JsonStore<Vec<KnowledgeChunk>>,
    write_lock: Mutex<()>,
}

impl KnowledgeStore {
    pub fn open(data_dir: &Path) -> Self {
        Self {
            knowledge: JsonStore::new(data_dir.join(KNOWLEDGE_FILE)),
            embeddings: JsonStore::new(data_dir.join(EMBEDDINGS_FILE)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn chunks(&self) -> Vec<KnowledgeChunk> {
        self.knowledge.read()
    }

    pub fn embedded_ids(&self) -> HashSet<String> {
        self.embeddings
            .read()
            .into_iter()
            .map(|chunk| chunk.id)
            .collect()
    }

    /// Upserts by id into both files. Cell chunks go to the knowledge file
    /// only. Returns how many ids were new.
    pub fn append(&self, chunks: &[KnowledgeChunk]) -> Result<usize, StoreError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Config("knowledge store lock poisoned".to_string()))?;

        let mut knowledge = self.knowledge.read();
        let added = upsert(&mut knowledge, chunks.iter().cloned());
        self.knowledge.write(&knowledge)?;

        let embedded: Vec<KnowledgeChunk> = chunks
            .iter()
            .filter(|chunk| chunk.cell.is_none() && chunk.embedding.is_some())
            .cloned()
            .collect();
        if !embedded.is_empty() {
            let mut embeddings = self.embeddings.read();
            upsert(&mut embeddings, embedded);
            self.embeddings.write(&embeddings)?;
        }

        Ok(added)
    }

    /// Joins the text of every chunk tagged with the given cell.
    pub fn find_cell(&self, sheet: &str, column: &str, row: u32) -> Option<String> {
        let wanted_sheet = normalize_sheet_name(sheet);
        let wanted_column = column.trim().to_ascii_uppercase();

        let mut matches: Vec<KnowledgeChunk> = self
            .knowledge
            .read()
            .into_iter()
            .filter(|chunk| {
                chunk.cell.as_ref().is_some_and(|cell| {
                    cell.row == row
                        && cell.column.eq_ignore_ascii_case(&wanted_column)
                        && normalize_sheet_name(&cell.sheet) == wanted_sheet
                })
            })
            .collect();

        if matches.is_empty() {
            return None;
        }
        matches.sort_by_key(|chunk| chunk.chunk_index);
        Some(
            matches
                .into_iter()
                .map(|chunk| chunk.text)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Resolves a reference found in free text. The captured sheet part may
    /// carry leading words from the sentence, so shorter word suffixes are
    /// tried until one names a known sheet.
    pub fn lookup_reference(&self, query: &CellQuery) -> Option<CellMatch> {
        let words: Vec<&str> = query.sheet.split_whitespace().collect();
        (0..words.len()).find_map(|skip| {
            let sheet = words[skip..].join(" ");
            self.find_cell(&sheet, &query.column, query.row)
                .map(|text| CellMatch {
                    address: format!("{}!{}{}", sheet, query.column.to_ascii_uppercase(), query.row),
                    text,
                })
        })
    }

    pub fn nearest(&self, vector: &[f32], k: usize) -> Vec<ScoredChunk> {
        if k == 0 || vector.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<ScoredChunk> = self
            .embeddings
            .read()
            .into_iter()
            .filter_map(|chunk| {
                let score = cosine_similarity(vector, chunk.embedding.as_deref()?)?;
                Some(ScoredChunk { score, chunk })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        scored
    }
}

fn upsert(target: &mut Vec<KnowledgeChunk>, incoming: impl IntoIterator<Item = KnowledgeChunk>) -> usize {
    let mut positions: HashMap<String, usize> = target
        .iter()
        .enumerate()
        .map(|(index, chunk)| (chunk.id.clone(), index))
        .collect();

    let mut added = 0;
    for chunk in incoming {
        match positions.get(&chunk.id) {
            Some(&index) => target[index] = chunk,
            None => {
                positions.insert(chunk.id.clone(), target.len());
                target.push(chunk);
                added += 1;
            }
        }
    }
    added
}

/// `None` for empty, zero-norm or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return None;
    }
    Some((dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0))
}

/// Parses a whole-string reference such as `Munka1!B12` or `Munka1 B 12`.
pub fn parse_cell_reference(input: &str) -> Option<CellQuery> {
    static EXACT: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = EXACT
        .get_or_init(|| Regex::new(r"^([^!\t\n\r]+)[!\s]+([A-Za-z]+)\s*-?\s*(\d+)$").ok())
        .as_ref()?;
    captures_to_query(pattern, input.trim())
}

/// Finds the first cell reference inside free text.
pub fn detect_cell_reference(text: &str) -> Option<CellQuery> {
    static EMBEDDED: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = EMBEDDED
        .get_or_init(|| Regex::new(r"([^!\n\r]+)[!\s]+([A-Za-z]+)\s*-?\s*(\d{1,6})").ok())
        .as_ref()?;
    captures_to_query(pattern, text)
}

fn captures_to_query(pattern: &Regex, text: &str) -> Option<CellQuery> {
    let captures = pattern.captures(text)?;
    let sheet = captures[1].trim().to_string();
    if sheet.is_empty() {
        return None;
    }
    Some(CellQuery {
        sheet,
        column: captures[2].to_ascii_uppercase(),
        row: captures[3].parse().ok()?,
    })
}

pub fn normalize_sheet_name(name: &str) -> String {
    name.trim()
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_diacritic)
        .collect()
}

fn fold_diacritic(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ő' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'ű' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}
