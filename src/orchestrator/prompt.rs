use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::store::knowledge::{CellMatch, ScoredChunk};

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant who writes polite, professional replies to customers. \
Use the workbook data and the information gathered from the given web pages when they contain something relevant. \
Base the reply primarily on the content of the email.";

pub const PROMPT_TEMPLATE: &str = "A customer sent the following email:\n\n{greeting}\n\n\"{email.body}\"\n\n\
{imageDescriptions}\n\n{excelImageDescriptions}\n\n\
Use the following data when writing the reply:\n{excelData}\n\n{signature}\n\n{webUrls}\n{embeddingsContext}\n\
Also collect what the reply needs from these web pages: {webUrls}. Gather the relevant information, links, \
phone numbers, email addresses and so on, and include them in the reply.\n\n";

/// Sent when neither backend produced a usable answer.
pub const APOLOGY_REPLY: &str = "Sorry, no meaningful reply could be generated from the available data.";

pub const WEB_CONTEXT_MAX_CHARS: usize = 100_000;
pub const WORKBOOK_CONTEXT_MAX_CHARS: usize = 40_000;
pub const IMAGE_DESCRIPTIONS_MAX_CHARS: usize = 3_000;
pub const CELL_TEXT_MAX_CHARS: usize = 2_000;
/// Knowledge chunks pulled in by similarity to the email body.
pub const NEAREST_K: usize = 4;

const TRUNCATION_MARKER: &str = "…[truncated]";

/// Keeps the first `max_chars` chars and appends a marker when anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
        None => text.to_string(),
    }
}

/// Everything that fills the prompt template for one email.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptContext {
    pub greeting: String,
    pub email_body: String,
    pub image_descriptions: Vec<String>,
    pub workbook_image_descriptions: Vec<String>,
    pub workbook_data: String,
    pub signature: String,
    pub web_html: String,
    pub embeddings_context: String,
}

impl PromptContext {
    /// Substitutes every placeholder in a single pass, so placeholder-like
    /// text inside the email never gets expanded.
    pub fn render(&self) -> String {
        static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
        let Some(pattern) = PLACEHOLDER
            .get_or_init(|| {
                Regex::new(
                    r"\{(greeting|email\.body|imageDescriptions|excelImageDescriptions|excelData|signature|webUrls|embeddingsContext)\}",
                )
                .ok()
            })
            .as_ref()
        else {
            return PROMPT_TEMPLATE.to_string();
        };

        let image_descriptions = truncate_chars(
            &format_descriptions("Descriptions of the images attached to the email:", &self.image_descriptions),
            IMAGE_DESCRIPTIONS_MAX_CHARS,
        );
        let workbook_images = truncate_chars(
            &format_descriptions(
                "Descriptions of the images in the knowledge workbook:",
                &self.workbook_image_descriptions,
            ),
            IMAGE_DESCRIPTIONS_MAX_CHARS,
        );
        let workbook_data = truncate_chars(&self.workbook_data, WORKBOOK_CONTEXT_MAX_CHARS);
        let web = if self.web_html.trim().is_empty() {
            "N/A".to_string()
        } else {
            truncate_chars(&self.web_html, WEB_CONTEXT_MAX_CHARS)
        };

        pattern
            .replace_all(PROMPT_TEMPLATE, |captures: &Captures<'_>| match &captures[1] {
                "greeting" => self.greeting.clone(),
                "email.body" => self.email_body.clone(),
                "imageDescriptions" => image_descriptions.clone(),
                "excelImageDescriptions" => workbook_images.clone(),
                "excelData" => workbook_data.clone(),
                "signature" => self.signature.clone(),
                "webUrls" => web.clone(),
                "embeddingsContext" => self.embeddings_context.clone(),
                other => format!("{{{other}}}"),
            })
            .into_owned()
    }
}

/// Numbered list under a heading; empty when there is nothing to list.
pub fn format_descriptions(heading: &str, descriptions: &[String]) -> String {
    if descriptions.is_empty() {
        return String::new();
    }
    let mut out = format!("\n{heading}");
    for (index, description) in descriptions.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", index + 1, description));
    }
    out.push('\n');
    out
}

/// The exact cell hit goes first, then the nearest knowledge chunks.
pub fn build_embeddings_context(cell: Option<&CellMatch>, nearest: &[ScoredChunk]) -> String {
    let mut out = String::new();
    if let Some(cell) = cell {
        out.push_str(&format!(
            "EXACT_CELL_LOOKUP: {} => {}\n\n",
            cell.address,
            cell.text.chars().take(CELL_TEXT_MAX_CHARS).collect::<String>()
        ));
    }
    for scored in nearest {
        let source = if scored.chunk.source.filename.is_empty() {
            scored.chunk.doc_id.as_str()
        } else {
            scored.chunk.source.filename.as_str()
        };
        out.push_str(&format!(
            "RELATED ({source}, score {:.3}): {}\n\n",
            scored.score,
            truncate_chars(scored.chunk.text.trim(), CELL_TEXT_MAX_CHARS)
        ));
    }
    out
}
