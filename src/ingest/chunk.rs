/// Hard cap on chunks produced from one text.
pub const MAX_CHUNKS: usize = 10_000;
pub const DEFAULT_MAX_CHARS: usize = 8_000;
pub const DEFAULT_OVERLAP_CHARS: usize = 800;

const MAX_TOKENS: usize = 4_096;
const CHARS_PER_TOKEN: usize = 4;
const OVERLAP_RATIO: f64 = 0.08;
const SENTENCE_SEARCH_RATIO: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    /// Char offsets into the source text, end exclusive.
    pub start: usize,
    pub end: usize,
}

/// `(max_chars, overlap_chars)` for a token budget.
pub fn window_for_tokens(requested_tokens: usize) -> (usize, usize) {
    let max_tokens = requested_tokens.clamp(1, MAX_TOKENS);
    let overlap_tokens = (max_tokens as f64 * OVERLAP_RATIO).floor() as usize;
    (max_tokens * CHARS_PER_TOKEN, overlap_tokens * CHARS_PER_TOKEN)
}

/// Splits on char boundaries, preferring to cut right after a sentence end
/// found in the last 40% of the window. Consecutive chunks overlap by up to
/// `overlap_chars`.
pub fn chunk_text(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < len && chunks.len() < MAX_CHUNKS {
        let mut end = (start + max_chars).min(len);

        if end < len {
            let floor = start + (max_chars as f64 * SENTENCE_SEARCH_RATIO).floor() as usize;
            let mut index = end - 1;
            while index >= floor && index > start {
                let boundary = matches!(chars[index], '.' | '!' | '?')
                    && chars.get(index + 1).is_some_and(|next| next.is_whitespace());
                if boundary {
                    end = index + 1;
                    break;
                }
                index -= 1;
            }
        }

        chunks.push(TextChunk {
            text: chars[start..end].iter().collect(),
            start,
            end,
        });

        if end >= len {
            break;
        }
        start = end.saturating_sub(overlap_chars).max(start + 1);
    }

    chunks
}
