use crate::error::IngestError;
use crate::models::{ExtractedUnit, TextChunk};
use regex::Regex;
use sha2::{Digest, Sha256};

/// Boundary markers written by the extractor and recognized by the
/// splitter. Separator priority runs from the widest structural break to
/// the empty string: document, sheet, page, blank line, line, space, "".
pub const DOCUMENT_SEPARATOR: &str = "\n\n=== Document:";
pub const SHEET_SEPARATOR: &str = "\n\n=== Sheet:";
pub const PAGE_SEPARATOR: &str = "\n\n=== Page";

const SEPARATORS: [&str; 7] = [
    DOCUMENT_SEPARATOR,
    SHEET_SEPARATOR,
    PAGE_SEPARATOR,
    "\n\n",
    "\n",
    " ",
    "",
];

pub fn document_marker(name: &str) -> String {
    format!("\n\n=== Document: {name} ===\n\n")
}

pub fn sheet_marker(name: &str) -> String {
    format!("\n\n=== Sheet: {name} ===\n\n")
}

pub fn page_marker(number: u32) -> String {
    format!("\n\n=== Page {number} ===\n\n")
}

#[derive(Debug, Clone, Copy)]
pub struct SplitOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_200,
            chunk_overlap: 120,
        }
    }
}

/// Pure text segmentation: no I/O, deterministic for fixed input and
/// options. Each span is at most `chunk_size` characters; consecutive
/// spans overlap by up to `chunk_overlap` characters. Cut points prefer
/// the highest-priority separator that still fits the remaining budget.
/// Whitespace-only spans are discarded.
pub fn split_text(text: &str, options: SplitOptions) -> Result<Vec<String>, IngestError> {
    if options.chunk_size == 0 {
        return Err(IngestError::InvalidChunkConfig(
            "chunk size must be positive".to_string(),
        ));
    }

    let overlap = options.chunk_overlap.min(options.chunk_size.saturating_sub(1));
    let chars: Vec<char> = text.chars().collect();
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut last_cut: Option<usize> = None;

    while start < chars.len() {
        let window_end = (start + options.chunk_size).min(chars.len());
        // Cut points must land past the previous cut; the overlap region
        // re-enters the window and would otherwise be re-cut in place.
        let floor = last_cut.unwrap_or(start);
        let cut = if window_end == chars.len() {
            window_end
        } else {
            best_cut(&chars, start, window_end, floor)
        };

        let span: String = chars[start..cut].iter().collect();
        if !span.trim().is_empty() {
            spans.push(span);
        }

        if cut == chars.len() {
            break;
        }

        last_cut = Some(cut);
        let next = cut.saturating_sub(overlap);
        start = if next > start { next } else { cut };
    }

    Ok(spans)
}

fn best_cut(chars: &[char], start: usize, window_end: usize, floor: usize) -> usize {
    let window: String = chars[start..window_end].iter().collect();

    for separator in SEPARATORS {
        if separator.is_empty() {
            return window_end;
        }
        if let Some(byte_pos) = window.rfind(separator) {
            let char_pos = window[..byte_pos].chars().count();
            let absolute = start + char_pos;
            if absolute > floor {
                return absolute;
            }
        }
    }

    window_end
}

/// Split every unit of one source document and tag the resulting chunks
/// with source, page, and sheet metadata plus a monotonic per-source
/// index. Page and sheet context is carried across spans and updated from
/// the boundary markers each span contains.
pub fn build_text_chunks(
    source: &str,
    units: &[ExtractedUnit],
    options: SplitOptions,
    start_index: u64,
) -> Result<(Vec<TextChunk>, u64), IngestError> {
    let page_re = Regex::new(r"=== Page (\d+) ===")?;
    let sheet_re = Regex::new(r"=== Sheet: (.+?) ===")?;

    let mut chunks = Vec::new();
    let mut cursor = start_index;
    let mut current_page: Option<u32> = None;
    let mut current_sheet: Option<String> = None;

    for unit in units {
        if let Some(pages) = unit.pages {
            current_page = Some(pages.start);
        }

        for span in split_text(&unit.text, options)? {
            let chunk_page = current_page;
            let chunk_sheet = current_sheet.clone();

            if let Some(capture) = page_re.captures_iter(&span).last() {
                current_page = capture[1].parse().ok();
            }
            if let Some(capture) = sheet_re.captures_iter(&span).last() {
                current_sheet = Some(capture[1].trim().to_string());
            }

            chunks.push(TextChunk {
                chunk_id: make_chunk_id(source, cursor, &span),
                source: source.to_string(),
                page: chunk_page,
                sheet: chunk_sheet,
                chunk_index: cursor,
                text: span,
            });
            cursor = cursor.saturating_add(1);
        }
    }

    Ok((chunks, cursor))
}

fn make_chunk_id(source: &str, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
