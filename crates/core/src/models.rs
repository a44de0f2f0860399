use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, NoneAsEmptyString};
use std::collections::BTreeMap;
use std::path::Path;

/// Descriptor for a document living in a remote store. Fields are
/// alternatives, not requirements: resolution walks them in policy order
/// (content URL, web URL, site + server-relative path, drive/item pair).
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteDescriptor {
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub content_url: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub site_host: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub server_relative_path: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub file_name: Option<String>,
}

/// A caller-owned reference to one document. Exactly one variant is
/// populated; each resolves to exactly one local byte stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentReference {
    Local { path: String },
    Embedded { name: String, payload: String },
    Remote { descriptor: RemoteDescriptor },
}

impl DocumentReference {
    /// Stable key used in ingestion issues and extraction logs.
    pub fn key(&self) -> String {
        match self {
            DocumentReference::Local { path } => Path::new(path)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(path.as_str())
                .to_string(),
            DocumentReference::Embedded { name, .. } => name.clone(),
            DocumentReference::Remote { descriptor } => descriptor
                .file_name
                .clone()
                .or_else(|| descriptor.item_id.clone())
                .or_else(|| descriptor.server_relative_path.clone())
                .or_else(|| descriptor.web_url.clone())
                .unwrap_or_else(|| "remote-document".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SupportedFormat {
    Pdf,
    Word,
    Excel,
    Image,
}

impl SupportedFormat {
    /// Detect the format from the file extension alone. Unknown extensions
    /// are rejected, never guessed from content.
    pub fn from_path(path: &Path) -> Result<Self, crate::IngestError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Ok(SupportedFormat::Pdf),
            "docx" => Ok(SupportedFormat::Word),
            "xlsx" | "xlsm" | "xls" => Ok(SupportedFormat::Excel),
            "png" | "jpg" | "jpeg" | "bmp" | "tif" | "tiff" => Ok(SupportedFormat::Image),
            _ => Err(crate::IngestError::UnsupportedFormat(format!(
                "{} (extension {:?})",
                path.display(),
                extension
            ))),
        }
    }

    pub fn is_paginated(self) -> bool {
        matches!(self, SupportedFormat::Pdf | SupportedFormat::Image)
    }
}

/// A contiguous 1-based page range, capped at the OCR provider's per-call
/// page limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageChunk {
    pub start: u32,
    pub end: u32,
}

impl PageChunk {
    pub fn page_count(self) -> u32 {
        self.end.saturating_sub(self.start) + 1
    }
}

/// Split a `total_pages`-page document into `ceil(total/cap)` contiguous,
/// non-overlapping chunks exactly covering `[1, total_pages]`.
pub fn page_chunks(total_pages: u32, cap: u32) -> Vec<PageChunk> {
    let cap = cap.max(1);
    let mut chunks = Vec::new();
    let mut start = 1u32;
    while start <= total_pages {
        let end = (start + cap - 1).min(total_pages);
        chunks.push(PageChunk { start, end });
        start = end + 1;
    }
    chunks
}

/// Raw text (and optionally a structured annotation) extracted from one
/// page chunk, or from one whole non-paginated document.
#[derive(Debug, Clone)]
pub struct ExtractedUnit {
    pub text: String,
    pub annotation: Option<Value>,
    pub pages: Option<PageChunk>,
}

/// A bounded text span produced by the splitter for embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    pub chunk_id: String,
    pub source: String,
    pub page: Option<u32>,
    pub sheet: Option<String>,
    pub chunk_index: u64,
    pub text: String,
}

/// The persisted unit of the columnar index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

/// One named document set submitted for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSetSpec {
    pub id: String,
    pub references: Vec<DocumentReference>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub files: Option<Vec<String>>,
}

fn default_chunk_size() -> usize {
    1_200
}

fn default_chunk_overlap() -> usize {
    120
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// Structured ingestion result. Always returned, even under total failure;
/// only configuration-level problems raise instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionReport {
    pub vectorstore_dir_list: Vec<BTreeMap<String, Option<String>>>,
    pub summary: IngestionSummary,
    pub issues: Vec<String>,
}

pub const NO_INPUT_ISSUE: &str = "NO_INPUT_DIRECTORIES";

impl IngestionReport {
    pub fn empty_input() -> Self {
        Self {
            vectorstore_dir_list: Vec::new(),
            summary: IngestionSummary::default(),
            issues: vec![NO_INPUT_ISSUE.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_chunks_cover_range_without_overlap() {
        for total in 1u32..=40 {
            for cap in 1u32..=10 {
                let chunks = page_chunks(total, cap);
                assert_eq!(chunks.len() as u32, total.div_ceil(cap));
                assert_eq!(chunks[0].start, 1);
                assert_eq!(chunks.last().unwrap().end, total);
                for window in chunks.windows(2) {
                    assert_eq!(window[1].start, window[0].end + 1);
                }
                for chunk in &chunks {
                    assert!(chunk.page_count() <= cap);
                }
            }
        }
    }

    #[test]
    fn twenty_pages_with_cap_eight_yield_three_chunks() {
        let chunks = page_chunks(20, 8);
        assert_eq!(
            chunks,
            vec![
                PageChunk { start: 1, end: 8 },
                PageChunk { start: 9, end: 16 },
                PageChunk { start: 17, end: 20 },
            ]
        );
    }

    #[test]
    fn unknown_extension_is_rejected_not_guessed() {
        assert!(SupportedFormat::from_path(Path::new("report.pdf")).is_ok());
        assert!(SupportedFormat::from_path(Path::new("report.docx")).is_ok());
        assert!(SupportedFormat::from_path(Path::new("report.xyz")).is_err());
        assert!(SupportedFormat::from_path(Path::new("report")).is_err());
    }

    #[test]
    fn remote_descriptor_empty_strings_deserialize_as_none() {
        let descriptor: RemoteDescriptor =
            serde_json::from_str(r#"{"web_url": "", "item_id": "abc"}"#).unwrap();
        assert!(descriptor.web_url.is_none());
        assert_eq!(descriptor.item_id.as_deref(), Some("abc"));
    }

    #[test]
    fn empty_input_report_matches_contract() {
        let report = IngestionReport::empty_input();
        let rendered = serde_json::to_value(&report).unwrap();
        assert_eq!(
            rendered,
            serde_json::json!({
                "vectorstore_dir_list": [],
                "summary": {"total": 0, "success": 0, "failed": 0},
                "issues": ["NO_INPUT_DIRECTORIES"],
            })
        );
    }
}
