use crate::chunking::{document_marker, page_marker, sheet_marker};
use crate::error::IngestError;
use crate::models::{page_chunks, ExtractedUnit, PageChunk, SupportedFormat};
use crate::retry::{retry_with_backoff, Attempt};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use calamine::{open_workbook_auto, Reader};
use lopdf::Document;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read as _;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

const OCR_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Provider cap on pages per OCR call.
    pub page_limit: u32,
    /// Total attempts per OCR call, transient failures only.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            page_limit: 8,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// OCR failures split into the two classes the retry policy cares about.
/// Server-side errors and timeouts are transient; anything else, including
/// every sub-500 status, is terminal.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("transient ocr failure: {0}")]
    Transient(String),

    #[error("ocr request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct OcrPageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub pages: Vec<OcrPageText>,
    pub annotation: Option<Value>,
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn analyze(&self, path: &Path, schema: Option<&Value>) -> Result<OcrOutcome, OcrError>;
}

#[derive(Debug, Clone, Serialize)]
struct OcrRequest<'a> {
    document_base64: String,
    source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrResponsePage>>,
    text: Option<String>,
    #[serde(default)]
    annotation: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponsePage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

pub struct HttpOcrClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOcrClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, IngestError> {
        let client = Client::builder().timeout(OCR_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl OcrProvider for HttpOcrClient {
    async fn analyze(&self, path: &Path, schema: Option<&Value>) -> Result<OcrOutcome, OcrError> {
        let bytes =
            std::fs::read(path).map_err(|error| OcrError::Rejected(error.to_string()))?;
        let payload = OcrRequest {
            document_base64: STANDARD.encode(bytes),
            source_name: path.to_string_lossy().to_string(),
            schema,
        };

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() || error.is_connect() {
                OcrError::Transient(error.to_string())
            } else {
                OcrError::Rejected(error.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(OcrError::Transient(format!(
                "{} returned {status}",
                self.endpoint
            )));
        }
        if !status.is_success() {
            return Err(OcrError::Rejected(format!(
                "{} returned {status}",
                self.endpoint
            )));
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|error| OcrError::Rejected(error.to_string()))?;
        payload_to_outcome(parsed, path)
    }
}

fn payload_to_outcome(payload: OcrResponse, path: &Path) -> Result<OcrOutcome, OcrError> {
    let annotation = payload.annotation;

    if let Some(listed) = payload.pages {
        let pages = listed
            .into_iter()
            .filter_map(|page| {
                let text = page.text.map(|value| value.trim().to_string())?;
                if text.is_empty() {
                    None
                } else {
                    Some(OcrPageText {
                        number: page.page.unwrap_or(1),
                        text,
                    })
                }
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(OcrOutcome { pages, annotation });
        }
    }

    if let Some(raw_text) = payload.text {
        let pages = raw_text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, chunk)| {
                let text = chunk.trim().to_string();
                if text.is_empty() {
                    None
                } else {
                    Some(OcrPageText {
                        number: (index + 1) as u32,
                        text,
                    })
                }
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(OcrOutcome { pages, annotation });
        }
    }

    Err(OcrError::Rejected(format!(
        "ocr response has no readable text for {}",
        path.display()
    )))
}

async fn analyze_with_retry(
    ocr: &dyn OcrProvider,
    path: &Path,
    schema: Option<&Value>,
    options: &ExtractOptions,
) -> Result<OcrOutcome, IngestError> {
    retry_with_backoff(
        options.max_attempts,
        options.retry_base_delay,
        "ocr",
        || async move {
            ocr.analyze(path, schema).await.map_err(|error| match error {
                OcrError::Transient(_) => Attempt::Transient(error),
                OcrError::Rejected(_) => Attempt::Terminal(error),
            })
        },
    )
    .await
    .map_err(|error| IngestError::ExtractionFailed(error.to_string()))
}

/// Extract one local document into ordered units. Paginated documents that
/// exceed the provider page limit are split into standalone page-bounded
/// copies, called in page order; the per-chunk copies are deleted on every
/// exit path.
pub async fn extract_units(
    path: &Path,
    schema: Option<&Value>,
    ocr: &dyn OcrProvider,
    options: &ExtractOptions,
) -> Result<Vec<ExtractedUnit>, IngestError> {
    let format = SupportedFormat::from_path(path)?;
    let source = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("document")
        .to_string();

    match format {
        SupportedFormat::Pdf => extract_pdf(path, &source, schema, ocr, options).await,
        SupportedFormat::Image => {
            let outcome = analyze_with_retry(ocr, path, schema, options).await?;
            Ok(vec![unit_from_outcome(
                &source,
                outcome,
                PageChunk { start: 1, end: 1 },
                0,
                true,
            )])
        }
        SupportedFormat::Word => extract_docx(path, &source),
        SupportedFormat::Excel => extract_workbook(path, &source),
    }
}

async fn extract_pdf(
    path: &Path,
    source: &str,
    schema: Option<&Value>,
    ocr: &dyn OcrProvider,
    options: &ExtractOptions,
) -> Result<Vec<ExtractedUnit>, IngestError> {
    let document = tokio::task::block_in_place(|| Document::load(path))
        .map_err(|error| IngestError::PdfParse(error.to_string()))?;
    let total = document.get_pages().len() as u32;
    if total == 0 {
        return Err(IngestError::ExtractionFailed(format!(
            "pdf has no pages: {}",
            path.display()
        )));
    }

    if total <= options.page_limit {
        let outcome = analyze_with_retry(ocr, path, schema, options).await?;
        return Ok(vec![unit_from_outcome(
            source,
            outcome,
            PageChunk {
                start: 1,
                end: total,
            },
            0,
            true,
        )]);
    }

    let chunks = page_chunks(total, options.page_limit);
    info!(
        source,
        total_pages = total,
        chunk_count = chunks.len(),
        "splitting pdf for page-limited ocr"
    );

    let mut units = Vec::with_capacity(chunks.len());
    for (position, chunk) in chunks.iter().enumerate() {
        let bounded = tokio::task::block_in_place(|| write_page_range(&document, *chunk, total))?;
        let outcome = analyze_with_retry(ocr, bounded.path(), schema, options).await?;
        units.push(unit_from_outcome(
            source,
            outcome,
            *chunk,
            chunk.start - 1,
            position == 0,
        ));
    }
    Ok(units)
}

/// Write a standalone copy of `document` containing only the pages in
/// `range`. The returned temp file is removed when dropped.
fn write_page_range(
    document: &Document,
    range: PageChunk,
    total: u32,
) -> Result<NamedTempFile, IngestError> {
    let mut bounded = document.clone();
    let excluded: Vec<u32> = (1..=total)
        .filter(|page| *page < range.start || *page > range.end)
        .collect();
    if !excluded.is_empty() {
        bounded.delete_pages(&excluded);
    }
    bounded.prune_objects();

    let file = tempfile::Builder::new()
        .prefix("docpipe-pages-")
        .suffix(".pdf")
        .tempfile()?;
    bounded
        .save(file.path())
        .map_err(|error| IngestError::PdfParse(error.to_string()))?;
    Ok(file)
}

fn unit_from_outcome(
    source: &str,
    outcome: OcrOutcome,
    pages: PageChunk,
    page_offset: u32,
    first: bool,
) -> ExtractedUnit {
    let mut text = String::new();
    if first {
        text.push_str(&document_marker(source));
    }
    for page in &outcome.pages {
        text.push_str(&page_marker(page_offset + page.number));
        text.push_str(&page.text);
    }
    ExtractedUnit {
        text,
        annotation: outcome.annotation,
        pages: Some(pages),
    }
}

fn extract_docx(path: &Path, source: &str) -> Result<Vec<ExtractedUnit>, IngestError> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|error| {
        IngestError::ExtractionFailed(format!("unreadable docx {}: {error}", path.display()))
    })?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|error| {
            IngestError::ExtractionFailed(format!(
                "docx {} has no document part: {error}",
                path.display()
            ))
        })?
        .read_to_string(&mut xml)?;

    let text = document_xml_text(&xml)?;
    if text.trim().is_empty() {
        return Err(IngestError::ExtractionFailed(format!(
            "docx has no readable text: {}",
            path.display()
        )));
    }

    Ok(vec![ExtractedUnit {
        text: format!("{}{}", document_marker(source), text),
        annotation: None,
        pages: None,
    }])
}

fn document_xml_text(xml: &str) -> Result<String, IngestError> {
    let with_breaks = xml.replace("</w:p>", "\n\n");
    let tags = Regex::new(r"<[^>]+>")?;
    let stripped = tags.replace_all(&with_breaks, "");
    Ok(stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&"))
}

fn extract_workbook(path: &Path, source: &str) -> Result<Vec<ExtractedUnit>, IngestError> {
    let mut workbook = open_workbook_auto(path).map_err(|error| {
        IngestError::ExtractionFailed(format!("unreadable workbook {}: {error}", path.display()))
    })?;

    let sheet_names = workbook.sheet_names().to_owned();
    if sheet_names.is_empty() {
        return Err(IngestError::ExtractionFailed(format!(
            "workbook has no sheets: {}",
            path.display()
        )));
    }

    let mut text = document_marker(source);
    for name in sheet_names {
        // One bad sheet fails the whole workbook; partial sheet output
        // would silently skew downstream extraction.
        let range = workbook.worksheet_range(&name).map_err(|error| {
            IngestError::ExtractionFailed(format!(
                "sheet {name:?} in {}: {error}",
                path.display()
            ))
        })?;

        text.push_str(&sheet_marker(&name));
        for row in range.rows() {
            let line = row
                .iter()
                .map(|cell| cell.to_string())
                .collect::<Vec<_>>()
                .join("\t");
            text.push_str(line.trim_end());
            text.push('\n');
        }
    }

    Ok(vec![ExtractedUnit {
        text,
        annotation: None,
        pages: None,
    }])
}
