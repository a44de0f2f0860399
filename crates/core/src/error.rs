use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reference cannot be resolved: {0}")]
    UnresolvableReference(String),

    #[error("embedded payload is invalid: {0}")]
    InvalidPayload(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("index build failed: {0}")]
    BuildFailed(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("missing provider configuration: {0}")]
    MissingConfiguration(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("index store error: {0}")]
    Store(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search unavailable: {0}")]
    Unavailable(String),

    #[error("requested {requested} neighbors but index holds {available}")]
    RequestedTooMany { requested: usize, available: usize },

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("corrupt index record: {0}")]
    CorruptRecord(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("index store error: {0}")]
    Store(#[from] rusqlite::Error),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
