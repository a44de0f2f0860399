use crate::error::IngestError;
use std::path::PathBuf;
use std::time::Duration;

/// Process-level configuration, read once at startup. Endpoints and
/// credentials stay optional here; call sites that need a provider use
/// [`PipelineConfig::require_ocr_endpoint`] /
/// [`PipelineConfig::require_embedding_endpoint`], which raise a
/// configuration-level error instead of degrading silently.
///
/// Environment variables and fallbacks:
/// - `DOCPIPE_OCR_ENDPOINT` / `DOCPIPE_OCR_API_KEY`
/// - `DOCPIPE_EMBEDDING_ENDPOINT` / `DOCPIPE_EMBEDDING_API_KEY`
/// - `DOCPIPE_EMBEDDING_MODEL` (default `default`)
/// - `DOCPIPE_REMOTE_API_BASE` / `DOCPIPE_REMOTE_TOKEN`
/// - `DOCPIPE_DATA_ROOT` (default `./data`)
/// - `DOCPIPE_IMAGE_ROOT` (default `./images`)
/// - `DOCPIPE_OUTPUT_ROOT` (default `./vectorstores`)
/// - `DOCPIPE_PAGE_LIMIT` (default 8 pages per OCR call)
/// - `DOCPIPE_MAX_RETRIES` (default 3 attempts)
/// - `DOCPIPE_EMBED_BATCH` (default 64)
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ocr_endpoint: Option<String>,
    pub ocr_api_key: Option<String>,
    pub embedding_endpoint: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub remote_api_base: Option<String>,
    pub remote_token: Option<String>,
    pub data_root: PathBuf,
    pub image_root: PathBuf,
    pub output_root: PathBuf,
    pub page_limit: u32,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub embed_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ocr_endpoint: None,
            ocr_api_key: None,
            embedding_endpoint: None,
            embedding_api_key: None,
            embedding_model: "default".to_string(),
            remote_api_base: None,
            remote_token: None,
            data_root: PathBuf::from("./data"),
            image_root: PathBuf::from("./images"),
            output_root: PathBuf::from("./vectorstores"),
            page_limit: 8,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            embed_batch_size: 64,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ocr_endpoint: env_string("DOCPIPE_OCR_ENDPOINT"),
            ocr_api_key: env_string("DOCPIPE_OCR_API_KEY"),
            embedding_endpoint: env_string("DOCPIPE_EMBEDDING_ENDPOINT"),
            embedding_api_key: env_string("DOCPIPE_EMBEDDING_API_KEY"),
            embedding_model: env_string("DOCPIPE_EMBEDDING_MODEL")
                .unwrap_or(defaults.embedding_model),
            remote_api_base: env_string("DOCPIPE_REMOTE_API_BASE"),
            remote_token: env_string("DOCPIPE_REMOTE_TOKEN"),
            data_root: env_string("DOCPIPE_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_root),
            image_root: env_string("DOCPIPE_IMAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.image_root),
            output_root: env_string("DOCPIPE_OUTPUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_root),
            page_limit: env_parsed("DOCPIPE_PAGE_LIMIT").unwrap_or(defaults.page_limit),
            max_retries: env_parsed("DOCPIPE_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_base_delay: defaults.retry_base_delay,
            embed_batch_size: env_parsed("DOCPIPE_EMBED_BATCH").unwrap_or(defaults.embed_batch_size),
        }
    }

    pub fn require_ocr_endpoint(&self) -> Result<&str, IngestError> {
        self.ocr_endpoint.as_deref().ok_or_else(|| {
            IngestError::MissingConfiguration("DOCPIPE_OCR_ENDPOINT is not set".to_string())
        })
    }

    pub fn require_embedding_endpoint(&self) -> Result<&str, IngestError> {
        self.embedding_endpoint.as_deref().ok_or_else(|| {
            IngestError::MissingConfiguration("DOCPIPE_EMBEDDING_ENDPOINT is not set".to_string())
        })
    }
}

fn env_string(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let value = value.trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_document_the_fallback_roots() {
        let config = PipelineConfig::default();
        assert_eq!(config.data_root, PathBuf::from("./data"));
        assert_eq!(config.image_root, PathBuf::from("./images"));
        assert_eq!(config.output_root, PathBuf::from("./vectorstores"));
        assert_eq!(config.page_limit, 8);
    }

    #[test]
    fn missing_provider_endpoints_raise_configuration_errors() {
        let config = PipelineConfig::default();
        assert!(matches!(
            config.require_ocr_endpoint(),
            Err(IngestError::MissingConfiguration(_))
        ));
        assert!(matches!(
            config.require_embedding_endpoint(),
            Err(IngestError::MissingConfiguration(_))
        ));
    }
}
