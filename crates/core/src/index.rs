use crate::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::error::IngestError;
use crate::models::{TextChunk, VectorRecord};
use crate::retry::{retry_with_backoff, Attempt};
use crate::store::VectorStore;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Indexed in place of an empty chunk set so every requested set yields a
/// queryable index.
pub const PLACEHOLDER_TEXT: &str =
    "No indexable content was extracted for this document set.";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Embed a set's chunks and persist them as one columnar index file.
/// A token-budget rejection triggers exactly one whole-job retry with a
/// strictly smaller batch size; a second rejection is fatal.
pub async fn build_index(
    chunks: &[TextChunk],
    set_name: &str,
    output_root: &Path,
    embedder: &dyn EmbeddingProvider,
    options: &BuildOptions,
) -> Result<PathBuf, IngestError> {
    std::fs::create_dir_all(output_root)?;

    let working: Vec<TextChunk> = if chunks.is_empty() {
        warn!(set = set_name, "no chunks extracted, indexing a placeholder record");
        vec![TextChunk {
            chunk_id: make_record_id(set_name, 0, PLACEHOLDER_TEXT),
            source: set_name.to_string(),
            page: None,
            sheet: None,
            chunk_index: 0,
            text: PLACEHOLDER_TEXT.to_string(),
        }]
    } else {
        chunks.to_vec()
    };

    let texts: Vec<String> = working.iter().map(|chunk| chunk.text.clone()).collect();
    let embeddings = embed_with_degradation(embedder, &texts, options).await?;

    for embedding in &embeddings {
        if embedding.len() != embedder.dimensions() {
            return Err(IngestError::BuildFailed(format!(
                "embedding dimension {} does not match provider dimension {}",
                embedding.len(),
                embedder.dimensions()
            )));
        }
    }

    let created_at = Utc::now().to_rfc3339();
    let records: Vec<VectorRecord> = working
        .iter()
        .zip(embeddings)
        .map(|(chunk, embedding)| {
            let source = if chunk.source.is_empty() {
                set_name
            } else {
                chunk.source.as_str()
            };
            VectorRecord {
                id: chunk.chunk_id.clone(),
                text: chunk.text.clone(),
                embedding,
                metadata: json!({
                    "source": source,
                    "page": chunk.page,
                    "sheet": chunk.sheet,
                    "chunk_index": chunk.chunk_index,
                    "created_at": created_at,
                }),
            }
        })
        .collect();

    let destination = output_root.join(index_file_name(set_name));
    let mut store = VectorStore::create(&destination)?;
    let written = store.append(&records)?;

    if !destination.is_file() {
        return Err(IngestError::BuildFailed(format!(
            "index file missing after write: {}",
            destination.display()
        )));
    }

    info!(
        set = set_name,
        records = written,
        path = %destination.display(),
        "persisted vector index"
    );
    Ok(destination)
}

async fn embed_with_degradation(
    embedder: &dyn EmbeddingProvider,
    texts: &[String],
    options: &BuildOptions,
) -> Result<Vec<Vec<f32>>, IngestError> {
    match embed_batches(embedder, texts, options.batch_size, options).await {
        Ok(embeddings) => Ok(embeddings),
        Err(EmbeddingError::TokenBudget(reason)) => {
            let reduced = (options.batch_size / 2).max(1);
            if reduced >= options.batch_size {
                return Err(IngestError::BuildFailed(format!(
                    "token budget exceeded with batch size {}: {reason}",
                    options.batch_size
                )));
            }
            warn!(
                batch = options.batch_size,
                reduced, "embedding batch over token budget, retrying once with smaller batches"
            );
            match embed_batches(embedder, texts, reduced, options).await {
                Ok(embeddings) => Ok(embeddings),
                Err(EmbeddingError::TokenBudget(reason)) => Err(IngestError::BuildFailed(format!(
                    "token budget exceeded again at batch size {reduced}: {reason}"
                ))),
                Err(other) => Err(IngestError::BuildFailed(other.to_string())),
            }
        }
        Err(other) => Err(IngestError::BuildFailed(other.to_string())),
    }
}

async fn embed_batches(
    embedder: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
    options: &BuildOptions,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut embeddings = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let batch_embeddings = retry_with_backoff(
            options.max_attempts,
            options.retry_base_delay,
            "embedding",
            || async move {
                embedder.embed_batch(batch).await.map_err(|error| match error {
                    EmbeddingError::Transient(_) => Attempt::Transient(error),
                    other => Attempt::Terminal(other),
                })
            },
        )
        .await?;
        embeddings.extend(batch_embeddings);
    }
    Ok(embeddings)
}

fn index_file_name(set_name: &str) -> String {
    let sanitized: String = set_name
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '_' | '-') {
                character
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = if sanitized.is_empty() {
        "set".to_string()
    } else {
        sanitized
    };
    let disambiguator = Uuid::new_v4().simple().to_string();
    format!("{sanitized}-{}.sqlite3", &disambiguator[..8])
}

fn make_record_id(set_name: &str, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(set_name.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct FakeEmbedder {
        dimensions: usize,
        max_batch: usize,
        batch_calls: AtomicU32,
    }

    impl FakeEmbedder {
        fn accepting(max_batch: usize) -> Self {
            Self {
                dimensions: 4,
                max_batch,
                batch_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if texts.len() > self.max_batch {
                return Err(EmbeddingError::TokenBudget(format!(
                    "batch of {} exceeds budget",
                    texts.len()
                )));
            }
            Ok(texts
                .iter()
                .map(|text| {
                    let seed = text.len() as f32;
                    vec![seed, seed + 1.0, seed + 2.0, seed + 3.0]
                })
                .collect())
        }
    }

    fn chunk(index: u64, text: &str) -> TextChunk {
        TextChunk {
            chunk_id: make_record_id("set", index, text),
            source: "doc.pdf".to_string(),
            page: Some(1),
            sheet: None,
            chunk_index: index,
            text: text.to_string(),
        }
    }

    fn fast_options(batch_size: usize) -> BuildOptions {
        BuildOptions {
            batch_size,
            max_attempts: 2,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn token_overflow_recovers_after_one_batch_reduction() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let embedder = FakeEmbedder::accepting(2);
        let chunks: Vec<TextChunk> = (0..4).map(|i| chunk(i, &format!("chunk {i}"))).collect();

        let path = build_index(&chunks, "stability", dir.path(), &embedder, &fast_options(4)).await?;

        let store = VectorStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 4);
        // one rejected batch of 4, then two accepted batches of 2
        assert_eq!(embedder.batch_calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn second_token_rejection_is_fatal() {
        let dir = tempdir().unwrap();
        let embedder = FakeEmbedder::accepting(0);
        let chunks: Vec<TextChunk> = (0..4).map(|i| chunk(i, &format!("chunk {i}"))).collect();

        let result = build_index(&chunks, "stability", dir.path(), &embedder, &fast_options(4)).await;
        assert!(matches!(result, Err(IngestError::BuildFailed(_))));
    }

    #[tokio::test]
    async fn empty_chunk_sets_index_a_placeholder() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let embedder = FakeEmbedder::accepting(16);

        let path = build_index(&[], "empty-set", dir.path(), &embedder, &fast_options(8)).await?;

        let store = VectorStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        let rows = store.load_rows().unwrap();
        assert_eq!(rows[0].text, PLACEHOLDER_TEXT);
        assert_eq!(rows[0].metadata["source"], "empty-set");
        Ok(())
    }

    #[tokio::test]
    async fn every_record_carries_source_metadata() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let embedder = FakeEmbedder::accepting(16);
        let mut unsourced = chunk(0, "text without provenance");
        unsourced.source = String::new();

        let path =
            build_index(&[unsourced], "fallback-set", dir.path(), &embedder, &fast_options(8))
                .await?;

        let rows = VectorStore::open(&path).unwrap().load_rows().unwrap();
        assert_eq!(rows[0].metadata["source"], "fallback-set");
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_builds_never_share_a_destination() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let embedder = FakeEmbedder::accepting(16);
        let chunks = vec![chunk(0, "same content")];

        let first = build_index(&chunks, "set", dir.path(), &embedder, &fast_options(8)).await?;
        let second = build_index(&chunks, "set", dir.path(), &embedder, &fast_options(8)).await?;

        assert_ne!(first, second);
        assert!(first.is_file());
        assert!(second.is_file());
        Ok(())
    }
}
