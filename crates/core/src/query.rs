use crate::embeddings::EmbeddingProvider;
use crate::error::SearchError;
use crate::store::{cosine_similarity, ScoredSnippet, StoredRow, VectorStore};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

/// Fixed "no result" sentinels. Callers must treat these as non-error
/// empty results and never parse them as data.
pub const EMPTY_INDEX_SENTINEL: &str = "No documents have been indexed for this collection.";
pub const NO_RELEVANT_SENTINEL: &str = "No relevant documents were found for this query.";
pub const SEARCH_UNAVAILABLE_SENTINEL: &str =
    "Search is currently unavailable for this collection.";

pub const SNIPPET_DELIMITER: &str = "\n\n---\n\n";

const DIVERSITY_TOP_K: usize = 15;
const SIMILARITY_TOP_K: usize = 4;
const MMR_LAMBDA: f32 = 0.5;

/// Seam between the retrieval cascade and whatever holds the vectors.
/// Nearest-neighbor backends error when asked for more neighbors than the
/// index holds; that surfaces here as `RequestedTooMany`.
pub trait SearchBackend {
    fn row_count(&self) -> Result<u64, SearchError>;
    fn in_memory_len(&self) -> usize;
    fn similarity(&self, query: &[f32], k: usize) -> Result<Vec<ScoredSnippet>, SearchError>;
    fn diversity(&self, query: &[f32], k: usize) -> Result<Vec<ScoredSnippet>, SearchError>;
}

/// Backend over one persisted index file. Rows are loaded once at open;
/// the row count is still read from the file so the engine can fall back
/// to the loaded length when that read fails.
pub struct IndexReader {
    store: VectorStore,
    rows: Vec<StoredRow>,
}

impl IndexReader {
    pub fn open(path: &Path) -> Result<Self, SearchError> {
        let store = VectorStore::open(path)?;
        let rows = store.load_rows()?;
        Ok(Self { store, rows })
    }
}

impl SearchBackend for IndexReader {
    fn row_count(&self) -> Result<u64, SearchError> {
        self.store.count()
    }

    fn in_memory_len(&self) -> usize {
        self.rows.len()
    }

    fn similarity(&self, query: &[f32], k: usize) -> Result<Vec<ScoredSnippet>, SearchError> {
        let ranked = self.ranked_rows(query, k)?;
        Ok(ranked
            .into_iter()
            .take(k)
            .map(|(score, row)| snippet(score, row))
            .collect())
    }

    fn diversity(&self, query: &[f32], k: usize) -> Result<Vec<ScoredSnippet>, SearchError> {
        let mut candidates = self.ranked_rows(query, k)?;
        let mut selected: Vec<(f32, &StoredRow)> = Vec::with_capacity(k);

        while selected.len() < k && !candidates.is_empty() {
            let mut best_index = 0;
            let mut best_score = f32::NEG_INFINITY;
            for (index, (relevance, row)) in candidates.iter().enumerate() {
                let redundancy = selected
                    .iter()
                    .map(|(_, chosen)| cosine_similarity(&row.embedding, &chosen.embedding))
                    .fold(0.0f32, f32::max);
                let mmr = MMR_LAMBDA * relevance - (1.0 - MMR_LAMBDA) * redundancy;
                if mmr > best_score {
                    best_score = mmr;
                    best_index = index;
                }
            }
            selected.push(candidates.remove(best_index));
        }

        Ok(selected
            .into_iter()
            .map(|(score, row)| snippet(score, row))
            .collect())
    }
}

impl IndexReader {
    fn ranked_rows(&self, query: &[f32], k: usize) -> Result<Vec<(f32, &StoredRow)>, SearchError> {
        if k > self.rows.len() {
            return Err(SearchError::RequestedTooMany {
                requested: k,
                available: self.rows.len(),
            });
        }
        let mut scored: Vec<(f32, &StoredRow)> = self
            .rows
            .iter()
            .map(|row| (cosine_similarity(query, &row.embedding), row))
            .collect();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));
        Ok(scored)
    }
}

fn snippet(score: f32, row: &StoredRow) -> ScoredSnippet {
    ScoredSnippet {
        id: row.id.clone(),
        text: row.text.clone(),
        score,
        metadata: row.metadata.clone(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Plan {
    Diversity(usize),
    Similarity(usize),
}

impl Plan {
    fn desired_k(self) -> usize {
        match self {
            Plan::Diversity(k) | Plan::Similarity(k) => k,
        }
    }
}

pub struct RetrievalEngine<B: SearchBackend> {
    backend: B,
}

impl<B: SearchBackend> RetrievalEngine<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Record count is determined once per query: the index's own row
    /// count, or the loaded structure size when that read fails.
    pub fn record_count(&self) -> u64 {
        match self.backend.row_count() {
            Ok(count) => count,
            Err(error) => {
                warn!(%error, "row count read failed, using loaded length");
                self.backend.in_memory_len() as u64
            }
        }
    }

    /// Answer a query with the retrieval cascade, degrading to sentinel
    /// strings instead of raising for every empty outcome.
    pub async fn answer(&self, query: &str, embedder: &dyn EmbeddingProvider) -> String {
        let count = self.record_count();
        if count == 0 {
            debug!("index is empty, skipping retrieval");
            return EMPTY_INDEX_SENTINEL.to_string();
        }

        let query_vector = match embedder.embed_one(query).await {
            Ok(vector) => vector,
            Err(error) => {
                warn!(%error, "query embedding failed");
                return SEARCH_UNAVAILABLE_SENTINEL.to_string();
            }
        };

        match self.search(&query_vector, count) {
            Ok(hits) => {
                let relevant: Vec<ScoredSnippet> =
                    hits.into_iter().filter(|hit| hit.score > 0.0).collect();
                if relevant.is_empty() {
                    NO_RELEVANT_SENTINEL.to_string()
                } else {
                    render_snippets(&relevant)
                }
            }
            Err(error) => {
                warn!(%error, "retrieval failed");
                SEARCH_UNAVAILABLE_SENTINEL.to_string()
            }
        }
    }

    /// The degradation cascade. Sized to the index's actual record count:
    /// one `k = 1` similarity lookup for a single-record index, otherwise
    /// diversity top-15, diversity top-N, similarity top-min(4, N), and
    /// similarity top-1 in order. Desired k is clamped to N before every
    /// call; a plan failing because the index is smaller than requested is
    /// skipped in favor of the next.
    pub fn search(
        &self,
        query_vector: &[f32],
        count: u64,
    ) -> Result<Vec<ScoredSnippet>, SearchError> {
        let n = count as usize;
        if n == 0 {
            return Ok(Vec::new());
        }
        if n == 1 {
            return self
                .backend
                .similarity(query_vector, 1)
                .map_err(|error| SearchError::Unavailable(error.to_string()));
        }

        let plans = [
            Plan::Diversity(DIVERSITY_TOP_K),
            Plan::Diversity(n),
            Plan::Similarity(SIMILARITY_TOP_K.min(n)),
            Plan::Similarity(1),
        ];

        let mut last_error: Option<SearchError> = None;
        for plan in plans {
            let k = plan.desired_k().clamp(1, n);
            let outcome = match plan {
                Plan::Diversity(_) => self.backend.diversity(query_vector, k),
                Plan::Similarity(_) => self.backend.similarity(query_vector, k),
            };
            match outcome {
                Ok(hits) => return Ok(hits),
                Err(SearchError::RequestedTooMany {
                    requested,
                    available,
                }) => {
                    debug!(requested, available, "plan skipped, index smaller than requested");
                    continue;
                }
                Err(error) => {
                    warn!(%error, "retrieval plan failed, trying next");
                    last_error = Some(error);
                    continue;
                }
            }
        }

        Err(SearchError::Unavailable(
            last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "every retrieval plan was skipped".to_string()),
        ))
    }
}

fn render_snippets(hits: &[ScoredSnippet]) -> String {
    hits.iter()
        .enumerate()
        .map(|(rank, hit)| {
            let source = hit
                .metadata
                .pointer("/source")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            format!(
                "[{}] source={} score={:.4}\n{}",
                rank + 1,
                source,
                hit.score,
                hit.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join(SNIPPET_DELIMITER)
}

/// Open one persisted index and answer a query against it.
pub async fn answer_index_query(
    index_path: &Path,
    query: &str,
    embedder: &dyn EmbeddingProvider,
) -> Result<String, SearchError> {
    let reader = IndexReader::open(index_path)?;
    let engine = RetrievalEngine::new(reader);
    Ok(engine.answer(query, embedder).await)
}
