pub mod chunking;
pub mod config;
pub mod consolidate;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod materialize;
pub mod models;
pub mod query;
pub mod retry;
pub mod store;

pub use chunking::{
    build_text_chunks, document_marker, page_marker, sheet_marker, split_text, SplitOptions,
};
pub use config::PipelineConfig;
pub use consolidate::{consolidate, merge_values, Consolidated};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingError, EmbeddingProvider, HttpEmbeddingClient,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IngestError, SearchError};
pub use extractor::{
    extract_units, ExtractOptions, HttpOcrClient, OcrError, OcrOutcome, OcrPageText, OcrProvider,
};
pub use index::{build_index, BuildOptions, PLACEHOLDER_TEXT};
pub use ingest::{discover_documents, Pipeline, SetOutcome};
pub use materialize::{materialize, resolve_download_url, Materialized, RemoteStoreClient};
pub use models::{
    page_chunks, DocumentReference, DocumentSetSpec, ExtractedUnit, IngestionReport,
    IngestionSummary, PageChunk, RemoteDescriptor, SupportedFormat, TextChunk, VectorRecord,
};
pub use query::{
    answer_index_query, IndexReader, RetrievalEngine, SearchBackend, EMPTY_INDEX_SENTINEL,
    NO_RELEVANT_SENTINEL, SEARCH_UNAVAILABLE_SENTINEL, SNIPPET_DELIMITER,
};
pub use retry::{retry_with_backoff, Attempt};
pub use store::{cosine_similarity, ScoredSnippet, StoredRow, VectorStore};
