use crate::chunking::{build_text_chunks, SplitOptions};
use crate::config::PipelineConfig;
use crate::consolidate::{consolidate, Consolidated};
use crate::embeddings::EmbeddingProvider;
use crate::error::IngestError;
use crate::extractor::{extract_units, ExtractOptions, OcrProvider};
use crate::index::{build_index, BuildOptions};
use crate::materialize::{materialize, RemoteStoreClient};
use crate::models::{
    DocumentReference, DocumentSetSpec, IngestionReport, SupportedFormat, TextChunk,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Discover supported documents under a folder. Flat unless `recursive`;
/// optionally restricted to an explicit file-name subset. Deterministic
/// order.
pub fn discover_documents(
    folder: &Path,
    recursive: bool,
    subset: Option<&[String]>,
) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(folder);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker.into_iter().filter_map(|item| item.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if SupportedFormat::from_path(entry.path()).is_err() {
            continue;
        }
        if let Some(subset) = subset {
            let name = entry
                .path()
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            if !subset.iter().any(|wanted| wanted == name) {
                continue;
            }
        }
        files.push(entry.path().to_path_buf());
    }

    files.sort_unstable();
    files
}

/// One ingested set: the persisted index plus the documents that failed
/// along the way without aborting their siblings.
pub struct SetOutcome {
    pub index_path: PathBuf,
    pub document_issues: Vec<(String, String)>,
}

/// The ingestion and extraction pipeline over injected provider clients.
/// Clients are constructed once and shared read-only.
pub struct Pipeline<O: OcrProvider, E: EmbeddingProvider> {
    ocr: O,
    embedder: E,
    remote: Option<RemoteStoreClient>,
    data_root: PathBuf,
    image_root: PathBuf,
    output_root: PathBuf,
    extract_options: ExtractOptions,
    build_options: BuildOptions,
}

impl<O: OcrProvider, E: EmbeddingProvider> Pipeline<O, E> {
    pub fn new(
        ocr: O,
        embedder: E,
        remote: Option<RemoteStoreClient>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            ocr,
            embedder,
            remote,
            data_root: config.data_root.clone(),
            image_root: config.image_root.clone(),
            output_root: config.output_root.clone(),
            extract_options: ExtractOptions {
                page_limit: config.page_limit,
                max_attempts: config.max_retries,
                retry_base_delay: config.retry_base_delay,
            },
            build_options: BuildOptions {
                batch_size: config.embed_batch_size,
                max_attempts: config.max_retries,
                retry_base_delay: config.retry_base_delay,
            },
        }
    }

    /// Ingest every named set. Always returns a structured report; one
    /// set's failure never aborts the others.
    pub async fn ingest_sets(&self, sets: &[DocumentSetSpec]) -> IngestionReport {
        if sets.is_empty() {
            info!("ingestion called with no document sets");
            return IngestionReport::empty_input();
        }

        let mut report = IngestionReport::default();
        for set in sets {
            report.summary.total += 1;
            match self.ingest_set(set).await {
                Ok(outcome) => {
                    report.summary.success += 1;
                    report.vectorstore_dir_list.push(BTreeMap::from([(
                        set.id.clone(),
                        Some(outcome.index_path.display().to_string()),
                    )]));
                    report.issues.extend(
                        outcome
                            .document_issues
                            .into_iter()
                            .map(|(key, reason)| format!("{}/{key}: {reason}", set.id)),
                    );
                }
                Err(error) => {
                    warn!(set = %set.id, %error, "document set failed");
                    report.summary.failed += 1;
                    report
                        .vectorstore_dir_list
                        .push(BTreeMap::from([(set.id.clone(), None)]));
                    report.issues.push(format!("{}: {error}", set.id));
                }
            }
        }
        report
    }

    /// Ingest one set into one persisted index. Per-document failures are
    /// isolated into the outcome; the set itself fails only when the index
    /// cannot be built.
    pub async fn ingest_set(&self, set: &DocumentSetSpec) -> Result<SetOutcome, IngestError> {
        let documents = self.expand_references(set);
        let split = SplitOptions {
            chunk_size: set.chunk_size,
            chunk_overlap: set.chunk_overlap,
        };

        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut document_issues = Vec::new();

        for (key, reference) in documents {
            match self.document_chunks(&key, &reference, split).await {
                Ok(document_chunks) => {
                    info!(set = %set.id, document = %key, chunks = document_chunks.len(), "document extracted");
                    chunks.extend(document_chunks);
                }
                Err(error) => {
                    warn!(set = %set.id, document = %key, %error, "document failed, continuing with siblings");
                    document_issues.push((key, error.to_string()));
                }
            }
        }

        let index_path = build_index(
            &chunks,
            &set.id,
            &self.output_root,
            &self.embedder,
            &self.build_options,
        )
        .await?;

        Ok(SetOutcome {
            index_path,
            document_issues,
        })
    }

    /// Materialize, extract, and consolidate one document into a single
    /// schema-validated instance, or `None` when no chunk yielded usable
    /// data.
    pub async fn extract_document<T: DeserializeOwned>(
        &self,
        reference: &DocumentReference,
        schema: Option<&Value>,
    ) -> Result<Option<Consolidated<T>>, IngestError> {
        let key = reference.key();
        let materialized = materialize(
            reference,
            &self.data_root,
            &self.image_root,
            self.remote.as_ref(),
        )
        .await?;
        let units =
            extract_units(materialized.path(), schema, &self.ocr, &self.extract_options).await?;

        let payloads: Vec<Value> = units
            .iter()
            .filter_map(|unit| unit.annotation.clone())
            .collect();
        Ok(consolidate::<T>(&key, payloads))
    }

    async fn document_chunks(
        &self,
        key: &str,
        reference: &DocumentReference,
        split: SplitOptions,
    ) -> Result<Vec<TextChunk>, IngestError> {
        let materialized = materialize(
            reference,
            &self.data_root,
            &self.image_root,
            self.remote.as_ref(),
        )
        .await?;
        let units =
            extract_units(materialized.path(), None, &self.ocr, &self.extract_options).await?;
        let (chunks, _) = build_text_chunks(key, &units, split, 0)?;
        Ok(chunks)
    }

    fn expand_references(&self, set: &DocumentSetSpec) -> Vec<(String, DocumentReference)> {
        let mut documents = Vec::new();
        for reference in &set.references {
            match reference {
                DocumentReference::Local { path } if Path::new(path).is_dir() => {
                    let discovered =
                        discover_documents(Path::new(path), set.recursive, set.files.as_deref());
                    if discovered.is_empty() {
                        warn!(set = %set.id, folder = %path, "no supported documents discovered");
                    }
                    for file in discovered {
                        let key = file
                            .file_name()
                            .and_then(|name| name.to_str())
                            .unwrap_or("document")
                            .to_string();
                        documents.push((
                            key,
                            DocumentReference::Local {
                                path: file.to_string_lossy().to_string(),
                            },
                        ));
                    }
                }
                other => documents.push((other.key(), other.clone())),
            }
        }
        documents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{CharacterNgramEmbedder, EmbeddingError};
    use crate::extractor::{OcrError, OcrOutcome, OcrPageText};
    use crate::store::VectorStore;
    use async_trait::async_trait;
    use std::fs::{self, File};
    use std::io::Write as _;
    use tempfile::tempdir;

    struct StubOcr;

    #[async_trait]
    impl OcrProvider for StubOcr {
        async fn analyze(
            &self,
            path: &Path,
            _schema: Option<&Value>,
        ) -> Result<OcrOutcome, OcrError> {
            Ok(OcrOutcome {
                pages: vec![OcrPageText {
                    number: 1,
                    text: format!("ocr text for {}", path.display()),
                }],
                annotation: Some(serde_json::json!({"items": ["from-ocr"]})),
            })
        }
    }

    struct RejectingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for RejectingEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::TokenBudget(format!(
                "batch of {} always rejected",
                texts.len()
            )))
        }
    }

    fn write_docx(path: &Path, body: &str) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file(
                "word/document.xml",
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
        writer
            .write_all(
                format!(
                    r#"<w:document><w:body><w:p><w:r><w:t>{body}</w:t></w:r></w:p></w:body></w:document>"#
                )
                .as_bytes(),
            )
            .unwrap();
        writer.finish().unwrap();
    }

    fn test_config(root: &Path) -> PipelineConfig {
        PipelineConfig {
            data_root: root.join("data"),
            image_root: root.join("images"),
            output_root: root.join("vectorstores"),
            retry_base_delay: std::time::Duration::from_millis(1),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn discovery_honors_recursion_subset_and_formats() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let base = dir.path();
        fs::create_dir(base.join("nested"))?;
        fs::write(base.join("a.pdf"), b"%PDF-1.4\n%fake")?;
        fs::write(base.join("b.txt"), b"not supported")?;
        fs::write(base.join("nested").join("c.docx"), b"zip bytes")?;

        let flat = discover_documents(base, false, None);
        assert_eq!(flat.len(), 1);
        assert!(flat[0].ends_with("a.pdf"));

        let deep = discover_documents(base, true, None);
        assert_eq!(deep.len(), 2);

        let subset = vec!["c.docx".to_string()];
        let filtered = discover_documents(base, true, Some(&subset));
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].ends_with("c.docx"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_set_input_returns_the_pinned_report() {
        let dir = tempdir().unwrap();
        let pipeline = Pipeline::new(
            StubOcr,
            CharacterNgramEmbedder::default(),
            None,
            &test_config(dir.path()),
        );

        let report = pipeline.ingest_sets(&[]).await;
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "vectorstore_dir_list": [],
                "summary": {"total": 0, "success": 0, "failed": 0},
                "issues": ["NO_INPUT_DIRECTORIES"],
            })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_documents_do_not_abort_their_siblings() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let docs = dir.path().join("docs");
        fs::create_dir(&docs)?;
        write_docx(&docs.join("good.docx"), "usable body text");
        fs::write(docs.join("broken.pdf"), b"%PDF-1.4\n%broken")?;

        let pipeline = Pipeline::new(
            StubOcr,
            CharacterNgramEmbedder::default(),
            None,
            &test_config(dir.path()),
        );
        let set = DocumentSetSpec {
            id: "batch-records".to_string(),
            references: vec![DocumentReference::Local {
                path: docs.to_string_lossy().to_string(),
            }],
            chunk_size: 200,
            chunk_overlap: 20,
            recursive: false,
            files: None,
        };

        let report = pipeline.ingest_sets(&[set]).await;

        assert_eq!(report.summary.total, 1);
        assert_eq!(report.summary.success, 1);
        assert_eq!(report.summary.failed, 0);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].starts_with("batch-records/broken.pdf:"));

        let path = report.vectorstore_dir_list[0]["batch-records"]
            .as_ref()
            .unwrap();
        let store = VectorStore::open(Path::new(path)).unwrap();
        assert!(store.count().unwrap() >= 1);
        let rows = store.load_rows().unwrap();
        assert!(rows.iter().any(|row| row.text.contains("usable body text")));
        Ok(())
    }

    #[tokio::test]
    async fn build_failure_marks_the_set_failed_but_still_reports() {
        let dir = tempdir().unwrap();
        let pipeline = Pipeline::new(StubOcr, RejectingEmbedder, None, &test_config(dir.path()));
        let set = DocumentSetSpec {
            id: "doomed".to_string(),
            references: Vec::new(),
            chunk_size: 200,
            chunk_overlap: 20,
            recursive: false,
            files: None,
        };

        let report = pipeline.ingest_sets(&[set]).await;

        assert_eq!(report.summary.failed, 1);
        assert!(report.vectorstore_dir_list[0]["doomed"].is_none());
        assert!(report.issues[0].starts_with("doomed:"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extraction_consolidates_page_chunk_annotations() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let scan = dir.path().join("scan.png");
        fs::write(&scan, b"fake image bytes")?;

        let pipeline = Pipeline::new(
            StubOcr,
            CharacterNgramEmbedder::default(),
            None,
            &test_config(dir.path()),
        );

        let result = pipeline
            .extract_document::<Value>(
                &DocumentReference::Local {
                    path: scan.to_string_lossy().to_string(),
                },
                None,
            )
            .await?;

        match result {
            Some(Consolidated::Typed(value)) => {
                assert_eq!(value["items"][0], "from-ocr");
            }
            other => panic!("expected typed consolidation, got degraded/none: {other:?}"),
        }
        Ok(())
    }
}
