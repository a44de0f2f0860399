use clap::{Parser, Subcommand};
use docpipe_core::{
    answer_index_query, CharacterNgramEmbedder, Consolidated, DocumentReference, DocumentSetSpec,
    EmbeddingProvider, HttpEmbeddingClient, HttpOcrClient, Pipeline, PipelineConfig,
    RemoteStoreClient, DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docpipe", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OCR provider endpoint
    #[arg(long, env = "DOCPIPE_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    /// OCR provider credential
    #[arg(long, env = "DOCPIPE_OCR_API_KEY")]
    ocr_api_key: Option<String>,

    /// Embedding provider endpoint; omit to use the offline embedder
    #[arg(long, env = "DOCPIPE_EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    /// Embedding provider credential
    #[arg(long, env = "DOCPIPE_EMBEDDING_API_KEY")]
    embedding_api_key: Option<String>,

    /// Embedding model name
    #[arg(long, env = "DOCPIPE_EMBEDDING_MODEL")]
    embedding_model: Option<String>,

    /// Embedding vector width
    #[arg(long, env = "DOCPIPE_EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Remote document store content API base
    #[arg(long, env = "DOCPIPE_REMOTE_API_BASE")]
    remote_api_base: Option<String>,

    /// Remote document store bearer token
    #[arg(long, env = "DOCPIPE_REMOTE_TOKEN")]
    remote_token: Option<String>,

    /// Directory persisted indexes are written under
    #[arg(long, env = "DOCPIPE_OUTPUT_ROOT")]
    output_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a folder of documents into one persisted vector index.
    Ingest {
        /// Folder containing the document set.
        #[arg(long)]
        folder: String,
        /// Set id; defaults to the folder name.
        #[arg(long)]
        set_id: Option<String>,
        /// Recurse into subfolders.
        #[arg(long, default_value_t = false)]
        recursive: bool,
        #[arg(long, default_value = "1200")]
        chunk_size: usize,
        #[arg(long, default_value = "120")]
        chunk_overlap: usize,
        /// Restrict ingestion to these file names (repeatable).
        #[arg(long)]
        file: Vec<String>,
    },
    /// Query one persisted index with adaptive retrieval.
    Search {
        #[arg(long)]
        index: PathBuf,
        #[arg(long)]
        query: String,
    },
    /// Extract one document and print the consolidated annotation.
    Extract {
        #[arg(long)]
        file: String,
        /// Path to a JSON schema hint forwarded to the OCR provider.
        #[arg(long)]
        schema: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = merged_config(&cli);

    match &config.embedding_endpoint {
        Some(endpoint) => {
            let embedder = HttpEmbeddingClient::new(
                endpoint.clone(),
                config.embedding_api_key.clone(),
                config.embedding_model.clone(),
                cli.embedding_dimensions,
            )?;
            run(cli, config, embedder).await
        }
        None => {
            info!("no embedding endpoint configured, using the offline embedder");
            let embedder = CharacterNgramEmbedder {
                dimensions: cli.embedding_dimensions,
            };
            run(cli, config, embedder).await
        }
    }
}

fn merged_config(cli: &Cli) -> PipelineConfig {
    let mut config = PipelineConfig::from_env();
    if cli.ocr_endpoint.is_some() {
        config.ocr_endpoint = cli.ocr_endpoint.clone();
    }
    if cli.ocr_api_key.is_some() {
        config.ocr_api_key = cli.ocr_api_key.clone();
    }
    if cli.embedding_endpoint.is_some() {
        config.embedding_endpoint = cli.embedding_endpoint.clone();
    }
    if cli.embedding_api_key.is_some() {
        config.embedding_api_key = cli.embedding_api_key.clone();
    }
    if let Some(model) = &cli.embedding_model {
        config.embedding_model = model.clone();
    }
    if cli.remote_api_base.is_some() {
        config.remote_api_base = cli.remote_api_base.clone();
    }
    if cli.remote_token.is_some() {
        config.remote_token = cli.remote_token.clone();
    }
    if let Some(output_root) = &cli.output_root {
        config.output_root = output_root.clone();
    }
    config
}

async fn run<E: EmbeddingProvider>(
    cli: Cli,
    config: PipelineConfig,
    embedder: E,
) -> anyhow::Result<()> {
    match cli.command {
        Command::Ingest {
            folder,
            set_id,
            recursive,
            chunk_size,
            chunk_overlap,
            file,
        } => {
            let pipeline = build_pipeline(&config, embedder)?;
            let set = DocumentSetSpec {
                id: set_id.unwrap_or_else(|| folder_name(&folder)),
                references: vec![DocumentReference::Local {
                    path: folder.clone(),
                }],
                chunk_size,
                chunk_overlap,
                recursive,
                files: if file.is_empty() { None } else { Some(file) },
            };

            info!(folder = %folder, set = %set.id, "ingesting document set");
            let report = pipeline.ingest_sets(&[set]).await;

            for issue in &report.issues {
                warn!(%issue, "ingestion issue");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Search { index, query } => {
            let answer = answer_index_query(&index, &query, &embedder).await?;
            println!("{answer}");
        }
        Command::Extract { file, schema } => {
            let pipeline = build_pipeline(&config, embedder)?;
            let schema_value = match schema {
                Some(path) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
                None => None,
            };

            let result = pipeline
                .extract_document::<serde_json::Value>(
                    &DocumentReference::Local { path: file },
                    schema_value.as_ref(),
                )
                .await?;

            match result {
                Some(Consolidated::Typed(value)) => {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                Some(Consolidated::Degraded(value)) => {
                    warn!("consolidated extraction did not validate against the schema");
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                None => println!("null"),
            }
        }
    }

    Ok(())
}

fn build_pipeline<E: EmbeddingProvider>(
    config: &PipelineConfig,
    embedder: E,
) -> anyhow::Result<Pipeline<HttpOcrClient, E>> {
    let ocr_endpoint = config.require_ocr_endpoint()?.to_string();
    let ocr = HttpOcrClient::new(ocr_endpoint, config.ocr_api_key.clone())?;

    let remote = match &config.remote_api_base {
        Some(base) => Some(RemoteStoreClient::new(
            base.clone(),
            config.remote_token.clone(),
        )?),
        None => None,
    };

    Ok(Pipeline::new(ocr, embedder, remote, config))
}

fn folder_name(folder: &str) -> String {
    Path::new(folder)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("document-set")
        .to_string()
}
