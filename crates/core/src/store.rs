use crate::error::{IngestError, SearchError};
use crate::models::VectorRecord;
use bytemuck::cast_slice;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// One persisted index: a single columnar SQLite file holding
/// `(id, text, embedding, metadata)` records for one document set.
/// Written once at creation, never updated afterwards.
pub struct VectorStore {
    conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredRow {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct ScoredSnippet {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub metadata: Value,
}

impl VectorStore {
    pub fn create(path: &Path) -> Result<Self, IngestError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> Result<Self, SearchError> {
        if !path.is_file() {
            return Err(SearchError::IndexNotFound(path.display().to_string()));
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, records: &[VectorRecord]) -> Result<usize, IngestError> {
        let tx = self.conn.transaction()?;
        for record in records {
            let blob: &[u8] = cast_slice(&record.embedding);
            tx.execute(
                "INSERT INTO records (id, text, embedding, metadata) VALUES (?1, ?2, ?3, ?4)",
                params![record.id, record.text, blob, record.metadata.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn count(&self) -> Result<u64, SearchError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn load_rows(&self) -> Result<Vec<StoredRow>, SearchError> {
        let mut statement = self
            .conn
            .prepare("SELECT id, text, embedding, metadata FROM records")?;
        let mut rows = statement.query([])?;

        let mut loaded = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let text: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            let metadata_raw: String = row.get(3)?;
            let embedding = decode_embedding(&blob)?;
            let metadata = serde_json::from_str(&metadata_raw)
                .map_err(|error| SearchError::CorruptRecord(format!("{id}: {error}")))?;
            loaded.push(StoredRow {
                id,
                text,
                embedding,
                metadata,
            });
        }
        Ok(loaded)
    }
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, SearchError> {
    match bytemuck::try_cast_slice::<u8, f32>(blob) {
        Ok(slice) => Ok(slice.to_vec()),
        Err(_) => {
            if blob.len() % 4 != 0 {
                return Err(SearchError::CorruptRecord(format!(
                    "embedding blob length {} is not a multiple of 4",
                    blob.len()
                )));
            }
            Ok(blob
                .chunks_exact(4)
                .map(|bytes| f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                .collect())
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut a_norm = 0.0f32;
    let mut b_norm = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        a_norm += x * x;
        b_norm += y * y;
    }
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    dot / (a_norm.sqrt() * b_norm.sqrt())
}
