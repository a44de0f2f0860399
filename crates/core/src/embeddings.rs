use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(300);

/// Failure classes for one embedding batch. Token-budget rejections get
/// their own variant so the index builder can degrade the batch size
/// instead of retrying blindly.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("batch exceeds the provider token budget: {0}")]
    TokenBudget(String),

    #[error("transient embedding failure: {0}")]
    Transient(String),

    #[error("embedding request rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::Rejected("provider returned no embedding".to_string()))
    }
}

/// Deterministic offline embedder: hashed character trigrams, L2
/// normalized. Used by tests and as the no-credential fallback.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

/// Remote embedding provider speaking the common `{model, input}` batch
/// protocol.
pub struct HttpEmbeddingClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl HttpEmbeddingClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, crate::IngestError> {
        let client = Client::builder().timeout(EMBEDDING_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() || error.is_connect() {
                EmbeddingError::Transient(error.to_string())
            } else {
                EmbeddingError::Rejected(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_rejection(status, &body));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|error| EmbeddingError::Rejected(error.to_string()))?;

        parse_embeddings(&payload, texts.len())
    }
}

fn classify_rejection(status: reqwest::StatusCode, body: &str) -> EmbeddingError {
    let lowered = body.to_lowercase();
    if status.as_u16() == 413
        || (status.is_client_error()
            && (lowered.contains("token") || lowered.contains("context length")))
    {
        return EmbeddingError::TokenBudget(format!("{status}: {body}"));
    }
    if status.is_server_error() {
        return EmbeddingError::Transient(status.to_string());
    }
    EmbeddingError::Rejected(format!("{status}: {body}"))
}

fn parse_embeddings(payload: &Value, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = payload
        .pointer("/data")
        .and_then(Value::as_array)
        .ok_or_else(|| EmbeddingError::Rejected("response has no data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let vector = item
            .pointer("/embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| EmbeddingError::Rejected("response item has no embedding".to_string()))?
            .iter()
            .map(|value| value.as_f64().unwrap_or(0.0) as f32)
            .collect::<Vec<f32>>();
        embeddings.push(vector);
    }

    if embeddings.len() != expected {
        return Err(EmbeddingError::Rejected(format!(
            "expected {expected} embeddings, provider returned {}",
            embeddings.len()
        )));
    }

    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("stability protocol for batch twelve");
        let second = embedder.embed("stability protocol for batch twelve");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("abc");
        assert_eq!(vector.len(), 32);
    }

    #[tokio::test]
    async fn batch_embedding_matches_single_embedding() {
        let embedder = CharacterNgramEmbedder::default();
        let batch = embedder
            .embed_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed("alpha"));
        assert_eq!(batch[1], embedder.embed("beta"));
    }

    #[test]
    fn token_budget_rejections_are_classified() {
        let error = classify_rejection(
            reqwest::StatusCode::BAD_REQUEST,
            "batch exceeds maximum token count",
        );
        assert!(matches!(error, EmbeddingError::TokenBudget(_)));

        let error = classify_rejection(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert!(matches!(error, EmbeddingError::Transient(_)));

        let error = classify_rejection(reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(error, EmbeddingError::Rejected(_)));
    }

    #[test]
    fn embedding_payloads_are_parsed() {
        let payload = serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2]},
                {"embedding": [0.3, 0.4]},
            ]
        });
        let embeddings = parse_embeddings(&payload, 2).unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[1], vec![0.3f32, 0.4f32]);

        assert!(parse_embeddings(&payload, 3).is_err());
        assert!(parse_embeddings(&serde_json::json!({}), 0).is_err());
    }
}
