use crate::error::QueryError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use url::Url;

/// Join a path onto a backend base URL. Bases are commonly written without a
/// trailing slash ("https://api.openai.com/v1"); `Url::join` would drop the
/// last path segment in that case, so one is appended first.
pub(crate) fn join_endpoint(endpoint: &str, path: &str) -> Result<Url, QueryError> {
    let base = if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{endpoint}/")
    };
    Ok(Url::parse(&base)?.join(path)?)
}

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Maps batches of chunk texts to fixed-dimension vectors.
///
/// Implementations must preserve input order and count, and must be
/// deterministic for a given `model_version` so re-ingestion produces
/// identical vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    fn model_version(&self) -> &str;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, QueryError>;
}

#[async_trait]
impl Embedder for Box<dyn Embedder> {
    fn dimensions(&self) -> usize {
        self.as_ref().dimensions()
    }

    fn model_version(&self) -> &str {
        self.as_ref().model_version()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, QueryError> {
        self.as_ref().embed_batch(texts).await
    }
}

/// Local hashing embedder: character trigrams bucketed by FNV-1a, then
/// L2-normalized. No network, fully deterministic, fine for offline use and
/// tests; swap in `HttpEmbedder` for model-backed vectors.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    pub dimensions: usize,
    model_version: String,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            model_version: "char-ngram-v1".to_string(),
        }
    }
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            ..Self::default()
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
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
impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, QueryError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Remote embedder speaking the OpenAI-style `POST /embeddings` protocol.
pub struct HttpEmbedder {
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        dimensions: usize,
    ) -> Result<Self, QueryError> {
        Ok(Self {
            endpoint: join_endpoint(endpoint, "embeddings")?,
            model: model.into(),
            api_key,
            dimensions,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_version(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, QueryError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&json!({
            "model": self.model,
            "input": texts,
        }));

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(QueryError::EmbeddingService(format!(
                "embedding backend returned {}",
                response.status()
            )));
        }

        let payload: Value = response.json().await?;
        let rows = payload
            .pointer("/data")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                QueryError::EmbeddingService("embedding response missing data array".to_string())
            })?;

        let mut vectors = Vec::with_capacity(rows.len());
        for row in rows {
            let values = row
                .pointer("/embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    QueryError::EmbeddingService("embedding row missing vector".to_string())
                })?;

            let vector: Vec<f32> = values
                .iter()
                .filter_map(Value::as_f64)
                .map(|value| value as f32)
                .collect();

            if vector.len() != self.dimensions {
                return Err(QueryError::EmbeddingService(format!(
                    "embedding dimension {} != {}",
                    vector.len(),
                    self.dimensions
                )));
            }

            vectors.push(vector);
        }

        if vectors.len() != texts.len() {
            return Err(QueryError::EmbeddingService(format!(
                "embedding count {} != input count {}",
                vectors.len(),
                texts.len()
            )));
        }

        Ok(vectors)
    }
}
