use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt document: {0}")]
    CorruptDocument(String),

    #[error("no extractable text: {0}")]
    EmptyDocument(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error(transparent)]
    Backend(#[from] QueryError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    #[error("synthesis backend unavailable: {0}")]
    SynthesisUnavailable(String),

    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Request(String),
}

impl QueryError {
    /// True when a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueryError::EmbeddingService(_)
                | QueryError::SynthesisUnavailable(_)
                | QueryError::Http(_)
        )
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
