use crate::error::QueryError;
use crate::models::{DocumentSummary, IndexEntry, IndexStats, RetrievalResult};
use crate::synthesizer::SynthesisRequest;
use async_trait::async_trait;

/// Durable store of (vector, chunk metadata) pairs with nearest-neighbor
/// lookup. Scores are cosine similarity in [0, 1]; results come back sorted
/// descending. An empty index yields an empty result list, never an error.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace entries keyed by chunk id. Atomic per entry: a
    /// failure mid-batch must not corrupt previously committed entries.
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), QueryError>;

    /// Remove every entry belonging to a document. Returns the removed count.
    async fn delete_document(&self, document_id: &str) -> Result<usize, QueryError>;

    /// Top-k nearest neighbors, optionally restricted to a document-id subset.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        document_filter: Option<&[String]>,
    ) -> Result<Vec<RetrievalResult>, QueryError>;

    async fn documents(&self) -> Result<Vec<DocumentSummary>, QueryError>;

    async fn stats(&self) -> Result<IndexStats, QueryError>;
}

#[async_trait]
impl VectorIndex for Box<dyn VectorIndex> {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), QueryError> {
        self.as_ref().upsert(entries).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, QueryError> {
        self.as_ref().delete_document(document_id).await
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        document_filter: Option<&[String]>,
    ) -> Result<Vec<RetrievalResult>, QueryError> {
        self.as_ref().query(vector, k, document_filter).await
    }

    async fn documents(&self) -> Result<Vec<DocumentSummary>, QueryError> {
        self.as_ref().documents().await
    }

    async fn stats(&self) -> Result<IndexStats, QueryError> {
        self.as_ref().stats().await
    }
}

/// Boundary to the external answer-generation service.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, QueryError>;
}

#[async_trait]
impl Synthesizer for Box<dyn Synthesizer> {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, QueryError> {
        self.as_ref().synthesize(request).await
    }
}
