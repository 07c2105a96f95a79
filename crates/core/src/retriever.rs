use crate::embeddings::Embedder;
use crate::error::QueryError;
use crate::models::RetrievalResult;
use crate::retry::{with_backoff, RetryPolicy};
use crate::traits::VectorIndex;
use std::sync::Arc;

/// Outcome of a retrieval pass. Finding nothing usable is a normal result,
/// not an error; callers decide whether to decline or answer from general
/// knowledge.
#[derive(Debug, Clone)]
pub enum RetrievalOutcome {
    Relevant(Vec<RetrievalResult>),
    NoRelevantContext,
}

impl RetrievalOutcome {
    pub fn results(&self) -> &[RetrievalResult] {
        match self {
            RetrievalOutcome::Relevant(results) => results,
            RetrievalOutcome::NoRelevantContext => &[],
        }
    }
}

/// Embeds a question, runs top-k search, and drops low-confidence matches.
pub struct Retriever<E, I> {
    embedder: Arc<E>,
    index: Arc<I>,
    top_k: usize,
    relevance_threshold: f64,
    retry: RetryPolicy,
}

impl<E, I> Retriever<E, I>
where
    E: Embedder,
    I: VectorIndex,
{
    pub fn new(
        embedder: Arc<E>,
        index: Arc<I>,
        top_k: usize,
        relevance_threshold: f64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            embedder,
            index,
            top_k,
            relevance_threshold,
            retry,
        }
    }

    pub async fn retrieve(
        &self,
        question: &str,
        document_filter: Option<&[String]>,
    ) -> Result<RetrievalOutcome, QueryError> {
        if question.trim().is_empty() {
            return Err(QueryError::Request("question is empty".to_string()));
        }

        let texts = vec![question.to_string()];
        let mut vectors =
            with_backoff(self.retry, || self.embedder.embed_batch(&texts)).await?;
        let query_vector = vectors
            .pop()
            .ok_or_else(|| QueryError::EmbeddingService("empty embedding batch".to_string()))?;

        let hits = self
            .index
            .query(&query_vector, self.top_k, document_filter)
            .await?;

        let relevant: Vec<RetrievalResult> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.relevance_threshold)
            .enumerate()
            .map(|(position, mut hit)| {
                hit.rank = position + 1;
                hit
            })
            .collect();

        if relevant.is_empty() {
            Ok(RetrievalOutcome::NoRelevantContext)
        } else {
            Ok(RetrievalOutcome::Relevant(relevant))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::models::{Chunk, DocumentSummary, IndexEntry, IndexStats};
    use crate::traits::VectorIndex;
    use async_trait::async_trait;

    struct FixedIndex {
        hits: Vec<RetrievalResult>,
    }

    #[async_trait]
    impl VectorIndex for FixedIndex {
        async fn upsert(&self, _entries: &[IndexEntry]) -> Result<(), QueryError> {
            Ok(())
        }

        async fn delete_document(&self, _document_id: &str) -> Result<usize, QueryError> {
            Ok(0)
        }

        async fn query(
            &self,
            _vector: &[f32],
            k: usize,
            _document_filter: Option<&[String]>,
        ) -> Result<Vec<RetrievalResult>, QueryError> {
            Ok(self.hits.iter().take(k).cloned().collect())
        }

        async fn documents(&self) -> Result<Vec<DocumentSummary>, QueryError> {
            Ok(Vec::new())
        }

        async fn stats(&self) -> Result<IndexStats, QueryError> {
            Ok(IndexStats {
                chunk_count: self.hits.len(),
                document_count: 1,
            })
        }
    }

    fn hit(chunk_id: &str, score: f64, rank: usize) -> RetrievalResult {
        RetrievalResult {
            chunk: Chunk {
                chunk_id: chunk_id.to_string(),
                document_id: "doc-1".to_string(),
                document_title: "notes.txt".to_string(),
                page: 1,
                offset_start: 0,
                offset_end: 4,
                chunk_index: rank as u64,
                text: format!("text {chunk_id}"),
            },
            score,
            rank,
        }
    }

    fn retriever(hits: Vec<RetrievalResult>, threshold: f64) -> Retriever<HashEmbedder, FixedIndex> {
        Retriever::new(
            Arc::new(HashEmbedder::new(16)),
            Arc::new(FixedIndex { hits }),
            5,
            threshold,
            RetryPolicy {
                max_attempts: 1,
                base_delay: std::time::Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn empty_index_yields_no_relevant_context_not_error() {
        let retriever = retriever(Vec::new(), 0.5);
        let outcome = retriever.retrieve("anything?", None).await.unwrap();
        assert!(matches!(outcome, RetrievalOutcome::NoRelevantContext));
    }

    #[tokio::test]
    async fn all_hits_below_threshold_yield_no_relevant_context() {
        let retriever = retriever(vec![hit("c1", 0.3, 1), hit("c2", 0.2, 2)], 0.7);
        let outcome = retriever.retrieve("anything?", None).await.unwrap();
        assert!(matches!(outcome, RetrievalOutcome::NoRelevantContext));
    }

    #[tokio::test]
    async fn threshold_filters_and_reranks() {
        let retriever = retriever(
            vec![hit("c1", 0.9, 1), hit("c2", 0.4, 2), hit("c3", 0.8, 3)],
            0.7,
        );
        let outcome = retriever.retrieve("anything?", None).await.unwrap();

        let results = outcome.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.chunk_id, "c1");
        assert_eq!(results[1].chunk.chunk_id, "c3");
        assert_eq!(results[1].rank, 2);
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let retriever = retriever(Vec::new(), 0.5);
        let result = retriever.retrieve("   ", None).await;
        assert!(matches!(result, Err(QueryError::Request(_))));
    }
}
