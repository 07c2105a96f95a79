use crate::chunking::ChunkingConfig;
use crate::comparator::{ComparisonOutcome, ComparisonSide};
use crate::context::{assemble_context, AssembledContext};
use crate::embeddings::Embedder;
use crate::error::{IngestError, QueryError};
use crate::ingest::prepare_document;
use crate::memory::ConversationMemory;
use crate::models::{
    AskOutcome, Chunk, Citation, ConversationTurn, DocumentFormat, DocumentSummary, IndexEntry,
    IndexStats, IngestionSummary, NoContextPolicy, RagConfig,
};
use crate::parser::detect_format;
use crate::retriever::{RetrievalOutcome, Retriever};
use crate::retry::{with_backoff, RetryPolicy};
use crate::synthesizer::{validate_citations, SynthesisRequest, DECLINE_ANSWER, DEGRADED_ANSWER};
use crate::traits::{Synthesizer, VectorIndex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

/// The full ingestion and question-answering pipeline over one vector index.
///
/// The index handle is injected, not owned globally: the hosting process
/// decides where state lives. Embedding and synthesis backends sit behind
/// traits so local and remote deployments share this orchestration.
pub struct RagEngine<E, I, S> {
    embedder: Arc<E>,
    index: Arc<I>,
    synthesizer: Arc<S>,
    config: RagConfig,
    retry: RetryPolicy,
    embed_limit: Arc<Semaphore>,
    // Serializes upsert/delete per document id; different documents proceed
    // in parallel.
    document_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    conversations: Mutex<HashMap<String, ConversationMemory>>,
}

impl<E, I, S> RagEngine<E, I, S>
where
    E: Embedder + 'static,
    I: VectorIndex + 'static,
    S: Synthesizer,
{
    pub fn new(embedder: E, index: I, synthesizer: S, config: RagConfig) -> Self {
        let retry = RetryPolicy::from(&config);
        let embed_limit = Arc::new(Semaphore::new(config.embed_concurrency.max(1)));

        Self {
            embedder: Arc::new(embedder),
            index: Arc::new(index),
            synthesizer: Arc::new(synthesizer),
            config,
            retry,
            embed_limit,
            document_locks: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Ingest one document, detecting its format from the filename extension.
    pub async fn ingest(&self, bytes: &[u8], filename: &str) -> Result<IngestionSummary, IngestError> {
        let format = detect_format(filename)?;
        self.ingest_with_format(bytes, filename, format).await
    }

    /// Parse, chunk, embed, and index one document. Re-ingesting the same
    /// filename deletes the previous chunks first, so the operation is
    /// idempotent. Chunks whose embedding fails after retries are counted in
    /// `failed_chunk_count` instead of aborting the ingestion.
    pub async fn ingest_with_format(
        &self,
        bytes: &[u8],
        filename: &str,
        format: DocumentFormat,
    ) -> Result<IngestionSummary, IngestError> {
        let (fingerprint, chunks) =
            prepare_document(bytes, filename, format, ChunkingConfig::from(&self.config))?;

        let (entries, failed_chunk_count) =
            self.embed_chunks(&chunks).await.map_err(IngestError::Backend)?;

        // A total embedding outage yields nothing to index; leave the
        // document's previously committed entries untouched and report the
        // failure instead.
        if entries.is_empty() && failed_chunk_count > 0 {
            return Ok(IngestionSummary {
                document_id: fingerprint.document_id,
                document_title: fingerprint.document_title,
                chunk_count: 0,
                failed_chunk_count,
            });
        }

        let lock = self.document_lock(&fingerprint.document_id).await;
        let _guard = lock.lock().await;

        self.index
            .delete_document(&fingerprint.document_id)
            .await
            .map_err(IngestError::Backend)?;
        self.index
            .upsert(&entries)
            .await
            .map_err(IngestError::Backend)?;

        Ok(IngestionSummary {
            document_id: fingerprint.document_id,
            document_title: fingerprint.document_title,
            chunk_count: entries.len(),
            failed_chunk_count,
        })
    }

    /// Remove a document's chunks from the index.
    pub async fn remove_document(&self, document_id: &str) -> Result<usize, QueryError> {
        let lock = self.document_lock(document_id).await;
        let _guard = lock.lock().await;
        self.index.delete_document(document_id).await
    }

    /// Answer a question against the indexed documents, updating the
    /// conversation history for follow-up questions.
    pub async fn ask(
        &self,
        question: &str,
        conversation_id: &str,
        document_filter: Option<&[String]>,
    ) -> Result<AskOutcome, QueryError> {
        let outcome = self.retriever().retrieve(question, document_filter).await?;
        let history = self.recent_history(conversation_id).await;

        let (answer, citations, used_context) = match outcome {
            RetrievalOutcome::NoRelevantContext => match self.config.no_context_policy {
                NoContextPolicy::Decline => (DECLINE_ANSWER.to_string(), Vec::new(), false),
                NoContextPolicy::GeneralKnowledge => {
                    let request =
                        SynthesisRequest::new(question, AssembledContext::default(), &history);
                    match self.synthesize(&request).await {
                        Ok(answer) => (answer, Vec::new(), false),
                        Err(error) if error.is_transient() => {
                            (DEGRADED_ANSWER.to_string(), Vec::new(), false)
                        }
                        Err(error) => return Err(error),
                    }
                }
            },
            RetrievalOutcome::Relevant(results) => {
                let context = assemble_context(&results, self.config.max_context_chars);
                let provided = context.citations();
                let request = SynthesisRequest::new(question, context, &history);

                match self.synthesize(&request).await {
                    Ok(raw) => {
                        let (answer, citations) = validate_citations(&raw, &provided);
                        (answer, citations, true)
                    }
                    Err(error) if error.is_transient() => {
                        (DEGRADED_ANSWER.to_string(), Vec::new(), false)
                    }
                    Err(error) => return Err(error),
                }
            }
        };

        self.record_turn(conversation_id, question, &answer, citations.clone())
            .await;

        Ok(AskOutcome {
            answer,
            citations,
            used_context,
        })
    }

    /// Ask the same question against two documents independently. One side
    /// failing (even with `IndexUnavailable`) leaves the other side's result
    /// intact and marks the outcome partial.
    pub async fn compare(
        &self,
        question: &str,
        document_id_a: &str,
        document_id_b: &str,
    ) -> Result<ComparisonOutcome, QueryError> {
        let (side_a, side_b) = tokio::join!(
            self.compare_side(question, document_id_a),
            self.compare_side(question, document_id_b)
        );

        Ok(ComparisonOutcome::new(side_a, side_b))
    }

    pub async fn history(&self, conversation_id: &str) -> Vec<ConversationTurn> {
        let conversations = self.conversations.lock().await;
        conversations
            .get(conversation_id)
            .map(|memory| memory.snapshot())
            .unwrap_or_default()
    }

    /// Seed a conversation from previously persisted turns, replacing any
    /// in-memory state for that id.
    pub async fn restore_history(&self, conversation_id: &str, turns: Vec<ConversationTurn>) {
        let mut conversations = self.conversations.lock().await;
        conversations.insert(
            conversation_id.to_string(),
            ConversationMemory::restore(self.config.history_window, turns),
        );
    }

    pub async fn clear_history(&self, conversation_id: &str) {
        let mut conversations = self.conversations.lock().await;
        if let Some(memory) = conversations.get_mut(conversation_id) {
            memory.clear();
        }
    }

    pub async fn documents(&self) -> Result<Vec<DocumentSummary>, QueryError> {
        self.index.documents().await
    }

    pub async fn stats(&self) -> Result<IndexStats, QueryError> {
        self.index.stats().await
    }

    fn retriever(&self) -> Retriever<E, I> {
        Retriever::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.config.top_k,
            self.config.relevance_threshold,
            self.retry,
        )
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, QueryError> {
        with_backoff(self.retry, || self.synthesizer.synthesize(request)).await
    }

    async fn compare_side(&self, question: &str, document_id: &str) -> ComparisonSide {
        let filter = vec![document_id.to_string()];
        match self.answer_scoped(question, &filter).await {
            Ok((answer, citations)) => ComparisonSide::answered(document_id, answer, citations),
            Err(error) => ComparisonSide::failed(document_id, error.to_string()),
        }
    }

    async fn answer_scoped(
        &self,
        question: &str,
        filter: &[String],
    ) -> Result<(String, Vec<Citation>), QueryError> {
        let outcome = self.retriever().retrieve(question, Some(filter)).await?;

        match outcome {
            RetrievalOutcome::NoRelevantContext => Ok((DECLINE_ANSWER.to_string(), Vec::new())),
            RetrievalOutcome::Relevant(results) => {
                let context = assemble_context(&results, self.config.max_context_chars);
                let provided = context.citations();
                let request = SynthesisRequest::new(question, context, &[]);
                let raw = self.synthesize(&request).await?;
                let (answer, citations) = validate_citations(&raw, &provided);
                Ok((answer, citations))
            }
        }
    }

    /// Embed chunk texts in bounded-concurrency batches, preserving chunk
    /// order. Batches that fail after retries mark their chunks failed and the
    /// rest continue.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<(Vec<IndexEntry>, usize), QueryError> {
        if chunks.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let batch_size = self.config.embed_batch_size.max(1);
        let mut join_set = JoinSet::new();

        for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
            let embedder = Arc::clone(&self.embedder);
            let limit = Arc::clone(&self.embed_limit);
            let retry = self.retry;
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();

            join_set.spawn(async move {
                let _permit = match limit.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            batch_no,
                            Err(QueryError::Request("embedding limiter closed".to_string())),
                        )
                    }
                };
                let result = with_backoff(retry, || embedder.embed_batch(&texts)).await;
                (batch_no, result)
            });
        }

        let mut batch_results: BTreeMap<usize, Result<Vec<Vec<f32>>, QueryError>> = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            let (batch_no, result) = joined
                .map_err(|error| QueryError::Request(format!("embedding task failed: {error}")))?;
            batch_results.insert(batch_no, result);
        }

        let mut entries = Vec::with_capacity(chunks.len());
        let mut failed = 0usize;

        for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
            match batch_results.get(&batch_no) {
                Some(Ok(vectors)) if vectors.len() == batch.len() => {
                    entries.extend(batch.iter().zip(vectors.iter()).map(|(chunk, vector)| {
                        IndexEntry {
                            chunk: chunk.clone(),
                            vector: vector.clone(),
                        }
                    }));
                }
                _ => failed += batch.len(),
            }
        }

        Ok((entries, failed))
    }

    async fn document_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.document_locks.lock().await;
        Arc::clone(
            locks
                .entry(document_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn recent_history(&self, conversation_id: &str) -> Vec<ConversationTurn> {
        let conversations = self.conversations.lock().await;
        conversations
            .get(conversation_id)
            .map(|memory| memory.recent(self.config.history_window))
            .unwrap_or_default()
    }

    async fn record_turn(
        &self,
        conversation_id: &str,
        question: &str,
        answer: &str,
        citations: Vec<Citation>,
    ) {
        let mut conversations = self.conversations.lock().await;
        conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationMemory::new(self.config.history_window))
            .append(question, answer, citations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::models::RetrievalResult;
    use crate::stores::LocalFileIndex;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;

    struct CannedSynthesizer {
        answer: String,
    }

    #[async_trait]
    impl Synthesizer for CannedSynthesizer {
        async fn synthesize(&self, _request: &SynthesisRequest) -> Result<String, QueryError> {
            Ok(self.answer.clone())
        }
    }

    struct DownSynthesizer;

    #[async_trait]
    impl Synthesizer for DownSynthesizer {
        async fn synthesize(&self, _request: &SynthesisRequest) -> Result<String, QueryError> {
            Err(QueryError::SynthesisUnavailable("backend down".to_string()))
        }
    }

    /// Returns fixed hits, and fails with `IndexUnavailable` for one document.
    struct ScriptedIndex {
        hits: Vec<RetrievalResult>,
        failing_document: Option<String>,
    }

    #[async_trait]
    impl VectorIndex for ScriptedIndex {
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
            document_filter: Option<&[String]>,
        ) -> Result<Vec<RetrievalResult>, QueryError> {
            if let (Some(failing), Some(filter)) = (&self.failing_document, document_filter) {
                if filter.iter().any(|id| id == failing) {
                    return Err(QueryError::IndexUnavailable("store offline".to_string()));
                }
            }

            Ok(self
                .hits
                .iter()
                .filter(|hit| match document_filter {
                    Some(ids) => ids.iter().any(|id| *id == hit.chunk.document_id),
                    None => true,
                })
                .take(k)
                .cloned()
                .collect())
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

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        fn model_version(&self) -> &str {
            "broken-v0"
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, QueryError> {
            Err(QueryError::EmbeddingService("always down".to_string()))
        }
    }

    fn fast_config() -> RagConfig {
        RagConfig {
            chunk_size: 64,
            chunk_overlap: 8,
            relevance_threshold: 0.7,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
            ..RagConfig::default()
        }
    }

    fn deadline_hit() -> RetrievalResult {
        RetrievalResult {
            chunk: Chunk {
                chunk_id: "c-deadline".to_string(),
                document_id: "projectx-id".to_string(),
                document_title: "ProjectX.docx".to_string(),
                page: 3,
                offset_start: 0,
                offset_end: 30,
                chunk_index: 0,
                text: "The deadline is March 15, 2024".to_string(),
            },
            score: 0.94,
            rank: 1,
        }
    }

    #[tokio::test]
    async fn reingestion_is_idempotent() {
        let dir = tempdir().unwrap();
        let engine = RagEngine::new(
            HashEmbedder::new(16),
            LocalFileIndex::open(dir.path().join("index.json")).unwrap(),
            CannedSynthesizer {
                answer: "ok".to_string(),
            },
            fast_config(),
        );

        let text = b"Quarterly revenue grew by twelve percent over the prior period, \
                     driven mostly by the services segment and renewals.";
        let first = engine.ingest(text, "report.txt").await.unwrap();
        let second = engine.ingest(text, "report.txt").await.unwrap();

        assert_eq!(first.chunk_count, second.chunk_count);
        assert_eq!(first.failed_chunk_count, 0);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.chunk_count, first.chunk_count);
        assert_eq!(stats.document_count, 1);
    }

    #[tokio::test]
    async fn text_of_three_exact_chunk_sizes_yields_three_chunks() {
        let dir = tempdir().unwrap();
        let mut config = fast_config();
        config.chunk_size = 20;
        config.chunk_overlap = 0;

        let engine = RagEngine::new(
            HashEmbedder::new(16),
            LocalFileIndex::open(dir.path().join("index.json")).unwrap(),
            CannedSynthesizer {
                answer: "ok".to_string(),
            },
            config,
        );

        // Single-page txt whose normalized text is exactly 3 * chunk_size.
        let page: String = "abcdefghijklmnopqrst".repeat(3);
        let summary = engine.ingest(page.as_bytes(), "doc1.txt").await.unwrap();

        assert_eq!(summary.chunk_count, 3);
        assert_eq!(summary.failed_chunk_count, 0);
    }

    #[tokio::test]
    async fn ask_with_empty_index_declines_without_error() {
        let dir = tempdir().unwrap();
        let engine = RagEngine::new(
            HashEmbedder::new(16),
            LocalFileIndex::open(dir.path().join("index.json")).unwrap(),
            CannedSynthesizer {
                answer: "should never be called".to_string(),
            },
            fast_config(),
        );

        let outcome = engine.ask("What is the plan?", "session-1", None).await.unwrap();

        assert_eq!(outcome.answer, DECLINE_ANSWER);
        assert!(!outcome.used_context);
        assert!(outcome.citations.is_empty());
    }

    #[tokio::test]
    async fn relevant_hit_produces_cited_answer() {
        let engine = RagEngine::new(
            HashEmbedder::new(16),
            ScriptedIndex {
                hits: vec![deadline_hit()],
                failing_document: None,
            },
            CannedSynthesizer {
                answer: "The deadline is March 15, 2024 [Source: ProjectX.docx, Page 3]."
                    .to_string(),
            },
            fast_config(),
        );

        let outcome = engine
            .ask("What is the deadline?", "session-1", None)
            .await
            .unwrap();

        assert!(outcome.used_context);
        assert_eq!(outcome.citations.len(), 1);
        assert_eq!(outcome.citations[0].document, "ProjectX.docx");
        assert_eq!(outcome.citations[0].page, 3);
        assert!((outcome.citations[0].score - 0.94).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hallucinated_citations_never_reach_the_caller() {
        let engine = RagEngine::new(
            HashEmbedder::new(16),
            ScriptedIndex {
                hits: vec![deadline_hit()],
                failing_document: None,
            },
            CannedSynthesizer {
                answer: "March 15 [Source: ProjectX.docx, Page 3] but also \
                         [Source: Fabricated.pdf, Page 12]."
                    .to_string(),
            },
            fast_config(),
        );

        let outcome = engine
            .ask("What is the deadline?", "session-1", None)
            .await
            .unwrap();

        assert!(!outcome.answer.contains("Fabricated.pdf"));
        assert!(outcome
            .citations
            .iter()
            .all(|citation| citation.document == "ProjectX.docx"));
    }

    #[tokio::test]
    async fn exhausted_synthesis_retries_degrade_instead_of_crashing() {
        let engine = RagEngine::new(
            HashEmbedder::new(16),
            ScriptedIndex {
                hits: vec![deadline_hit()],
                failing_document: None,
            },
            DownSynthesizer,
            fast_config(),
        );

        let outcome = engine
            .ask("What is the deadline?", "session-1", None)
            .await
            .unwrap();

        assert_eq!(outcome.answer, DEGRADED_ANSWER);
        assert!(!outcome.used_context);
    }

    #[tokio::test]
    async fn conversation_history_accumulates_and_clears() {
        let engine = RagEngine::new(
            HashEmbedder::new(16),
            ScriptedIndex {
                hits: vec![deadline_hit()],
                failing_document: None,
            },
            CannedSynthesizer {
                answer: "An answer.".to_string(),
            },
            fast_config(),
        );

        engine.ask("First question?", "session-1", None).await.unwrap();
        engine.ask("Second question?", "session-1", None).await.unwrap();

        let history = engine.history("session-1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].question, "First question?");
        assert!(engine.history("other-session").await.is_empty());

        engine.clear_history("session-1").await;
        assert!(engine.history("session-1").await.is_empty());
    }

    #[tokio::test]
    async fn comparison_survives_one_failing_side() {
        let engine = RagEngine::new(
            HashEmbedder::new(16),
            ScriptedIndex {
                hits: vec![deadline_hit()],
                failing_document: Some("doc-b".to_string()),
            },
            CannedSynthesizer {
                answer: "Side answer [Source: ProjectX.docx, Page 3].".to_string(),
            },
            fast_config(),
        );

        let outcome = engine
            .compare("What is the deadline?", "projectx-id", "doc-b")
            .await
            .unwrap();

        assert!(outcome.partial);
        assert!(outcome.side_a.answer.is_some());
        assert!(outcome.side_b.answer.is_none());
        assert!(outcome
            .side_b
            .error
            .as_deref()
            .unwrap()
            .contains("unavailable"));
    }

    #[tokio::test]
    async fn failed_reingestion_keeps_previously_committed_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        let text = b"Quarterly revenue grew by twelve percent over the prior period.";

        let engine = RagEngine::new(
            HashEmbedder::new(4),
            LocalFileIndex::open(&path).unwrap(),
            CannedSynthesizer {
                answer: "ok".to_string(),
            },
            fast_config(),
        );
        let committed = engine.ingest(text, "report.txt").await.unwrap().chunk_count;
        assert!(committed > 0);
        drop(engine);

        // Same document again, with the embedding backend down.
        let engine = RagEngine::new(
            BrokenEmbedder,
            LocalFileIndex::open(&path).unwrap(),
            CannedSynthesizer {
                answer: "ok".to_string(),
            },
            fast_config(),
        );
        let summary = engine.ingest(text, "report.txt").await.unwrap();
        assert_eq!(summary.chunk_count, 0);
        assert!(summary.failed_chunk_count > 0);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.chunk_count, committed);
    }

    #[tokio::test]
    async fn failed_embeddings_are_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let engine = RagEngine::new(
            BrokenEmbedder,
            LocalFileIndex::open(dir.path().join("index.json")).unwrap(),
            CannedSynthesizer {
                answer: "ok".to_string(),
            },
            fast_config(),
        );

        let summary = engine
            .ingest(b"Some content that will never get embedded properly.", "doomed.txt")
            .await
            .unwrap();

        assert_eq!(summary.chunk_count, 0);
        assert!(summary.failed_chunk_count > 0);
    }
}
