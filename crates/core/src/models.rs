use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Pptx,
    Txt,
    Md,
}

impl DocumentFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "pptx" => Some(DocumentFormat::Pptx),
            "txt" => Some(DocumentFormat::Txt),
            "md" => Some(DocumentFormat::Md),
            _ => None,
        }
    }

    /// Formats that carry their own page (or slide) boundaries. The rest are
    /// indexed as a single page numbered 1.
    pub fn paginated(&self) -> bool {
        matches!(self, DocumentFormat::Pdf | DocumentFormat::Pptx)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Pptx => "pptx",
            DocumentFormat::Txt => "txt",
            DocumentFormat::Md => "md",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub document_title: String,
    pub format: DocumentFormat,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
}

/// One page of extracted, whitespace-normalized text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub page: u32,
    /// Character offsets within the normalized page text.
    pub offset_start: usize,
    pub offset_end: usize,
    /// Position in the document's chunk sequence.
    pub chunk_index: u64,
    pub text: String,
}

/// What the vector index stores: one chunk and its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    /// Cosine similarity, clamped to [0, 1].
    pub score: f64,
    /// 1-based position in the result list.
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub document: String,
    pub page: u32,
    pub score: f64,
    pub excerpt: Option<String>,
}

impl Citation {
    pub fn from_result(result: &RetrievalResult) -> Self {
        let excerpt = if result.chunk.text.chars().count() > 200 {
            let cut: String = result.chunk.text.chars().take(200).collect();
            Some(format!("{cut}..."))
        } else {
            Some(result.chunk.text.clone())
        };

        Self {
            document: result.chunk.document_title.clone(),
            page: result.chunk.page,
            score: result.score,
            excerpt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SynthesisBackend {
    Local,
    Remote,
}

/// What to do when retrieval finds nothing above the relevance threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NoContextPolicy {
    /// Return a fixed "not in your documents" answer without calling the synthesizer.
    Decline,
    /// Ask the synthesizer anyway, without document context.
    GeneralKnowledge,
}

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub relevance_threshold: f64,
    pub max_context_chars: usize,
    pub history_window: usize,
    pub embedding_model_version: String,
    pub synthesis_backend: SynthesisBackend,
    pub no_context_policy: NoContextPolicy,
    /// Concurrent embedding batches during ingestion.
    pub embed_concurrency: usize,
    pub embed_batch_size: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            top_k: 5,
            relevance_threshold: 0.5,
            max_context_chars: 6_000,
            history_window: 3,
            embedding_model_version: "char-ngram-v1".to_string(),
            synthesis_backend: SynthesisBackend::Local,
            no_context_policy: NoContextPolicy::Decline,
            embed_concurrency: 4,
            embed_batch_size: 16,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub document_id: String,
    pub document_title: String,
    pub chunk_count: usize,
    pub failed_chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskOutcome {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub used_context: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub document_title: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexStats {
    pub chunk_count: usize,
    pub document_count: usize,
}
