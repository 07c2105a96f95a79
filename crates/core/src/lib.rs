pub mod chunking;
pub mod comparator;
pub mod context;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod memory;
pub mod models;
pub mod parser;
pub mod retriever;
pub mod retry;
pub mod stores;
pub mod synthesizer;
pub mod traits;

pub use chunking::{chunk_spans, normalize_whitespace, ChunkingConfig};
pub use comparator::{ComparisonOutcome, ComparisonSide};
pub use context::{assemble_context, AssembledContext, ContextBlock};
pub use embeddings::{Embedder, HashEmbedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use engine::RagEngine;
pub use error::{IngestError, QueryError};
pub use ingest::{discover_document_files, document_id_for, prepare_document};
pub use memory::ConversationMemory;
pub use models::{
    AskOutcome, Chunk, Citation, ConversationTurn, DocumentFingerprint, DocumentFormat,
    DocumentSummary, IndexEntry, IndexStats, IngestionSummary, NoContextPolicy, Page, RagConfig,
    RetrievalResult, SynthesisBackend,
};
pub use parser::{detect_format, parse_document};
pub use retriever::{RetrievalOutcome, Retriever};
pub use retry::{with_backoff, RetryPolicy};
pub use stores::{LocalFileIndex, QdrantIndex};
pub use synthesizer::{
    build_prompt, validate_citations, ExtractiveSynthesizer, HttpSynthesizer, SynthesisRequest,
    DECLINE_ANSWER, DEGRADED_ANSWER,
};
pub use traits::{Synthesizer, VectorIndex};
