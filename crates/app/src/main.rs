use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use doc_qa_core::{
    discover_document_files, document_id_for, ConversationTurn, Embedder, ExtractiveSynthesizer,
    HashEmbedder, HttpEmbedder, HttpSynthesizer, LocalFileIndex, NoContextPolicy, QdrantIndex,
    RagConfig, RagEngine, SynthesisBackend, Synthesizer, VectorIndex,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Engine = RagEngine<Box<dyn Embedder>, Box<dyn VectorIndex>, Box<dyn Synthesizer>>;

#[derive(Parser)]
#[command(name = "doc-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Local vector index file.
    #[arg(long, default_value = "doc_qa_index.json")]
    index_path: PathBuf,

    /// Conversation history file.
    #[arg(long, default_value = "doc_qa_history.json")]
    history_path: PathBuf,

    /// Qdrant base URL; when set, Qdrant replaces the local file index.
    #[arg(long, env = "DOC_QA_QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Qdrant collection name.
    #[arg(long, default_value = "doc_chunks")]
    qdrant_collection: String,

    /// OpenAI-compatible base URL for answer generation; answers are
    /// extractive (quoted passages) when unset.
    #[arg(long, env = "DOC_QA_LLM_URL")]
    llm_url: Option<String>,

    /// Model name for remote answer generation.
    #[arg(long, default_value = "llama-3.1-8b-instant")]
    llm_model: String,

    /// API key for the remote backends.
    #[arg(long, env = "DOC_QA_API_KEY")]
    api_key: Option<String>,

    /// OpenAI-compatible base URL for embeddings; a local hashing embedder is
    /// used when unset.
    #[arg(long, env = "DOC_QA_EMBEDDING_URL")]
    embedding_url: Option<String>,

    /// Model name for remote embeddings.
    #[arg(long, default_value = "text-embedding-3-small")]
    embedding_model: String,

    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Chunk size in characters.
    #[arg(long, default_value = "512")]
    chunk_size: usize,

    /// Overlap between consecutive chunks, in characters.
    #[arg(long, default_value = "50")]
    chunk_overlap: usize,

    /// Number of chunks retrieved per question.
    #[arg(long, default_value = "5")]
    top_k: usize,

    /// Minimum similarity score for a chunk to count as relevant.
    #[arg(long, default_value = "0.5")]
    relevance_threshold: f64,

    /// Answer from general knowledge when nothing relevant is found, instead
    /// of declining.
    #[arg(long, default_value_t = false)]
    general_knowledge: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a document file, or every supported document under a folder.
    Ingest {
        #[arg(long)]
        path: PathBuf,
    },
    /// Ask a question against the indexed documents.
    Ask {
        #[arg(long)]
        question: String,
        /// Conversation id; follow-up questions in the same conversation see
        /// recent history.
        #[arg(long, default_value = "default")]
        conversation: String,
        /// Restrict retrieval to these document filenames (repeatable).
        #[arg(long)]
        document: Vec<String>,
    },
    /// Ask the same question against two documents and summarize differences.
    Compare {
        #[arg(long)]
        question: String,
        #[arg(long)]
        document_a: String,
        #[arg(long)]
        document_b: String,
    },
    /// Remove a document's chunks from the index.
    Remove {
        #[arg(long)]
        document: String,
    },
    /// Print the stored turns of a conversation.
    History {
        #[arg(long, default_value = "default")]
        conversation: String,
    },
    /// Forget a conversation.
    ClearHistory {
        #[arg(long, default_value = "default")]
        conversation: String,
    },
    /// List indexed documents.
    Documents,
    /// Index-wide chunk and document counts.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = RagConfig {
        chunk_size: cli.chunk_size,
        chunk_overlap: cli.chunk_overlap,
        top_k: cli.top_k,
        relevance_threshold: cli.relevance_threshold,
        embedding_model_version: match &cli.embedding_url {
            Some(_) => cli.embedding_model.clone(),
            None => "char-ngram-v1".to_string(),
        },
        synthesis_backend: match &cli.llm_url {
            Some(_) => SynthesisBackend::Remote,
            None => SynthesisBackend::Local,
        },
        no_context_policy: if cli.general_knowledge {
            NoContextPolicy::GeneralKnowledge
        } else {
            NoContextPolicy::Decline
        },
        ..RagConfig::default()
    };

    let embedder: Box<dyn Embedder> = match &cli.embedding_url {
        Some(url) => Box::new(HttpEmbedder::new(
            url,
            &cli.embedding_model,
            cli.api_key.clone(),
            cli.embedding_dimensions,
        )?),
        None => Box::new(HashEmbedder::new(cli.embedding_dimensions)),
    };

    let index: Box<dyn VectorIndex> = match &cli.qdrant_url {
        Some(url) => {
            let store = QdrantIndex::new(url, &cli.qdrant_collection, embedder.dimensions());
            store.ensure_collection().await?;
            Box::new(store)
        }
        None => Box::new(LocalFileIndex::open(&cli.index_path)?),
    };

    let synthesizer: Box<dyn Synthesizer> = match &cli.llm_url {
        Some(url) => Box::new(HttpSynthesizer::new(url, &cli.llm_model, cli.api_key.clone())?),
        None => Box::new(ExtractiveSynthesizer),
    };

    let engine = RagEngine::new(embedder, index, synthesizer, config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "doc-qa boot"
    );

    match cli.command {
        Command::Ingest { path } => ingest(&engine, &path).await?,
        Command::Ask {
            question,
            conversation,
            document,
        } => {
            let mut history = load_history(&cli.history_path)?;
            if let Some(turns) = history.get(&conversation) {
                engine.restore_history(&conversation, turns.clone()).await;
            }

            let filter: Vec<String> = document.iter().map(|name| document_id_for(name)).collect();
            let filter = if filter.is_empty() {
                None
            } else {
                Some(filter.as_slice())
            };

            let outcome = engine.ask(&question, &conversation, filter).await?;

            println!("{}", outcome.answer);
            if !outcome.citations.is_empty() {
                println!("\nSources:");
                for citation in &outcome.citations {
                    println!(
                        "  - {}, page {} (relevance {:.2})",
                        citation.document, citation.page, citation.score
                    );
                    if let Some(excerpt) = &citation.excerpt {
                        println!("    \"{excerpt}\"");
                    }
                }
            }
            if !outcome.used_context {
                println!("\n(no document context was used for this answer)");
            }

            history.insert(conversation.clone(), engine.history(&conversation).await);
            save_history(&cli.history_path, &history)?;
        }
        Command::Compare {
            question,
            document_a,
            document_b,
        } => {
            let outcome = engine
                .compare(
                    &question,
                    &document_id_for(&document_a),
                    &document_id_for(&document_b),
                )
                .await?;

            for (label, side, name) in [
                ("A", &outcome.side_a, &document_a),
                ("B", &outcome.side_b, &document_b),
            ] {
                match (&side.answer, &side.error) {
                    (Some(answer), _) => println!("[{label}] {name}:\n{answer}\n"),
                    (None, Some(error)) => println!("[{label}] {name}: failed ({error})\n"),
                    (None, None) => println!("[{label}] {name}: no answer\n"),
                }
            }

            println!("Difference: {}", outcome.diff_summary);
            if outcome.partial {
                warn!("comparison is partial: one side failed");
            }
        }
        Command::Remove { document } => {
            let removed = engine.remove_document(&document_id_for(&document)).await?;
            println!("{removed} chunks removed for {document}");
        }
        Command::History { conversation } => {
            let history = load_history(&cli.history_path)?;
            match history.get(&conversation) {
                Some(turns) if !turns.is_empty() => {
                    for turn in turns {
                        println!("[{}] Q: {}", turn.created_at.to_rfc3339(), turn.question);
                        println!("    A: {}", turn.answer);
                    }
                }
                _ => println!("no history for conversation '{conversation}'"),
            }
        }
        Command::ClearHistory { conversation } => {
            let mut history = load_history(&cli.history_path)?;
            history.remove(&conversation);
            save_history(&cli.history_path, &history)?;
            println!("conversation '{conversation}' cleared");
        }
        Command::Documents => {
            let documents = engine.documents().await?;
            if documents.is_empty() {
                println!("no documents indexed");
            }
            for document in documents {
                println!(
                    "{} ({} chunks, id {})",
                    document.document_title, document.chunk_count, document.document_id
                );
            }
        }
        Command::Stats => {
            let stats = engine.stats().await?;
            println!(
                "{} chunks across {} documents",
                stats.chunk_count, stats.document_count
            );
        }
    }

    Ok(())
}

/// Ingest one file, or every supported file under a folder. Folder ingestion
/// is best-effort: a bad file is logged and skipped, the rest proceed.
async fn ingest(engine: &Engine, path: &Path) -> anyhow::Result<()> {
    let files = if path.is_dir() {
        let discovered = discover_document_files(path);
        if discovered.is_empty() {
            println!("no supported documents under {}", path.display());
        }
        discovered
    } else {
        vec![path.to_path_buf()]
    };

    let mut indexed = 0usize;
    let mut skipped = 0usize;

    for file in files {
        let filename = file
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("unreadable file name: {}", file.display()))?
            .to_string();

        let bytes = tokio::fs::read(&file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;

        match engine.ingest(&bytes, &filename).await {
            Ok(summary) => {
                indexed += 1;
                println!("{}: {} chunks indexed", summary.document_title, summary.chunk_count);
                if summary.failed_chunk_count > 0 {
                    warn!(
                        document = %summary.document_title,
                        failed = summary.failed_chunk_count,
                        "some chunks failed to embed"
                    );
                }
            }
            Err(error) => {
                skipped += 1;
                warn!(path = %file.display(), error = %error, "skipped document");
            }
        }
    }

    println!(
        "{indexed} document(s) ingested, {skipped} skipped at {}",
        Utc::now().to_rfc3339()
    );
    Ok(())
}

fn load_history(path: &Path) -> anyhow::Result<HashMap<String, Vec<ConversationTurn>>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)
            .with_context(|| format!("corrupt history file {}", path.display()))?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(error) => Err(error).with_context(|| format!("reading {}", path.display())),
    }
}

fn save_history(path: &Path, history: &HashMap<String, Vec<ConversationTurn>>) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(history)?;
    std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
