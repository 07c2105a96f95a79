use crate::chunking::{chunk_page, ChunkingConfig};
use crate::error::IngestError;
use crate::models::{Chunk, DocumentFingerprint, DocumentFormat, Page};
use crate::parser::{detect_format, parse_document};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Stable document identity: the filename alone, so re-ingesting the same
/// file (even with changed content) replaces its previous chunks.
pub fn document_id_for(filename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn build_fingerprint(
    filename: &str,
    format: DocumentFormat,
    bytes: &[u8],
) -> Result<DocumentFingerprint, IngestError> {
    if filename.trim().is_empty() {
        return Err(IngestError::MissingFileName(
            "document needs a filename for identity and citations".to_string(),
        ));
    }

    Ok(DocumentFingerprint {
        document_id: document_id_for(filename),
        document_title: filename.to_string(),
        format,
        checksum: digest_bytes(bytes),
        ingested_at: Utc::now(),
    })
}

/// Parse and chunk a document in one pass: bytes in, provenance-tagged chunks
/// out. Chunk sequence indices run across the whole document in page order.
pub fn prepare_document(
    bytes: &[u8],
    filename: &str,
    format: DocumentFormat,
    config: ChunkingConfig,
) -> Result<(DocumentFingerprint, Vec<Chunk>), IngestError> {
    config.validate()?;

    let fingerprint = build_fingerprint(filename, format, bytes)?;
    let pages = parse_document(bytes, format)?;
    let chunks = chunk_pages(&fingerprint, &pages, config)?;

    Ok((fingerprint, chunks))
}

pub fn chunk_pages(
    fingerprint: &DocumentFingerprint,
    pages: &[Page],
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, IngestError> {
    let mut chunks = Vec::new();
    let mut cursor = 0u64;

    for page in pages {
        let (page_chunks, next_cursor) = chunk_page(fingerprint, page, config, cursor)?;
        cursor = next_cursor;
        chunks.extend(page_chunks);
    }

    Ok(chunks)
}

/// Recursively find ingestable files under a folder, sorted for deterministic
/// ingestion order.
pub fn discover_document_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| detect_format(name).is_ok());

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}
