use crate::error::IngestError;
use crate::models::{Chunk, DocumentFingerprint, Page, RagConfig};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl From<&RagConfig> for ChunkingConfig {
    fn from(value: &RagConfig) -> Self {
        Self {
            chunk_size: value.chunk_size,
            overlap: value.chunk_overlap,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Character-offset windows over a text of `len` characters.
///
/// Advances by `chunk_size - overlap` per step, always emits the trailing
/// partial window, and emits exactly one window when `len <= chunk_size`.
/// The iterator is cheap to rebuild, so chunking can restart from scratch.
#[derive(Debug, Clone)]
pub struct ChunkSpans {
    len: usize,
    config: ChunkingConfig,
    cursor: usize,
    done: bool,
}

pub fn chunk_spans(len: usize, config: ChunkingConfig) -> ChunkSpans {
    ChunkSpans {
        len,
        config,
        cursor: 0,
        done: len == 0,
    }
}

impl Iterator for ChunkSpans {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let start = self.cursor;
        let end = (start + self.config.chunk_size).min(self.len);

        if end == self.len {
            self.done = true;
        } else {
            self.cursor = start + self.config.stride();
        }

        Some((start, end))
    }
}

/// Chunk one page into overlapping windows, carrying page and offset
/// provenance. `next_index` is the document-wide sequence cursor; the updated
/// cursor is returned alongside the chunks.
pub fn chunk_page(
    document: &DocumentFingerprint,
    page: &Page,
    config: ChunkingConfig,
    next_index: u64,
) -> Result<(Vec<Chunk>, u64), IngestError> {
    config.validate()?;

    let chars: Vec<char> = page.text.chars().collect();
    let mut chunks = Vec::new();
    let mut cursor = next_index;

    for (start, end) in chunk_spans(chars.len(), config) {
        let text: String = chars[start..end].iter().collect();
        let chunk_id = make_chunk_id(&document.document_id, page.number, cursor, &text);

        chunks.push(Chunk {
            chunk_id,
            document_id: document.document_id.clone(),
            document_title: document.document_title.clone(),
            page: page.number,
            offset_start: start,
            offset_end: end,
            chunk_index: cursor,
            text,
        });

        cursor = cursor.saturating_add(1);
    }

    Ok((chunks, cursor))
}

fn make_chunk_id(document_id: &str, page: u32, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentFormat;

    fn fingerprint() -> DocumentFingerprint {
        DocumentFingerprint {
            document_id: "doc-1".to_string(),
            document_title: "test.txt".to_string(),
            format: DocumentFormat::Txt,
            checksum: "checksum".to_string(),
            ingested_at: chrono::Utc::now(),
        }
    }

    fn page(text: &str) -> Page {
        Page {
            number: 1,
            text: text.to_string(),
        }
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        assert_eq!(normalize_whitespace(input), "A lot of spacing");
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let config = ChunkingConfig {
            chunk_size: 10,
            overlap: 10,
        };
        let result = chunk_page(&fingerprint(), &page("some text"), config, 0);
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = ChunkingConfig {
            chunk_size: 0,
            overlap: 0,
        };
        assert!(matches!(
            config.validate(),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }

    #[test]
    fn short_page_yields_single_full_chunk() {
        let config = ChunkingConfig {
            chunk_size: 100,
            overlap: 10,
        };
        let (chunks, next) = chunk_page(&fingerprint(), &page("short text"), config, 0).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short text");
        assert_eq!(chunks[0].offset_start, 0);
        assert_eq!(chunks[0].offset_end, 10);
        assert_eq!(next, 1);
    }

    #[test]
    fn page_of_exactly_chunk_size_yields_one_unmodified_chunk() {
        let text: String = std::iter::repeat('x').take(64).collect();
        let config = ChunkingConfig {
            chunk_size: 64,
            overlap: 0,
        };
        let (chunks, _) = chunk_page(&fingerprint(), &page(&text), config, 5).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].chunk_index, 5);
    }

    #[test]
    fn trailing_partial_chunk_is_emitted() {
        let text = "abcdefghij"; // 10 chars
        let config = ChunkingConfig {
            chunk_size: 4,
            overlap: 0,
        };
        let (chunks, _) = chunk_page(&fingerprint(), &page(text), config, 0).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].text, "ij");
        assert_eq!(chunks[2].offset_start, 8);
        assert_eq!(chunks[2].offset_end, 10);
    }

    #[test]
    fn overlap_removal_reconstructs_the_page_exactly() {
        let text = "The quick brown fox jumps over the lazy dog near the river bank";
        let config = ChunkingConfig {
            chunk_size: 16,
            overlap: 4,
        };
        let (chunks, _) = chunk_page(&fingerprint(), &page(text), config, 0).unwrap();

        let mut rebuilt = String::new();
        for chunk in &chunks {
            let skip = chunk.offset_start.min(rebuilt.chars().count());
            let fresh = rebuilt.chars().count() - skip;
            rebuilt.extend(chunk.text.chars().skip(fresh));
        }

        assert_eq!(rebuilt, text);
    }

    #[test]
    fn spans_cover_text_without_gaps() {
        let config = ChunkingConfig {
            chunk_size: 7,
            overlap: 2,
        };
        let spans: Vec<_> = chunk_spans(23, config).collect();

        assert_eq!(spans.first().map(|s| s.0), Some(0));
        assert_eq!(spans.last().map(|s| s.1), Some(23));
        for pair in spans.windows(2) {
            assert!(pair[1].0 < pair[0].1, "adjacent spans must touch or overlap");
        }
    }

    #[test]
    fn chunk_ids_are_deterministic() {
        let config = ChunkingConfig {
            chunk_size: 32,
            overlap: 0,
        };
        let (first, _) = chunk_page(&fingerprint(), &page("same text"), config, 0).unwrap();
        let (second, _) = chunk_page(&fingerprint(), &page("same text"), config, 0).unwrap();
        assert_eq!(first[0].chunk_id, second[0].chunk_id);
    }
}
