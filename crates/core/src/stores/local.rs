use crate::error::QueryError;
use crate::models::{DocumentSummary, IndexEntry, IndexStats, RetrievalResult};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Durable single-file vector index.
///
/// Entries are keyed by chunk id and persisted as JSON. Every mutation writes
/// the full state to a temp file and renames it over the old one, so a crash
/// mid-write leaves the previously committed state intact. Similarity is
/// cosine, clamped to [0, 1].
pub struct LocalFileIndex {
    path: PathBuf,
    state: RwLock<IndexState>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    entries: BTreeMap<String, IndexEntry>,
}

impl LocalFileIndex {
    /// Open an index file, loading existing entries if the file is present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|error| {
                QueryError::IndexUnavailable(format!("cannot read {}: {error}", path.display()))
            })?;
            serde_json::from_slice(&bytes).map_err(|error| {
                QueryError::IndexUnavailable(format!("corrupt index file: {error}"))
            })?
        } else {
            IndexState::default()
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn persist(&self, state: &IndexState) -> Result<(), QueryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    QueryError::IndexUnavailable(format!(
                        "cannot create {}: {error}",
                        parent.display()
                    ))
                })?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec(state)?;
        std::fs::write(&tmp, bytes).map_err(|error| {
            QueryError::IndexUnavailable(format!("cannot write {}: {error}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|error| {
            QueryError::IndexUnavailable(format!("cannot commit {}: {error}", self.path.display()))
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl VectorIndex for LocalFileIndex {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), QueryError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().await;

        let expected = state
            .entries
            .values()
            .next()
            .map(|entry| entry.vector.len())
            .unwrap_or_else(|| entries[0].vector.len());

        for entry in entries {
            if entry.vector.len() != expected {
                return Err(QueryError::Request(format!(
                    "vector dimension {} does not match index dimension {}",
                    entry.vector.len(),
                    expected
                )));
            }
        }

        for entry in entries {
            state
                .entries
                .insert(entry.chunk.chunk_id.clone(), entry.clone());
        }

        self.persist(&state)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, QueryError> {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.chunk.document_id != document_id);
        let removed = before - state.entries.len();

        if removed > 0 {
            self.persist(&state)?;
        }

        Ok(removed)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        document_filter: Option<&[String]>,
    ) -> Result<Vec<RetrievalResult>, QueryError> {
        let state = self.state.read().await;

        let mut scored: Vec<(f64, &IndexEntry)> = state
            .entries
            .values()
            .filter(|entry| match document_filter {
                Some(ids) => ids.iter().any(|id| *id == entry.chunk.document_id),
                None => true,
            })
            .map(|entry| (cosine_similarity(vector, &entry.vector), entry))
            .collect();

        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        Ok(scored
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(position, (score, entry))| RetrievalResult {
                chunk: entry.chunk.clone(),
                score,
                rank: position + 1,
            })
            .collect())
    }

    async fn documents(&self) -> Result<Vec<DocumentSummary>, QueryError> {
        let state = self.state.read().await;

        let mut summaries: BTreeMap<String, DocumentSummary> = BTreeMap::new();
        for entry in state.entries.values() {
            summaries
                .entry(entry.chunk.document_id.clone())
                .and_modify(|summary| summary.chunk_count += 1)
                .or_insert_with(|| DocumentSummary {
                    document_id: entry.chunk.document_id.clone(),
                    document_title: entry.chunk.document_title.clone(),
                    chunk_count: 1,
                });
        }

        Ok(summaries.into_values().collect())
    }

    async fn stats(&self) -> Result<IndexStats, QueryError> {
        let state = self.state.read().await;
        let document_count = state
            .entries
            .values()
            .map(|entry| entry.chunk.document_id.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .len();

        Ok(IndexStats {
            chunk_count: state.entries.len(),
            document_count,
        })
    }
}

/// Cosine similarity mapped into [0, 1]; negative similarity clamps to 0.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }

    let mut dot = 0f64;
    let mut norm_left = 0f64;
    let mut norm_right = 0f64;
    for (l, r) in left.iter().zip(right.iter()) {
        dot += f64::from(*l) * f64::from(*r);
        norm_left += f64::from(*l) * f64::from(*l);
        norm_right += f64::from(*r) * f64::from(*r);
    }

    if norm_left == 0.0 || norm_right == 0.0 {
        return 0.0;
    }

    (dot / (norm_left.sqrt() * norm_right.sqrt())).clamp(0.0, 1.0)
}
