use crate::error::QueryError;
use crate::models::{Chunk, DocumentSummary, IndexEntry, IndexStats, RetrievalResult};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Remote vector index backed by a Qdrant collection over HTTP.
///
/// Point ids are UUIDs derived from the chunk id, so re-upserting the same
/// chunk replaces its point and ingestion stays idempotent. The collection is
/// created with cosine distance, matching the scoring contract.
pub struct QdrantIndex {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantIndex {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        }
    }

    pub async fn ensure_collection(&self) -> Result<(), QueryError> {
        let response = self
            .client
            .get(format!("{}/collections/{}", self.endpoint, self.collection))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!("{}/collections/{}", self.endpoint, self.collection))
            .json(&json!({
                "vectors": {
                    "size": self.vector_size,
                    "distance": "Cosine",
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::IndexUnavailable(format!(
                "qdrant collection setup failed with {}",
                response.status()
            )));
        }

        Ok(())
    }

    fn point_id(chunk_id: &str) -> String {
        let digest = Sha256::digest(chunk_id.as_bytes());
        Uuid::from_slice(&digest[..16])
            .unwrap_or_else(|_| Uuid::new_v4())
            .to_string()
    }

    fn chunk_from_payload(payload: &Value) -> Chunk {
        let text_field = |name: &str| {
            payload
                .pointer(&format!("/{name}"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let number_field = |name: &str| payload.pointer(&format!("/{name}")).and_then(Value::as_u64);

        Chunk {
            chunk_id: text_field("chunk_id"),
            document_id: text_field("document_id"),
            document_title: text_field("document_title"),
            page: number_field("page").unwrap_or(1) as u32,
            offset_start: number_field("offset_start").unwrap_or(0) as usize,
            offset_end: number_field("offset_end").unwrap_or(0) as usize,
            chunk_index: number_field("chunk_index").unwrap_or(0),
            text: text_field("text"),
        }
    }

    fn document_filter_clause(document_filter: Option<&[String]>) -> Value {
        match document_filter {
            Some(ids) if !ids.is_empty() => json!({
                "must": [{"key": "document_id", "match": {"any": ids}}]
            }),
            _ => Value::Null,
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), QueryError> {
        if entries.is_empty() {
            return Ok(());
        }

        let points = entries
            .iter()
            .map(|entry| {
                if entry.vector.len() != self.vector_size {
                    return Err(QueryError::Request(format!(
                        "vector dimension {} does not match index dimension {}",
                        entry.vector.len(),
                        self.vector_size
                    )));
                }

                Ok(json!({
                    "id": Self::point_id(&entry.chunk.chunk_id),
                    "vector": entry.vector,
                    "payload": {
                        "chunk_id": entry.chunk.chunk_id,
                        "document_id": entry.chunk.document_id,
                        "document_title": entry.chunk.document_title,
                        "page": entry.chunk.page,
                        "offset_start": entry.chunk.offset_start,
                        "offset_end": entry.chunk.offset_end,
                        "chunk_index": entry.chunk.chunk_index,
                        "text": entry.chunk.text,
                    },
                }))
            })
            .collect::<Result<Vec<_>, QueryError>>()?;

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::IndexUnavailable(format!(
                "qdrant upsert failed with {}",
                response.status()
            )));
        }

        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, QueryError> {
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/delete?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({
                "filter": {
                    "must": [{"key": "document_id", "match": {"value": document_id}}]
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::IndexUnavailable(format!(
                "qdrant delete failed with {}",
                response.status()
            )));
        }

        // Qdrant does not report how many points a filter delete removed.
        Ok(0)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        document_filter: Option<&[String]>,
    ) -> Result<Vec<RetrievalResult>, QueryError> {
        if vector.len() != self.vector_size {
            return Err(QueryError::Request(format!(
                "query vector dimension {} does not match index dimension {}",
                vector.len(),
                self.vector_size
            )));
        }

        let mut body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        let filter = Self::document_filter_clause(document_filter);
        if !filter.is_null() {
            body["filter"] = filter;
        }

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.endpoint, self.collection
            ))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::IndexUnavailable(format!(
                "qdrant search failed with {}",
                response.status()
            )));
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits
            .iter()
            .enumerate()
            .map(|(position, hit)| {
                let payload = hit.pointer("/payload").cloned().unwrap_or(Value::Null);
                let score = hit
                    .pointer("/score")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);

                RetrievalResult {
                    chunk: Self::chunk_from_payload(&payload),
                    score,
                    rank: position + 1,
                }
            })
            .collect())
    }

    async fn documents(&self) -> Result<Vec<DocumentSummary>, QueryError> {
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/scroll",
                self.endpoint, self.collection
            ))
            .json(&json!({
                "limit": 10_000,
                "with_payload": ["document_id", "document_title"],
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::IndexUnavailable(format!(
                "qdrant scroll failed with {}",
                response.status()
            )));
        }

        let parsed: Value = response.json().await?;
        let points = parsed
            .pointer("/result/points")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut summaries: BTreeMap<String, DocumentSummary> = BTreeMap::new();
        for point in points {
            let document_id = point
                .pointer("/payload/document_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if document_id.is_empty() {
                continue;
            }
            let document_title = point
                .pointer("/payload/document_title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            summaries
                .entry(document_id.clone())
                .and_modify(|summary| summary.chunk_count += 1)
                .or_insert(DocumentSummary {
                    document_id,
                    document_title,
                    chunk_count: 1,
                });
        }

        Ok(summaries.into_values().collect())
    }

    async fn stats(&self) -> Result<IndexStats, QueryError> {
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/count",
                self.endpoint, self.collection
            ))
            .json(&json!({ "exact": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::IndexUnavailable(format!(
                "qdrant count failed with {}",
                response.status()
            )));
        }

        let parsed: Value = response.json().await?;
        let chunk_count = parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let document_count = self.documents().await?.len();

        Ok(IndexStats {
            chunk_count,
            document_count,
        })
    }
}
