//! Vector store interface and the bundled flat cosine index.
//!
//! The ANN internals are deliberately behind a trait: the engine only needs
//! CRUD plus filtered query. The in-process implementation keeps chunks in a
//! per-path map under one reader-writer lock, which makes a path rewrite a
//! single atomic swap — a concurrent query sees the old chunk set or the new
//! one, never a mix.

use crate::chunker::ChunkMetadata;
use crate::config::StoreConfig;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Typed scalar/list values usable in metadata predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Str(value.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

/// Predicate grammar: equality, `$in`, `$and`, `$or` on scalar fields and
/// list-contains on list fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataFilter {
    Eq(String, MetadataValue),
    In(String, Vec<MetadataValue>),
    ListContains(String, String),
    And(Vec<MetadataFilter>),
    Or(Vec<MetadataFilter>),
}

impl MetadataFilter {
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        match self {
            MetadataFilter::Eq(field, value) => {
                metadata_field(metadata, field).is_some_and(|mv| value_eq(&mv, value))
            }
            MetadataFilter::In(field, values) => metadata_field(metadata, field)
                .is_some_and(|mv| values.iter().any(|v| value_eq(&mv, v))),
            MetadataFilter::ListContains(field, item) => {
                matches!(metadata_field(metadata, field), Some(MetadataValue::List(list)) if list.iter().any(|v| v == item))
            }
            MetadataFilter::And(filters) => filters.iter().all(|f| f.matches(metadata)),
            MetadataFilter::Or(filters) => filters.iter().any(|f| f.matches(metadata)),
        }
    }
}

fn value_eq(a: &MetadataValue, b: &MetadataValue) -> bool {
    match (a, b) {
        (MetadataValue::Int(x), MetadataValue::Float(y))
        | (MetadataValue::Float(y), MetadataValue::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

/// Resolve a metadata field by its stable name.
pub fn metadata_field(meta: &ChunkMetadata, name: &str) -> Option<MetadataValue> {
    let value = match name {
        "path" => MetadataValue::Str(meta.path.clone()),
        "chunk_index" => MetadataValue::Int(meta.chunk_index as i64),
        "token_count" => MetadataValue::Int(meta.token_count as i64),
        "word_count" => MetadataValue::Int(meta.word_count as i64),
        "heading_path" => MetadataValue::List(meta.heading_path.clone()),
        "heading_depth" => MetadataValue::Int(meta.heading_depth as i64),
        "section_type" => MetadataValue::Str(meta.section_type.to_string()),
        "path_year" => MetadataValue::Str(meta.path_year.clone()),
        "path_month" => MetadataValue::Str(meta.path_month.clone()),
        "path_category" => MetadataValue::Str(meta.path_category.clone()),
        "file_name" => MetadataValue::Str(meta.file_name.clone()),
        "file_type" => MetadataValue::Str(meta.file_type.clone()),
        "file_created" => MetadataValue::Int(meta.file_created.timestamp_millis()),
        "file_modified" => MetadataValue::Int(meta.file_modified.timestamp_millis()),
        "file_size" => MetadataValue::Int(meta.file_size as i64),
        "frontmatter_keys" => MetadataValue::List(meta.frontmatter_keys.clone()),
        "frontmatter_tags" => MetadataValue::List(meta.frontmatter_tags.clone()),
        "content_tags" => MetadataValue::List(meta.content_tags.clone()),
        "chunk_created" => MetadataValue::Int(meta.chunk_created.timestamp_millis()),
        "content_quality_score" => MetadataValue::Float(meta.content_quality_score),
        _ => return None,
    };
    Some(value)
}

#[derive(Debug, Clone)]
pub struct UpsertItem {
    pub key: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone)]
pub struct QueryHit {
    pub key: String,
    /// Cosine distance in [0, 2], ascending in query results.
    pub distance: f32,
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CollectionStats {
    pub count: usize,
    pub size_bytes: u64,
}

/// CRUD + filtered ANN query. Implementations must tolerate a client crash
/// mid-upsert without corrupting previously committed chunks, and must make
/// `replace_path`/`delete_by_path` atomic with respect to concurrent
/// queries.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite chunks by key. Atomic per batch.
    async fn upsert(&self, items: Vec<UpsertItem>) -> EngineResult<()>;

    /// Atomically swap a path's entire chunk set. An empty `items` equals a
    /// delete.
    async fn replace_path(&self, path: &str, items: Vec<UpsertItem>) -> EngineResult<()>;

    /// Remove every chunk whose metadata `path` equals the argument.
    async fn delete_by_path(&self, path: &str) -> EngineResult<()>;

    /// Nearest neighbors by cosine distance, ascending, after applying the
    /// metadata predicate and the case-sensitive substring predicate.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        metadata_filter: Option<&MetadataFilter>,
        text_contains: Option<&str>,
    ) -> EngineResult<Vec<QueryHit>>;

    async fn collection_stats(&self) -> EngineResult<CollectionStats>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    chunk_index: u32,
    key: String,
    vector: Vec<f32>,
    text: String,
    metadata: ChunkMetadata,
}

/// Brute-force cosine index over a per-path map. The HNSW tunables are
/// accepted for interface parity and recorded; a flat scan needs none of
/// them.
pub struct MemoryVectorStore {
    dim: usize,
    #[allow(dead_code)]
    params: StoreConfig,
    inner: RwLock<HashMap<String, Vec<StoredEntry>>>,
}

impl MemoryVectorStore {
    pub fn new(dim: usize, params: StoreConfig) -> Self {
        Self {
            dim,
            params,
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn check_items(&self, items: &[UpsertItem]) -> EngineResult<()> {
        if let Some(bad) = items.iter().find(|i| i.vector.len() != self.dim) {
            return Err(EngineError::InvariantViolation(format!(
                "vector dimension {} for key {}, store expects {}",
                bad.vector.len(),
                bad.key,
                self.dim
            )));
        }
        Ok(())
    }

    fn entries(items: Vec<UpsertItem>) -> Vec<StoredEntry> {
        let mut entries: Vec<StoredEntry> = items
            .into_iter()
            .map(|item| StoredEntry {
                chunk_index: item.metadata.chunk_index,
                key: item.key,
                vector: item.vector,
                text: item.text,
                metadata: item.metadata,
            })
            .collect();
        entries.sort_by_key(|e| e.chunk_index);
        entries
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 2.0)
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, items: Vec<UpsertItem>) -> EngineResult<()> {
        self.check_items(&items)?;
        let mut inner = self.inner.write();
        for item in items {
            let entries = inner.entry(item.metadata.path.clone()).or_default();
            let entry = StoredEntry {
                chunk_index: item.metadata.chunk_index,
                key: item.key,
                vector: item.vector,
                text: item.text,
                metadata: item.metadata,
            };
            match entries.binary_search_by_key(&entry.chunk_index, |e| e.chunk_index) {
                Ok(pos) => entries[pos] = entry,
                Err(pos) => entries.insert(pos, entry),
            }
        }
        Ok(())
    }

    async fn replace_path(&self, path: &str, items: Vec<UpsertItem>) -> EngineResult<()> {
        self.check_items(&items)?;
        let mut inner = self.inner.write();
        if items.is_empty() {
            inner.remove(path);
        } else {
            inner.insert(path.to_string(), Self::entries(items));
        }
        Ok(())
    }

    async fn delete_by_path(&self, path: &str) -> EngineResult<()> {
        self.inner.write().remove(path);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        metadata_filter: Option<&MetadataFilter>,
        text_contains: Option<&str>,
    ) -> EngineResult<Vec<QueryHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != self.dim {
            return Err(EngineError::InvariantViolation(format!(
                "query dimension {} but store expects {}",
                vector.len(),
                self.dim
            )));
        }
        let inner = self.inner.read();
        let mut hits: Vec<QueryHit> = inner
            .values()
            .flatten()
            .filter(|entry| {
                metadata_filter.is_none_or(|f| f.matches(&entry.metadata))
                    && text_contains.is_none_or(|needle| entry.text.contains(needle))
            })
            .map(|entry| QueryHit {
                key: entry.key.clone(),
                distance: cosine_distance(vector, &entry.vector),
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.metadata.path.cmp(&b.metadata.path))
                .then_with(|| a.metadata.chunk_index.cmp(&b.metadata.chunk_index))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn collection_stats(&self) -> EngineResult<CollectionStats> {
        let inner = self.inner.read();
        let mut count = 0usize;
        let mut size_bytes = 0u64;
        for entries in inner.values() {
            count += entries.len();
            for entry in entries {
                size_bytes += entry.text.len() as u64
                    + (entry.vector.len() * std::mem::size_of::<f32>()) as u64;
            }
        }
        Ok(CollectionStats { count, size_bytes })
    }
}
