//! Durable per-path digest records for change detection across restarts.
//!
//! Shared between the ingestion pipeline (exclusive writers) and the
//! monitor/reconciliation readers through a reader-writer lock. Never
//! consulted on the query path.

use crate::error::EngineResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestRecord {
    /// SHA-256 over the file bytes, lowercase hex.
    pub digest: String,
    pub mtime_ms: i64,
    pub chunk_count: u32,
}

pub struct DigestStore {
    file: PathBuf,
    records: RwLock<HashMap<String, DigestRecord>>,
}

impl DigestStore {
    /// Load `digests.db` from the state dir, starting empty when absent or
    /// unreadable.
    pub fn load(state_dir: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let file = state_dir.join("digests.db");
        let records = if file.exists() {
            match std::fs::read_to_string(&file) {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                    warn!(file = %file.display(), error = %e, "digest store unreadable, starting empty");
                    HashMap::new()
                }),
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "digest store unreadable, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            file,
            records: RwLock::new(records),
        })
    }

    pub async fn get(&self, path: &str) -> Option<DigestRecord> {
        self.records.read().await.get(path).cloned()
    }

    /// Read-only view for reconciliation.
    pub async fn snapshot(&self) -> HashMap<String, DigestRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Insert or update one path's record and persist durably before
    /// returning.
    pub async fn set(&self, path: &str, record: DigestRecord) -> EngineResult<()> {
        let mut records = self.records.write().await;
        records.insert(path.to_string(), record);
        self.persist(&records)
    }

    pub async fn remove(&self, path: &str) -> EngineResult<()> {
        let mut records = self.records.write().await;
        if records.remove(path).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }

    /// Atomic write: temp file then rename, so a crash never leaves a torn
    /// `digests.db`.
    fn persist(&self, records: &HashMap<String, DigestRecord>) -> EngineResult<()> {
        let raw = serde_json::to_string(records)?;
        let tmp = self.file.with_extension("db.tmp");
        std::fs::write(&tmp, &raw)?;
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(digest: &str) -> DigestRecord {
        DigestRecord {
            digest: digest.to_string(),
            mtime_ms: 1_700_000_000_000,
            chunk_count: 3,
        }
    }

    #[tokio::test]
    async fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DigestStore::load(dir.path()).unwrap();
            store.set("a.md", record("abc")).await.unwrap();
            store.set("b.md", record("def")).await.unwrap();
            store.remove("b.md").await.unwrap();
        }
        let store = DigestStore::load(dir.path()).unwrap();
        assert_eq!(store.get("a.md").await, Some(record("abc")));
        assert_eq!(store.get("b.md").await, None);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("digests.db"), "not json").unwrap();
        let store = DigestStore::load(dir.path()).unwrap();
        assert_eq!(store.len().await, 0);
    }
}
