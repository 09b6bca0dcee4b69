//! Vault access: enumeration, reads, frontmatter and structural stats.

use crate::chunker::count_tokens;
use crate::error::{EngineError, EngineResult};
use crate::metrics::{MetricEvent, Metrics};
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

/// Read retry policy for transient filesystem failures.
const READ_ATTEMPTS: u32 = 3;
const READ_BACKOFF_MS: u64 = 50;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\s(\[])#([A-Za-z][A-Za-z0-9_/-]*)").unwrap());
static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.+?)\s*$").unwrap());
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}$").unwrap());
static YEAR_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());

/// Frontmatter values are a sum of scalar/list/map, never arbitrary YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrontmatterValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<FrontmatterValue>),
    Map(BTreeMap<String, FrontmatterValue>),
}

impl FrontmatterValue {
    fn from_yaml(value: serde_yaml::Value) -> Option<Self> {
        match value {
            serde_yaml::Value::Null => None,
            serde_yaml::Value::Bool(b) => Some(FrontmatterValue::Bool(b)),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(FrontmatterValue::Integer(i))
                } else {
                    n.as_f64().map(FrontmatterValue::Float)
                }
            }
            serde_yaml::Value::String(s) => Some(FrontmatterValue::String(s)),
            serde_yaml::Value::Sequence(seq) => Some(FrontmatterValue::List(
                seq.into_iter().filter_map(Self::from_yaml).collect(),
            )),
            serde_yaml::Value::Mapping(map) => Some(FrontmatterValue::Map(
                map.into_iter()
                    .filter_map(|(k, v)| {
                        let key = k.as_str()?.to_string();
                        Some((key, Self::from_yaml(v)?))
                    })
                    .collect(),
            )),
            serde_yaml::Value::Tagged(tagged) => Self::from_yaml(tagged.value),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FrontmatterValue::String(s) => Some(s),
            _ => None,
        }
    }
}

pub type Frontmatter = BTreeMap<String, FrontmatterValue>;

/// Lightweight listing entry from `enumerate`.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Structural stats extracted on read.
#[derive(Debug, Clone, Default)]
pub struct DocumentStats {
    pub headings: Vec<String>,
    pub word_count: usize,
    pub token_count: usize,
    pub content_tags: Vec<String>,
}

/// Metadata parsed from the vault-relative path segments.
#[derive(Debug, Clone, Default)]
pub struct PathMeta {
    pub year: String,
    pub month: String,
    pub category: String,
}

#[derive(Debug, Clone)]
pub struct Document {
    /// Vault-relative path with `/` separators; the document's unique key.
    pub path: String,
    /// Body text with frontmatter stripped.
    pub body: String,
    pub frontmatter: Frontmatter,
    /// SHA-256 over the raw bytes, lowercase hex.
    pub digest: String,
    pub size: u64,
    pub file_created: DateTime<Utc>,
    pub file_modified: DateTime<Utc>,
    pub stats: DocumentStats,
    pub path_meta: PathMeta,
}

impl Document {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn file_type(&self) -> &str {
        self.file_name().rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }

    /// Frontmatter `tags:` entry flattened to strings.
    pub fn frontmatter_tags(&self) -> Vec<String> {
        match self.frontmatter.get("tags") {
            Some(FrontmatterValue::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.trim_start_matches('#').to_string()))
                .collect(),
            Some(FrontmatterValue::String(s)) => s
                .split(',')
                .map(|t| t.trim().trim_start_matches('#').to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}

pub struct VaultClient {
    root: PathBuf,
    extensions: Vec<String>,
    metrics: Arc<Metrics>,
}

impl VaultClient {
    pub fn new(
        root: impl Into<PathBuf>,
        extensions: Vec<String>,
        metrics: Arc<Metrics>,
    ) -> EngineResult<Self> {
        let root = root.into();
        let root = dunce::canonicalize(&root)
            .map_err(|_| EngineError::NotFound(format!("vault root: {}", root.display())))?;
        let extensions = extensions
            .into_iter()
            .map(|e| {
                let e = e.to_lowercase();
                if e.starts_with('.') { e } else { format!(".{e}") }
            })
            .collect();
        Ok(Self { root, extensions, metrics })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn matches_extension(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// Vault-relative path with `/` separators, or `None` when the path
    /// falls outside the root.
    pub fn relativize(&self, abs: &Path) -> Option<String> {
        abs.strip_prefix(&self.root)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }

    /// Enumerate recognized files, ordered by path. Hidden entries (the
    /// vault's own configuration directories) are skipped; gitignore
    /// semantics do not apply to a vault.
    pub fn enumerate(&self) -> EngineResult<Vec<DocumentMeta>> {
        let mut entries: Vec<DocumentMeta> = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .build()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .filter(|entry| self.matches_extension(entry.path()))
            .filter_map(|entry| {
                let path = self.relativize(entry.path())?;
                let meta = entry.metadata().ok()?;
                Some(DocumentMeta {
                    path,
                    size: meta.len(),
                    modified: meta.modified().ok().map(DateTime::from).unwrap_or_else(Utc::now),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Read and parse one document. Transient failures are retried with
    /// exponential backoff; a vanished file surfaces as `NotFound`.
    pub async fn read(&self, rel_path: &str) -> EngineResult<Document> {
        let abs = self.root.join(rel_path);
        let bytes = self.read_bytes(&abs, rel_path).await?;
        let meta = match tokio::fs::metadata(&abs).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(rel_path.to_string()));
            }
            Err(e) => return Err(EngineError::TransientIo(format!("{rel_path}: {e}"))),
        };

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = format!("{:x}", hasher.finalize());

        // Invalid UTF-8 degrades lossily rather than failing ingestion.
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let (frontmatter_raw, body) = split_frontmatter(&content);
        let frontmatter = match frontmatter_raw {
            Some(raw) => self.parse_frontmatter(rel_path, raw),
            None => Frontmatter::new(),
        };

        let file_modified: DateTime<Utc> =
            meta.modified().ok().map(DateTime::from).unwrap_or_else(Utc::now);
        let file_created: DateTime<Utc> =
            meta.created().ok().map(DateTime::from).unwrap_or(file_modified);

        Ok(Document {
            path: rel_path.to_string(),
            stats: document_stats(body),
            body: body.to_string(),
            frontmatter,
            digest,
            size: meta.len(),
            file_created,
            file_modified,
            path_meta: parse_path_meta(rel_path),
        })
    }

    async fn read_bytes(&self, abs: &Path, rel_path: &str) -> EngineResult<Vec<u8>> {
        let mut attempt = 0u32;
        loop {
            match tokio::fs::read(abs).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(EngineError::NotFound(rel_path.to_string()));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= READ_ATTEMPTS {
                        return Err(EngineError::TransientIo(format!("{rel_path}: {e}")));
                    }
                    let backoff = READ_BACKOFF_MS * 2u64.pow(attempt - 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    /// YAML parse failure degrades to an empty map; the document is still
    /// ingested.
    fn parse_frontmatter(&self, rel_path: &str, raw: &str) -> Frontmatter {
        match serde_yaml::from_str::<serde_yaml::Value>(raw) {
            Ok(serde_yaml::Value::Mapping(map)) => map
                .into_iter()
                .filter_map(|(k, v)| {
                    let key = k.as_str()?.to_string();
                    Some((key, FrontmatterValue::from_yaml(v)?))
                })
                .collect(),
            Ok(_) => Frontmatter::new(),
            Err(e) => {
                warn!(path = %rel_path, error = %e, "frontmatter parse failed, ingesting without it");
                self.metrics.counter("vault.frontmatter_parse_errors", 1);
                self.metrics.record(
                    MetricEvent::new("vault", "frontmatter_parse_error")
                        .path(rel_path)
                        .error(e.to_string()),
                );
                Frontmatter::new()
            }
        }
    }
}

/// Split a leading `---` fence from the body. Returns `(frontmatter, body)`;
/// an unterminated fence is treated as body text.
pub fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let Some(after) = content.strip_prefix("---\n") else {
        return (None, content);
    };
    for (idx, _) in after.match_indices("\n---") {
        let fence_end = idx + "\n---".len();
        let tail = &after[fence_end..];
        if tail.is_empty() {
            return (Some(&after[..idx]), "");
        }
        if let Some(body) = tail.strip_prefix('\n') {
            return (Some(&after[..idx]), body);
        }
    }
    (None, content)
}

fn document_stats(body: &str) -> DocumentStats {
    let headings = HEADING_RE
        .captures_iter(body)
        .map(|cap| cap[2].to_string())
        .collect();
    let mut content_tags: Vec<String> = Vec::new();
    for cap in TAG_RE.captures_iter(body) {
        let tag = cap[1].to_string();
        if !content_tags.contains(&tag) {
            content_tags.push(tag);
        }
    }
    DocumentStats {
        headings,
        word_count: body.split_whitespace().count(),
        token_count: count_tokens(body),
        content_tags,
    }
}

/// `YYYY` and `YYYY-MM` segments populate year/month; the first non-date
/// directory segment is the category.
pub fn parse_path_meta(rel_path: &str) -> PathMeta {
    let mut meta = PathMeta::default();
    let segments: Vec<&str> = rel_path.split('/').collect();
    let dirs = &segments[..segments.len().saturating_sub(1)];
    for segment in dirs {
        if YEAR_RE.is_match(segment) {
            if meta.year.is_empty() {
                meta.year = segment.to_string();
            }
        } else if let Some(cap) = YEAR_MONTH_RE.captures(segment) {
            if meta.year.is_empty() {
                meta.year = cap[1].to_string();
            }
            if meta.month.is_empty() {
                meta.month = cap[2].to_string();
            }
        } else if meta.category.is_empty() {
            meta.category = segment.to_string();
        }
    }
    meta
}
