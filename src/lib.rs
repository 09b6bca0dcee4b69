//! lorevault — a local-first semantic knowledge engine over a plaintext
//! markdown vault.
//!
//! The engine continuously ingests vault files, chunks them into
//! metadata-rich token-bounded fragments, embeds the chunks through a
//! pluggable provider, and serves low-latency hybrid retrieval: semantic
//! similarity, case-sensitive keyword containment, metadata predicates,
//! optional cross-encoder re-ranking, and cached query embeddings.
//!
//! ```no_run
//! use lorevault::{Engine, EngineConfig, SearchQuery};
//!
//! # async fn run() -> lorevault::EngineResult<()> {
//! let config = EngineConfig::for_vault("/path/to/vault");
//! let engine = Engine::builder(config).build()?;
//! engine.start(); // startup sync + continuous watching
//!
//! let results = engine
//!     .search(&SearchQuery::new("rust async runtime").top_k(5))
//!     .await?;
//! for hit in &results.hits {
//!     println!("{:.2}  {}", hit.score, hit.chunk_key);
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod chunker;
pub mod config;
pub mod digest;
pub mod embed;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod search;
pub mod store;
pub mod vault;

pub use cache::{CacheStats, TtlCache};
pub use chunker::{chunk_key, count_tokens, Chunk, ChunkMetadata, Chunker, SectionType};
pub use config::EngineConfig;
pub use digest::{DigestRecord, DigestStore};
pub use embed::{EmbeddingClient, EmbeddingProvider, HashingEmbedder};
pub use engine::{Engine, EngineBuilder, EngineEvent, EngineStats, Shutdown};
pub use error::{EngineError, EngineResult};
pub use metrics::{MetricEvent, Metrics};
pub use monitor::VaultMonitor;
pub use pipeline::{EventKind, IngestPipeline, SyncReport};
pub use search::{
    CrossEncoder, Expansion, ExpansionStrategy, QueryExpander, SearchHit, SearchQuery,
    SearchResponse, SearchService,
};
pub use store::{
    CollectionStats, MemoryVectorStore, MetadataFilter, MetadataValue, QueryHit, UpsertItem,
    VectorStore,
};
pub use vault::{Document, DocumentMeta, FrontmatterValue, VaultClient};
