//! End-to-end engine scenarios over a scratch vault.

use lorevault::{
    chunk_key, ChunkMetadata, Engine, EngineConfig, EngineEvent, MemoryVectorStore,
    MetadataFilter, SearchQuery, SectionType, UpsertItem, VectorStore,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn test_config(vault: &Path, state: &Path) -> EngineConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let mut config = EngineConfig::for_vault(vault);
    config.state_dir = state.to_path_buf();
    config.monitor.debounce_ms = 100;
    config.monitor.shutdown_grace_ms = 2000;
    config
}

async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<EngineEvent>,
    mut predicate: F,
) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}

#[tokio::test]
async fn cold_start_with_empty_vault() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();

    let report = engine.full_sync().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(report.rewritten, 0);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.collection.count, 0);

    let response = engine.search(&SearchQuery::new("anything")).await.unwrap();
    assert!(response.hits.is_empty());
    assert!(!response.degraded);
}

#[tokio::test]
async fn single_document_round_trip() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(vault.path().join("a.md"), "# Title\nHello world.\n").unwrap();

    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();
    engine.full_sync().await.unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.collection.count, 1);

    let response = engine.search(&SearchQuery::new("hello")).await.unwrap();
    assert_eq!(response.hits.len(), 1);
    let hit = &response.hits[0];
    assert_eq!(hit.metadata.path, "a.md");
    assert_eq!(hit.metadata.heading_path, vec!["Title".to_string()]);
    assert!(hit.metadata.token_count > 0);
    assert!(hit.score > 0.4, "score was {}", hit.score);
}

#[tokio::test]
async fn incremental_update_via_monitor() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let file = vault.path().join("a.md");
    std::fs::write(&file, "# Title\nHello world.\n").unwrap();

    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start();
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::FullSyncCompleted { .. })).await;

    let mut contents = std::fs::read_to_string(&file).unwrap();
    contents.push_str("\nMore text.\n");
    std::fs::write(&file, contents).unwrap();
    wait_for_event(
        &mut rx,
        |e| matches!(e, EngineEvent::FileIngested { path, .. } if path == "a.md"),
    )
    .await;

    let response = engine
        .search(&SearchQuery::new("more text"))
        .await
        .unwrap();
    assert!(response.hits.iter().any(|h| h.text.contains("More text.")));

    engine.shutdown().await;
}

#[tokio::test]
async fn delete_removes_chunks_and_digest_entry() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let file = vault.path().join("a.md");
    std::fs::write(&file, "# Title\nHello world.\n").unwrap();

    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start();
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::FullSyncCompleted { .. })).await;
    assert_eq!(engine.stats().await.unwrap().collection.count, 1);

    std::fs::remove_file(&file).unwrap();
    wait_for_event(
        &mut rx,
        |e| matches!(e, EngineEvent::FileRemoved { path } if path == "a.md"),
    )
    .await;

    assert_eq!(engine.stats().await.unwrap().collection.count, 0);
    let digests = lorevault::DigestStore::load(state.path()).unwrap();
    assert_eq!(digests.get("a.md").await, None);

    engine.shutdown().await;
}

#[tokio::test]
async fn keyword_filter_precision() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(
        vault.path().join("python.md"),
        "# Python\nPython is a popular programming language for data work.\n",
    )
    .unwrap();
    std::fs::write(
        vault.path().join("js.md"),
        "# JavaScript\nJavaScript is the programming language of the web.\n",
    )
    .unwrap();

    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();
    engine.full_sync().await.unwrap();

    let response = engine
        .search(&SearchQuery::new("programming language").keyword("Python"))
        .await
        .unwrap();
    assert_eq!(response.hits.len(), 1);
    let hit = &response.hits[0];
    assert_eq!(hit.metadata.path, "python.md");
    assert!(hit.text.contains("Python"));
    assert!(hit.keyword_density.unwrap() > 0.0);
}

#[tokio::test]
async fn metadata_filters_reach_path_segments() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(vault.path().join("journal/2024/2024-06")).unwrap();
    std::fs::create_dir_all(vault.path().join("journal/2023")).unwrap();
    std::fs::write(
        vault.path().join("journal/2024/2024-06/entry.md"),
        "Quarterly planning notes about the garden project.\n",
    )
    .unwrap();
    std::fs::write(
        vault.path().join("journal/2023/entry.md"),
        "Older planning notes about the garden project.\n",
    )
    .unwrap();

    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();
    engine.full_sync().await.unwrap();

    let response = engine
        .search(
            &SearchQuery::new("garden planning")
                .filter(MetadataFilter::Eq("path_year".into(), "2024".into())),
        )
        .await
        .unwrap();
    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].metadata.path_year, "2024");
    assert_eq!(response.hits[0].metadata.path_month, "06");
    assert_eq!(response.hits[0].metadata.path_category, "journal");
}

#[tokio::test]
async fn second_sync_skips_everything() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    for i in 0..5 {
        std::fs::write(
            vault.path().join(format!("note-{i}.md")),
            format!("# Note {i}\nBody of note number {i}.\n"),
        )
        .unwrap();
    }

    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();
    let first = engine.full_sync().await.unwrap();
    assert_eq!(first.rewritten, 5);
    let second = engine.full_sync().await.unwrap();
    assert_eq!(second.rewritten, 0);
    assert_eq!(second.skipped, 5);
}

#[tokio::test]
async fn digest_records_survive_engine_restart() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(vault.path().join("a.md"), "# Title\nHello world.\n").unwrap();

    {
        let engine = Engine::builder(test_config(vault.path(), state.path()))
            .build()
            .unwrap();
        let report = engine.full_sync().await.unwrap();
        assert_eq!(report.rewritten, 1);
    }

    // Fresh engine over the same state dir: the digest record still
    // matches, so nothing is rewritten.
    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();
    let report = engine.full_sync().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.rewritten, 0);
    assert_eq!(engine.stats().await.unwrap().digest_records, 1);
}

#[tokio::test]
async fn cached_query_repeats_identically() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    for i in 0..20 {
        std::fs::write(
            vault.path().join(format!("doc-{i}.md")),
            format!("# Doc {i}\nContent about topic {i} with shared vocabulary.\n"),
        )
        .unwrap();
    }

    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();
    engine.full_sync().await.unwrap();

    let query = SearchQuery::new("shared vocabulary").top_k(5);
    let first = engine.search(&query).await.unwrap();
    let second = engine.search(&query).await.unwrap();
    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    let first_keys: Vec<&str> = first.hits.iter().map(|h| h.chunk_key.as_str()).collect();
    let second_keys: Vec<&str> = second.hits.iter().map(|h| h.chunk_key.as_str()).collect();
    assert_eq!(first_keys, second_keys);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.result_cache.hits, 1);
}

#[tokio::test]
async fn warm_populates_query_embeddings() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();

    let warmed = engine
        .warm(&["alpha beta".to_string(), "gamma delta".to_string()])
        .await;
    assert_eq!(warmed, 2);
    assert_eq!(engine.stats().await.unwrap().query_cache.len, 2);
}

fn atomicity_meta(path: &str, index: u32, version: &str) -> ChunkMetadata {
    ChunkMetadata {
        path: path.to_string(),
        chunk_index: index,
        token_count: 4,
        word_count: 4,
        heading_path: Vec::new(),
        heading_depth: 0,
        section_type: SectionType::Prose,
        path_year: String::new(),
        path_month: String::new(),
        path_category: String::new(),
        file_name: path.to_string(),
        file_type: "md".to_string(),
        file_created: chrono::Utc::now(),
        file_modified: chrono::Utc::now(),
        file_size: 0,
        frontmatter_keys: Vec::new(),
        frontmatter_tags: Vec::new(),
        content_tags: vec![version.to_string()],
        chunk_created: chrono::Utc::now(),
        content_quality_score: 0.5,
    }
}

/// A query concurrent with a rewrite of path `p` sees either all old-version
/// chunks or all new-version chunks, never a mix.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rewrite_is_atomic_for_concurrent_queries() {
    const DIM: usize = 8;
    let store = Arc::new(MemoryVectorStore::new(DIM, Default::default()));

    let items = |version: &str, count: u32| -> Vec<UpsertItem> {
        (0..count)
            .map(|i| UpsertItem {
                key: chunk_key("p.md", i),
                vector: vec![1.0; DIM],
                text: format!("chunk {i} {version}"),
                metadata: atomicity_meta("p.md", i, version),
            })
            .collect()
    };
    store.replace_path("p.md", items("v1", 2)).await.unwrap();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for round in 0..200u32 {
                let (version, count) = if round % 2 == 0 { ("v2", 3) } else { ("v1", 2) };
                store.replace_path("p.md", items(version, count)).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let reader = {
        let store = store.clone();
        tokio::spawn(async move {
            let probe = vec![1.0f32; DIM];
            for _ in 0..400 {
                let hits = store.query(&probe, 100, None, None).await.unwrap();
                let versions: Vec<&str> = hits
                    .iter()
                    .map(|h| h.metadata.content_tags[0].as_str())
                    .collect();
                assert!(
                    versions.windows(2).all(|w| w[0] == w[1]),
                    "mixed versions observed: {versions:?}"
                );
                let expected = if versions.first() == Some(&"v1") { 2 } else { 3 };
                assert_eq!(hits.len(), expected);
                let mut indices: Vec<u32> =
                    hits.iter().map(|h| h.metadata.chunk_index).collect();
                indices.sort_unstable();
                let contiguous: Vec<u32> = (0..indices.len() as u32).collect();
                assert_eq!(indices, contiguous);
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
}

#[tokio::test]
async fn shutdown_is_prompt_and_idempotent() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(vault.path().join("a.md"), "# A\nBody.\n").unwrap();

    let engine = Engine::builder(test_config(vault.path(), state.path()))
        .build()
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start();
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::FullSyncCompleted { .. })).await;

    tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .expect("shutdown should finish within the grace period");
    // A second shutdown is a no-op.
    engine.shutdown().await;
}
