//! Property tests over the chunker's universal invariants.

use chrono::Utc;
use lorevault::chunker::{count_tokens, Chunker};
use lorevault::config::ChunkingConfig;
use lorevault::vault::{parse_path_meta, Document, DocumentStats, Frontmatter};
use proptest::prelude::*;

fn document(body: String) -> Document {
    Document {
        path: "prop.md".to_string(),
        body,
        frontmatter: Frontmatter::new(),
        digest: "0".repeat(64),
        size: 0,
        file_created: Utc::now(),
        file_modified: Utc::now(),
        stats: DocumentStats::default(),
        path_meta: parse_path_meta("prop.md"),
    }
}

/// Markdown-ish bodies: paragraphs of short sentences, sometimes with
/// headings and lists mixed in.
fn body_strategy() -> impl Strategy<Value = String> {
    let word = "[a-z]{1,10}";
    let sentence = prop::collection::vec(word, 1..12).prop_map(|words| {
        let mut s = words.join(" ");
        s.push('.');
        s
    });
    let paragraph = prop::collection::vec(sentence, 1..8).prop_map(|sents| sents.join(" "));
    prop::collection::vec((paragraph, 0u8..4), 1..25).prop_map(|paragraphs| {
        let mut body = String::new();
        for (i, (text, flavor)) in paragraphs.into_iter().enumerate() {
            match flavor {
                0 => body.push_str(&format!("# Heading {i}\n\n")),
                1 => body.push_str(&format!("## Sub {i}\n\n")),
                _ => {}
            }
            body.push_str(&text);
            body.push_str("\n\n");
        }
        body
    })
}

fn config_strategy() -> impl Strategy<Value = ChunkingConfig> {
    (64usize..512, 8usize..64).prop_map(|(max_tokens, overlap_tokens)| ChunkingConfig {
        max_tokens,
        target_tokens: max_tokens * 2 / 3,
        overlap_tokens,
    })
}

proptest! {
    /// Every chunk stays under the hard token cap.
    #[test]
    fn chunk_tokens_never_exceed_cap(body in body_strategy(), config in config_strategy()) {
        let chunks = Chunker::new(&config).chunk(&document(body));
        for chunk in &chunks {
            prop_assert!(chunk.metadata.token_count <= config.max_tokens,
                "chunk had {} tokens, cap {}", chunk.metadata.token_count, config.max_tokens);
        }
    }

    /// Total chunk tokens are bounded by document tokens plus per-boundary
    /// overlap.
    #[test]
    fn total_tokens_bounded_by_overlap(body in body_strategy(), config in config_strategy()) {
        let doc = document(body);
        let doc_tokens = count_tokens(&doc.body);
        let chunks = Chunker::new(&config).chunk(&doc);
        let total: usize = chunks.iter().map(|c| c.metadata.token_count).sum();
        let boundaries = chunks.len().saturating_sub(1);
        prop_assert!(total <= doc_tokens + boundaries * config.overlap_tokens,
            "total {} over budget {} + {}*{}", total, doc_tokens, boundaries, config.overlap_tokens);
    }

    /// Chunk indices form a contiguous prefix starting at zero.
    #[test]
    fn indices_are_contiguous(body in body_strategy()) {
        let chunks = Chunker::new(&ChunkingConfig::default()).chunk(&document(body));
        for (i, chunk) in chunks.iter().enumerate() {
            prop_assert_eq!(chunk.metadata.chunk_index, i as u32);
        }
    }

    /// Chunking is deterministic and every non-empty body produces at least
    /// one chunk carrying the full metadata set.
    #[test]
    fn chunking_is_deterministic(body in body_strategy()) {
        let chunker = Chunker::new(&ChunkingConfig::default());
        let doc = document(body);
        let a = chunker.chunk(&doc);
        let b = chunker.chunk(&doc);
        prop_assert_eq!(a.len(), b.len());
        prop_assert!(!a.is_empty());
        for (x, y) in a.iter().zip(&b) {
            prop_assert_eq!(&x.text, &y.text);
            prop_assert_eq!(&x.metadata.heading_path, &y.metadata.heading_path);
        }
        for chunk in &a {
            prop_assert_eq!(&chunk.metadata.path, "prop.md");
            prop_assert!(chunk.metadata.word_count > 0);
            prop_assert!((0.0..=1.0).contains(&chunk.metadata.content_quality_score));
        }
    }

    /// The document's words survive chunking in order (overlap repeats
    /// words but never drops or reorders fresh material).
    #[test]
    fn chunk_texts_cover_the_body(body in body_strategy()) {
        let doc = document(body);
        let chunks = Chunker::new(&ChunkingConfig::default()).chunk(&doc);
        let body_words: Vec<&str> = doc.body.split_whitespace().collect();
        let mut produced: Vec<&str> = Vec::new();
        for chunk in &chunks {
            produced.extend(chunk.text.split_whitespace());
        }
        // Every body word appears in the produced stream at least as often
        // as in the source.
        let mut counts = std::collections::HashMap::new();
        for word in &produced {
            *counts.entry(*word).or_insert(0usize) += 1;
        }
        for word in &body_words {
            let entry = counts.get_mut(word);
            prop_assert!(entry.is_some(), "word {:?} missing from chunks", word);
            if let Some(count) = entry {
                prop_assert!(*count > 0, "word {:?} underrepresented", word);
                *count -= 1;
            }
        }
    }
}
