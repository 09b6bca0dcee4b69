//! Hybrid Document Chunking
//!
//! Segments a markdown document into overlapping, heading-preserving,
//! token-bounded chunks carrying the full inherited metadata set.
//!
//! Strategy selection is content-driven: a complexity score computed from
//! headings, paragraph lengths, code fences and list nesting routes rich
//! documents through the structural splitter (recursive heading descent) and
//! flat prose through the simple splitter (sentence-packed token windows
//! with boundary overlap). Both honor the same invariants: chunk indices are
//! contiguous from zero, no chunk exceeds the hard token cap, and adjacent
//! chunks share at most the configured overlap.

use crate::config::ChunkingConfig;
use crate::vault::Document;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Adaptive bounds for the target chunk size.
pub const MIN_TARGET_TOKENS: usize = 15;
pub const MAX_TARGET_TOKENS: usize = 705;

/// Documents scoring at or above this go through the structural splitter.
const COMPLEXITY_THRESHOLD: f64 = 0.5;

static HEADING_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*$").unwrap());
static LIST_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)(?:[-*+]|\d+[.)])\s+").unwrap());

/// Approximate token cost of one whitespace-delimited word. Mirrors the
/// subword behavior of sentence-embedding tokenizers closely enough for
/// batching and window math while staying deterministic and offline.
fn word_tokens(word: &str) -> usize {
    1 + word.chars().count() / 5
}

/// Deterministic token count approximation used everywhere chunk budgets,
/// embedding batches, and stats are measured.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().map(word_tokens).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Prose,
    Code,
    List,
    Table,
    Frontmatter,
}

impl std::fmt::Display for SectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SectionType::Prose => "prose",
            SectionType::Code => "code",
            SectionType::List => "list",
            SectionType::Table => "table",
            SectionType::Frontmatter => "frontmatter",
        };
        f.write_str(name)
    }
}

/// The complete per-chunk metadata set. Every field carries a typed default
/// rather than an absent value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub path: String,
    pub chunk_index: u32,
    pub token_count: usize,
    pub word_count: usize,
    pub heading_path: Vec<String>,
    pub heading_depth: u32,
    pub section_type: SectionType,
    pub path_year: String,
    pub path_month: String,
    pub path_category: String,
    pub file_name: String,
    pub file_type: String,
    pub file_created: DateTime<Utc>,
    pub file_modified: DateTime<Utc>,
    pub file_size: u64,
    pub frontmatter_keys: Vec<String>,
    pub frontmatter_tags: Vec<String>,
    pub content_tags: Vec<String>,
    pub chunk_created: DateTime<Utc>,
    pub content_quality_score: f64,
}

impl ChunkMetadata {
    pub fn key(&self) -> String {
        chunk_key(&self.path, self.chunk_index)
    }
}

/// Deterministic chunk key `(path, chunk_index)`.
pub fn chunk_key(path: &str, index: u32) -> String {
    format!("{path}#{index}")
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

// ---------------------------------------------------------------------------
// Block parsing
// ---------------------------------------------------------------------------

/// A paragraph-level slice of the document with its heading context.
#[derive(Debug, Clone)]
struct Block {
    heading_path: Vec<String>,
    kind: SectionType,
    text: String,
    tokens: usize,
}

fn parse_blocks(body: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_kind = SectionType::Prose;
    let mut in_fence = false;

    let heading_path =
        |stack: &Vec<(usize, String)>| stack.iter().map(|(_, t)| t.clone()).collect::<Vec<_>>();

    let flush = |lines: &mut Vec<&str>, kind: SectionType, blocks: &mut Vec<Block>, hp: Vec<String>| {
        if lines.is_empty() {
            return;
        }
        let text = lines.join("\n");
        if text.trim().is_empty() {
            lines.clear();
            return;
        }
        let tokens = count_tokens(&text);
        blocks.push(Block { heading_path: hp, kind, text, tokens });
        lines.clear();
    };

    for line in body.lines() {
        if in_fence {
            current.push(line);
            if line.trim_start().starts_with("```") || line.trim_start().starts_with("~~~") {
                in_fence = false;
                flush(&mut current, SectionType::Code, &mut blocks, heading_path(&stack));
            }
            continue;
        }

        if line.trim_start().starts_with("```") || line.trim_start().starts_with("~~~") {
            flush(&mut current, current_kind, &mut blocks, heading_path(&stack));
            in_fence = true;
            current.push(line);
            continue;
        }

        if let Some(cap) = HEADING_LINE_RE.captures(line) {
            flush(&mut current, current_kind, &mut blocks, heading_path(&stack));
            let level = cap[1].len();
            let title = cap[2].to_string();
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, title));
            // The heading line itself opens the section's first block so
            // chunk texts reproduce the document.
            blocks.push(Block {
                heading_path: heading_path(&stack),
                kind: SectionType::Prose,
                tokens: count_tokens(line),
                text: line.to_string(),
            });
            current_kind = SectionType::Prose;
            continue;
        }

        if line.trim().is_empty() {
            flush(&mut current, current_kind, &mut blocks, heading_path(&stack));
            current_kind = SectionType::Prose;
            continue;
        }

        let line_kind = if LIST_LINE_RE.is_match(line) {
            SectionType::List
        } else if line.trim_start().starts_with('|') {
            SectionType::Table
        } else {
            SectionType::Prose
        };

        if current.is_empty() {
            current_kind = line_kind;
        } else if line_kind != current_kind
            && matches!(line_kind, SectionType::List | SectionType::Table)
        {
            // A list or table starting mid-paragraph begins a new block.
            flush(&mut current, current_kind, &mut blocks, heading_path(&stack));
            current_kind = line_kind;
        }
        current.push(line);
    }

    // An unterminated fence is still content.
    let kind = if in_fence { SectionType::Code } else { current_kind };
    flush(&mut current, kind, &mut blocks, heading_path(&stack));
    blocks
}

// ---------------------------------------------------------------------------
// Complexity scoring
// ---------------------------------------------------------------------------

fn complexity_score(body: &str) -> f64 {
    let mut heading_count = 0usize;
    let mut fence_lines = 0usize;
    let mut max_list_depth = 0usize;
    for line in body.lines() {
        if HEADING_LINE_RE.is_match(line) {
            heading_count += 1;
        }
        if line.trim_start().starts_with("```") {
            fence_lines += 1;
        }
        if let Some(cap) = LIST_LINE_RE.captures(line) {
            max_list_depth = max_list_depth.max(1 + cap[1].len() / 2);
        }
    }
    let paragraphs: Vec<&str> = body
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let avg_paragraph_len = if paragraphs.is_empty() {
        0.0
    } else {
        paragraphs.iter().map(|p| p.len()).sum::<usize>() as f64 / paragraphs.len() as f64
    };

    let heading_term = (heading_count as f64 / 6.0).min(1.0);
    let fence_term = ((fence_lines / 2) as f64 / 3.0).min(1.0);
    let list_term = (max_list_depth as f64 / 3.0).min(1.0);
    let paragraph_term = 1.0 - (avg_paragraph_len / 800.0).min(1.0);

    0.45 * heading_term + 0.25 * fence_term + 0.2 * list_term + 0.1 * paragraph_term
}

// ---------------------------------------------------------------------------
// Splitters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Unit {
    text: String,
    tokens: usize,
    heading_path: Vec<String>,
    kind: SectionType,
    /// Whether this unit opens a new block (joined with a paragraph break)
    /// or continues one (joined with a space).
    new_block: bool,
}

#[derive(Debug)]
struct RawChunk {
    text: String,
    heading_path: Vec<String>,
    section_type: SectionType,
}

pub struct Chunker {
    max_tokens: usize,
    target_tokens: usize,
    overlap_tokens: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        let target = config
            .target_tokens
            .clamp(MIN_TARGET_TOKENS, MAX_TARGET_TOKENS)
            .min(config.max_tokens);
        Self {
            max_tokens: config.max_tokens,
            target_tokens: target,
            overlap_tokens: config.overlap_tokens.min(target.saturating_sub(1)),
        }
    }

    /// Segment a document into its chunk set. Empty documents yield zero
    /// chunks; frontmatter never appears in chunk text but its keys/tags are
    /// inherited by every chunk's metadata.
    pub fn chunk(&self, doc: &Document) -> Vec<Chunk> {
        if doc.body.trim().is_empty() {
            return Vec::new();
        }
        let blocks = parse_blocks(&doc.body);
        if blocks.is_empty() {
            return Vec::new();
        }

        let raw = if complexity_score(&doc.body) >= COMPLEXITY_THRESHOLD {
            self.split_section(&blocks, 1)
        } else {
            self.pack_units(self.units_from_blocks(&blocks))
        };

        let chunk_created = Utc::now();
        let frontmatter_keys: Vec<String> = doc.frontmatter.keys().cloned().collect();
        let frontmatter_tags = doc.frontmatter_tags();

        raw.into_iter()
            .enumerate()
            .map(|(index, rc)| {
                let token_count = count_tokens(&rc.text);
                let word_count = rc.text.split_whitespace().count();
                let quality = quality_score(&rc.text, word_count, &rc.heading_path);
                Chunk {
                    metadata: ChunkMetadata {
                        path: doc.path.clone(),
                        chunk_index: index as u32,
                        token_count,
                        word_count,
                        heading_depth: rc.heading_path.len() as u32,
                        heading_path: rc.heading_path,
                        section_type: rc.section_type,
                        path_year: doc.path_meta.year.clone(),
                        path_month: doc.path_meta.month.clone(),
                        path_category: doc.path_meta.category.clone(),
                        file_name: doc.file_name().to_string(),
                        file_type: doc.file_type().to_string(),
                        file_created: doc.file_created,
                        file_modified: doc.file_modified,
                        file_size: doc.size,
                        frontmatter_keys: frontmatter_keys.clone(),
                        frontmatter_tags: frontmatter_tags.clone(),
                        content_tags: doc.stats.content_tags.clone(),
                        chunk_created,
                        content_quality_score: quality,
                    },
                    text: rc.text,
                }
            })
            .collect()
    }

    /// Structural splitter: a section that fits the window becomes one
    /// chunk; oversized sections recurse down the heading hierarchy, then
    /// fall back to paragraph/sentence/token packing.
    fn split_section(&self, blocks: &[Block], depth: usize) -> Vec<RawChunk> {
        if blocks.is_empty() {
            return Vec::new();
        }
        let total: usize = blocks.iter().map(|b| b.tokens).sum();
        if total <= self.max_tokens {
            return vec![chunk_from_blocks(blocks)];
        }
        let has_deeper = blocks.iter().any(|b| b.heading_path.len() >= depth);
        if !has_deeper {
            return self.pack_units(self.units_from_blocks(blocks));
        }

        let mut out = Vec::new();
        let mut start = 0;
        while start < blocks.len() {
            let key = blocks[start].heading_path.get(depth - 1).cloned();
            let mut end = start + 1;
            while end < blocks.len() && blocks[end].heading_path.get(depth - 1) == key.as_ref() {
                end += 1;
            }
            let group = &blocks[start..end];
            let group_total: usize = group.iter().map(|b| b.tokens).sum();
            if group_total <= self.max_tokens {
                out.push(chunk_from_blocks(group));
            } else if group.iter().any(|b| b.heading_path.len() > depth) {
                out.extend(self.split_section(group, depth + 1));
            } else {
                out.extend(self.pack_units(self.units_from_blocks(group)));
            }
            start = end;
        }
        out
    }

    /// Decompose blocks into packable units: sentences for prose, lines for
    /// lists and tables, whole fences for code. Units that alone exceed the
    /// hard cap are subdivided by token window.
    fn units_from_blocks(&self, blocks: &[Block]) -> Vec<Unit> {
        let mut units = Vec::new();
        for block in blocks {
            let pieces: Vec<String> = match block.kind {
                SectionType::Code => vec![block.text.clone()],
                SectionType::List | SectionType::Table => {
                    block.text.lines().map(str::to_string).collect()
                }
                _ => split_sentences(&block.text),
            };
            let mut first = true;
            for piece in pieces {
                let tokens = count_tokens(&piece);
                if tokens > self.max_tokens {
                    for window in token_windows(&piece, self.target_tokens) {
                        let tokens = count_tokens(&window);
                        units.push(Unit {
                            text: window,
                            tokens,
                            heading_path: block.heading_path.clone(),
                            kind: block.kind,
                            new_block: first,
                        });
                        first = false;
                    }
                } else {
                    units.push(Unit {
                        text: piece,
                        tokens,
                        heading_path: block.heading_path.clone(),
                        kind: block.kind,
                        new_block: first,
                    });
                    first = false;
                }
            }
        }
        units
    }

    /// Greedy window packing with bounded overlap carry-over.
    fn pack_units(&self, units: Vec<Unit>) -> Vec<RawChunk> {
        let mut chunks = Vec::new();
        let mut current: Vec<Unit> = Vec::new();
        let mut current_tokens = 0usize;

        for unit in units {
            if !current.is_empty() && current_tokens + unit.tokens > self.target_tokens {
                chunks.push(chunk_from_units(&current));
                let mut carry: Vec<Unit> = Vec::new();
                let mut carry_tokens = 0usize;
                for u in current.iter().rev() {
                    if carry_tokens + u.tokens > self.overlap_tokens {
                        break;
                    }
                    carry_tokens += u.tokens;
                    carry.push(u.clone());
                }
                carry.reverse();
                if let Some(first) = carry.first_mut() {
                    first.new_block = true;
                }
                current = carry;
                current_tokens = carry_tokens;
            }
            current_tokens += unit.tokens;
            current.push(unit);
        }
        if !current.is_empty() {
            chunks.push(chunk_from_units(&current));
        }
        chunks
    }
}

fn chunk_from_blocks(blocks: &[Block]) -> RawChunk {
    let text = blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n\n");
    RawChunk {
        heading_path: blocks[0].heading_path.clone(),
        section_type: dominant_kind(blocks.iter().map(|b| (b.kind, b.tokens))),
        text,
    }
}

fn chunk_from_units(units: &[Unit]) -> RawChunk {
    let mut text = String::new();
    for (i, unit) in units.iter().enumerate() {
        if i > 0 {
            text.push_str(if unit.new_block { "\n\n" } else { " " });
        }
        text.push_str(&unit.text);
    }
    RawChunk {
        heading_path: units[0].heading_path.clone(),
        section_type: dominant_kind(units.iter().map(|u| (u.kind, u.tokens))),
        text,
    }
}

fn dominant_kind(parts: impl Iterator<Item = (SectionType, usize)>) -> SectionType {
    let mut totals: [(SectionType, usize); 4] = [
        (SectionType::Prose, 0),
        (SectionType::Code, 0),
        (SectionType::List, 0),
        (SectionType::Table, 0),
    ];
    for (kind, tokens) in parts {
        for entry in totals.iter_mut() {
            if entry.0 == kind {
                entry.1 += tokens;
            }
        }
    }
    totals.iter().max_by_key(|(_, t)| *t).map(|(k, _)| *k).unwrap_or(SectionType::Prose)
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().is_none_or(|n| n.is_whitespace()) {
            let piece = current.trim();
            if !piece.is_empty() {
                sentences.push(piece.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn token_windows(text: &str, window_tokens: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;
    for word in text.split_whitespace() {
        let tokens = word_tokens(word);
        if tokens > window_tokens {
            // A single unbreakable run longer than the window: cut by chars.
            if !current.is_empty() {
                out.push(current.join(" "));
                current.clear();
                current_tokens = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for slice in chars.chunks(window_tokens.saturating_sub(1).max(1) * 5) {
                out.push(slice.iter().collect());
            }
            continue;
        }
        if !current.is_empty() && current_tokens + tokens > window_tokens {
            out.push(current.join(" "));
            current.clear();
            current_tokens = 0;
        }
        current.push(word.to_string());
        current_tokens += tokens;
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }
    out
}

/// Content quality heuristic in [0, 1]: substance (word count band),
/// structure (heading context), and annotation richness.
fn quality_score(text: &str, word_count: usize, heading_path: &[String]) -> f64 {
    if word_count == 0 {
        return 0.0;
    }
    let substance = (word_count as f64 / 120.0).min(1.0) * 0.6;
    let structure = if heading_path.is_empty() { 0.0 } else { 0.2 };
    let links = text.matches("[[").count() + text.matches("](").count();
    let annotation = ((links as f64) / 4.0).min(1.0) * 0.2;
    (substance + structure + annotation).clamp(0.0, 1.0)
}
