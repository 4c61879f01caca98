//! Fitting retrieved chunks into a model's context window.
//!
//! Three independent steps, composed by the pipeline in this order:
//! [`ChunkMerger`] rejoins adjacent chunks of the same source,
//! [`ContextCompressor`] optionally keeps only the query-relevant sentences,
//! and [`ContextWindowOptimizer`] cuts the result down to the token budget.

use serde::Serialize;
use tracing::debug;

use crate::{
    chunking::{Chunk, ChunkMetadata},
    reranker::RankedResult,
    retriever::RetrievalResult,
    text_util::{self, CHARS_PER_TOKEN},
};

/// Sentences this short or shorter are dropped by the compressor.
const MIN_SENTENCE_CHARS: usize = 10;
/// Sentence length (in characters) that earns the full length score.
const FULL_SENTENCE_CHARS: f32 = 200.0;
/// Smallest leftover budget (in characters) worth a truncated chunk.
const MIN_PARTIAL_CHARS: usize = 100;

/// Anything with text and chunk metadata.
pub trait ContextSource {
    fn content(&self) -> &str;
    fn metadata(&self) -> &ChunkMetadata;

    /// Position of the chunk within its document.
    fn chunk_id(&self) -> usize {
        self.metadata().chunk_index.unwrap_or_default()
    }

    /// Relevance to the current query, when known.
    fn score(&self) -> f32 {
        0.0
    }
}

impl ContextSource for Chunk {
    fn content(&self) -> &str {
        &self.content
    }

    fn metadata(&self) -> &ChunkMetadata {
        &self.metadata
    }

    fn chunk_id(&self) -> usize {
        self.chunk_id
    }
}

impl ContextSource for RetrievalResult {
    fn content(&self) -> &str {
        &self.content
    }

    fn metadata(&self) -> &ChunkMetadata {
        &self.metadata
    }

    fn chunk_id(&self) -> usize {
        self.chunk_id
    }

    fn score(&self) -> f32 {
        self.score
    }
}

impl ContextSource for RankedResult {
    fn content(&self) -> &str {
        &self.content
    }

    fn metadata(&self) -> &ChunkMetadata {
        &self.metadata
    }

    fn chunk_id(&self) -> usize {
        self.chunk_id
    }

    fn score(&self) -> f32 {
        self.reranked_score
    }
}

/// A piece of context text, possibly made of several merged chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextBlock {
    pub content: String,
    /// Metadata of the first chunk in the block.
    pub metadata: ChunkMetadata,
    /// `chunk_index` values merged into this block, ascending.
    pub chunk_indices: Vec<usize>,
    /// Set when the window optimizer cut the block short.
    pub truncated: bool,
}

impl ContextBlock {
    pub fn new(content: impl Into<String>, metadata: ChunkMetadata) -> Self {
        let chunk_indices = metadata.chunk_index.into_iter().collect();
        Self {
            content: content.into(),
            metadata,
            chunk_indices,
            truncated: false,
        }
    }

    fn from_source<T: ContextSource>(source: &T) -> Self {
        Self::new(source.content(), source.metadata().clone())
    }

    /// Whether this block carries (some of) `source`'s text.
    pub fn covers<T: ContextSource>(&self, source: &T) -> bool {
        let metadata = source.metadata();
        if let (Some(key), Some(index)) =
            (metadata.source_key(), metadata.chunk_index)
        {
            return self.metadata.source_key() == Some(key)
                && self.chunk_indices.contains(&index);
        }
        if self.truncated {
            let kept = self.content.trim_end_matches("...").trim_end();
            source.content().starts_with(kept)
        } else {
            self.content == source.content()
        }
    }
}

impl ContextSource for ContextBlock {
    fn content(&self) -> &str {
        &self.content
    }

    fn metadata(&self) -> &ChunkMetadata {
        &self.metadata
    }
}

/// Result of extractive compression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizedContext {
    pub compressed_text: String,
    /// Total characters of the input chunks.
    pub original_length: usize,
    pub compressed_length: usize,
    /// `compressed_length / original_length`, 0 for empty input.
    pub compression_ratio: f32,
    pub num_chunks: usize,
    /// Mean score of the selected sentences.
    pub relevance_score: f32,
}

/// Extractive compression: keeps the sentences that best match the query.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextCompressor;

impl ContextCompressor {
    /// `0.6·token_overlap + 0.3·min(chars / 200, 1) + 0.2·exact_phrase`
    pub fn score_sentence(
        query_tokens: &[String],
        phrase: &str,
        sentence: &str,
    ) -> f32 {
        let overlap = if query_tokens.is_empty() {
            0.0
        } else {
            let tokens = text_util::tokenize(sentence);
            let hits =
                query_tokens.iter().filter(|t| tokens.contains(t)).count();
            hits as f32 / query_tokens.len() as f32
        };
        let length =
            (sentence.chars().count() as f32 / FULL_SENTENCE_CHARS).min(1.0);
        let exact = if !phrase.is_empty()
            && sentence.to_lowercase().contains(phrase)
        {
            0.2
        } else {
            0.0
        };
        0.6 * overlap + 0.3 * length + exact
    }

    /// Keep the best-scoring sentences until their combined length reaches
    /// `⌊original_length × ratio⌋`, always keeping at least one.
    ///
    /// Output sentences appear in score order, joined by single spaces.
    pub fn compress<T: ContextSource>(
        &self,
        chunks: &[T],
        query: &str,
        ratio: f32,
    ) -> OptimizedContext {
        let original_length: usize =
            chunks.iter().map(|c| c.content().chars().count()).sum();

        let mut query_tokens = text_util::tokenize(query);
        query_tokens.sort_unstable();
        query_tokens.dedup();
        let phrase = query.trim().to_lowercase();

        let mut scored: Vec<(&str, f32)> = chunks
            .iter()
            .flat_map(|c| text_util::split_sentences(c.content()))
            .filter(|s| s.chars().count() > MIN_SENTENCE_CHARS)
            .map(|s| (s, Self::score_sentence(&query_tokens, &phrase, s)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let ratio = f64::from(ratio.clamp(0.0, 1.0));
        let target = (original_length as f64 * ratio).floor() as usize;

        let mut selected: Vec<(&str, f32)> = Vec::new();
        let mut running = 0;
        for (sentence, score) in scored {
            if !selected.is_empty() && running >= target {
                break;
            }
            running += sentence.chars().count();
            selected.push((sentence, score));
        }

        let compressed_text = selected
            .iter()
            .map(|(s, _)| *s)
            .collect::<Vec<_>>()
            .join(" ");
        let compressed_length = compressed_text.chars().count();
        let relevance_score = if selected.is_empty() {
            0.0
        } else {
            let total: f32 = selected.iter().map(|(_, s)| s).sum();
            total / selected.len() as f32
        };
        let compression_ratio = if original_length == 0 {
            0.0
        } else {
            compressed_length as f32 / original_length as f32
        };

        debug!(
            original_length,
            compressed_length,
            sentences = selected.len(),
            "compressed context"
        );

        OptimizedContext {
            compressed_text,
            original_length,
            compressed_length,
            compression_ratio,
            num_chunks: chunks.len(),
            relevance_score,
        }
    }
}

/// Greedy token-budget packing with the 4-characters-per-token estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextWindowOptimizer;

impl ContextWindowOptimizer {
    /// Character budget left after reserving room for the prompt and answer.
    pub fn budget_chars(max_tokens: usize, reserved_tokens: usize) -> usize {
        max_tokens.saturating_sub(reserved_tokens) * CHARS_PER_TOKEN
    }

    /// Take whole chunks in order while they fit, then at most one
    /// truncated chunk (ending in `...`) if at least 100 characters of
    /// budget remain.
    pub fn fit<T: ContextSource>(
        &self,
        chunks: &[T],
        max_tokens: usize,
        reserved_tokens: usize,
    ) -> Vec<ContextBlock> {
        let budget = Self::budget_chars(max_tokens, reserved_tokens);
        let mut used = 0;
        let mut fitted = Vec::new();

        for chunk in chunks {
            let len = chunk.content().chars().count();
            if used + len <= budget {
                used += len;
                fitted.push(ContextBlock::from_source(chunk));
                continue;
            }

            let remaining = budget - used;
            if remaining >= MIN_PARTIAL_CHARS {
                let mut block = ContextBlock::from_source(chunk);
                block.content =
                    text_util::ellipsize(chunk.content(), remaining);
                block.truncated = true;
                fitted.push(block);
            }
            break;
        }

        debug!(
            budget,
            kept = fitted.len(),
            available = chunks.len(),
            "fitted context window"
        );
        fitted
    }
}

/// Rejoins chunks that sat close together in their source document.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkMerger;

impl ChunkMerger {
    /// Group chunks by source (in order of first appearance), sort each
    /// group by `chunk_index` and merge runs whose index gap is at most
    /// `max_gap`. Merged text is joined by a blank line.
    ///
    /// Chunks without a source or without a `chunk_index` stay on their
    /// own. A repeated index within a source is kept once.
    pub fn merge<T: ContextSource>(
        &self,
        chunks: &[T],
        max_gap: usize,
    ) -> Vec<ContextBlock> {
        let mut groups: Vec<(Option<&str>, Vec<&T>)> = Vec::new();
        for chunk in chunks {
            let key = chunk.metadata().source_key();
            let existing = key.and_then(|k| {
                groups.iter_mut().find(|(g, _)| *g == Some(k))
            });
            match existing {
                Some((_, members)) => members.push(chunk),
                None => groups.push((key, vec![chunk])),
            }
        }

        let mut blocks = Vec::new();
        for (_, mut members) in groups {
            members.sort_by_key(|c| {
                c.metadata().chunk_index.unwrap_or(usize::MAX)
            });
            members.dedup_by(|b, a| {
                b.metadata().chunk_index.is_some()
                    && b.metadata().chunk_index == a.metadata().chunk_index
            });

            let mut current: Option<ContextBlock> = None;
            for member in members {
                let index = member.metadata().chunk_index;
                let joins = match (&current, index) {
                    (Some(block), Some(next)) => block
                        .chunk_indices
                        .last()
                        .is_some_and(|&last| next - last <= max_gap),
                    _ => false,
                };

                if joins && let Some(block) = current.as_mut() {
                    block.content.push_str("\n\n");
                    block.content.push_str(member.content());
                    block.chunk_indices.extend(index);
                } else {
                    blocks.extend(current.take());
                    current = Some(ContextBlock::from_source(member));
                }
            }
            blocks.extend(current);
        }
        blocks
    }

    /// [`merge`](Self::merge), keeping only the text.
    pub fn merge_texts<T: ContextSource>(
        &self,
        chunks: &[T],
        max_gap: usize,
    ) -> Vec<String> {
        self.merge(chunks, max_gap)
            .into_iter()
            .map(|b| b.content)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(file: &str, index: usize, content: &str) -> Chunk {
        let mut metadata = ChunkMetadata::for_source(file, format!("{file}.md"));
        metadata.chunk_index = Some(index);
        Chunk {
            content: content.to_string(),
            chunk_id: index,
            start_char: 0,
            end_char: content.chars().count(),
            metadata,
        }
    }

    #[test]
    fn blocks_know_which_chunks_they_cover() {
        let chunks =
            vec![chunk("a", 0, "a0"), chunk("a", 1, "a1"), chunk("b", 0, "b0")];
        let blocks = ChunkMerger.merge(&chunks, 1);

        assert!(blocks[0].covers(&chunks[0]));
        assert!(blocks[0].covers(&chunks[1]));
        assert!(!blocks[0].covers(&chunks[2]));
        assert!(blocks[1].covers(&chunks[2]));

        let loose = ContextBlock::new("loose text", ChunkMetadata::default());
        let mut cut = loose.clone();
        cut.content = "loose...".to_string();
        cut.truncated = true;
        assert!(cut.covers(&loose));
        assert!(!cut.covers(&chunks[0]));
    }

    #[test]
    fn compressor_prefers_matching_sentences() {
        let chunks = vec![
            chunk("a", 0, "Rust has a borrow checker. The weather was mild today."),
            chunk("a", 1, "Short. Ownership rules in Rust prevent data races."),
        ];
        let out = ContextCompressor.compress(&chunks, "rust ownership", 0.3);

        assert!(out.compressed_text.starts_with("Ownership rules in Rust"));
        assert!(!out.compressed_text.contains("Short."));
        assert_eq!(out.num_chunks, 2);
        assert_eq!(out.original_length, 104);
        assert_eq!(out.compressed_length, out.compressed_text.chars().count());
        assert!(
            (out.compression_ratio
                - out.compressed_length as f32 / out.original_length as f32)
                .abs()
                < 1e-6
        );
    }

    #[test]
    fn compressor_keeps_at_least_one_sentence() {
        let chunks = vec![chunk("a", 0, "One complete sentence here. Another one follows it.")];
        let out = ContextCompressor.compress(&chunks, "nothing", 0.0);
        assert_eq!(out.compressed_text.split(". ").count(), 1);
        assert!(out.compressed_length > 0);
    }

    #[test]
    fn compressor_stops_at_target() {
        let text = "Alpha sentence number one. Beta sentence number two. \
                    Gamma sentence number three. Delta sentence number four.";
        let chunks = vec![chunk("a", 0, text)];
        let out = ContextCompressor.compress(&chunks, "sentence", 0.5);
        let target = text.chars().count() / 2;
        // The last accepted sentence crosses the target; one fewer would not.
        assert!(out.compressed_length >= target);
        assert!(out.compressed_length < text.chars().count());
    }

    #[test]
    fn compressor_scores_by_formula() {
        let tokens = vec!["fox".to_string()];
        let sentence = "the quick fox";
        let score = ContextCompressor::score_sentence(&tokens, "fox", sentence);
        let expected = 0.6 + 0.3 * (13.0 / 200.0) + 0.2;
        assert!((score - expected).abs() < 1e-6);
    }

    #[test]
    fn compressor_handles_empty_input() {
        let out = ContextCompressor.compress::<Chunk>(&[], "query", 0.5);
        assert!(out.compressed_text.is_empty());
        assert_eq!(out.compression_ratio, 0.0);
        assert_eq!(out.relevance_score, 0.0);
    }

    #[test]
    fn window_takes_whole_chunks_then_partial() {
        let chunks = vec![
            chunk("a", 0, &"a".repeat(300)),
            chunk("a", 1, &"b".repeat(300)),
            chunk("a", 2, &"c".repeat(300)),
        ];
        // (200 - 50) tokens * 4 = 600 chars: two whole chunks, nothing left.
        let fitted = ContextWindowOptimizer.fit(&chunks, 200, 50);
        assert_eq!(fitted.len(), 2);
        assert!(fitted.iter().all(|b| !b.truncated));

        // 700 chars: two whole chunks plus 100 chars of the third.
        let fitted = ContextWindowOptimizer.fit(&chunks, 175, 0);
        assert_eq!(fitted.len(), 3);
        assert!(fitted[2].truncated);
        assert!(fitted[2].content.ends_with("..."));
        assert_eq!(fitted[2].content.chars().count(), 100);
    }

    #[test]
    fn window_skips_small_partials() {
        let chunks = vec![chunk("a", 0, &"a".repeat(350)), chunk("a", 1, &"b".repeat(300))];
        // 400 chars: 50 left after the first chunk.
        let fitted = ContextWindowOptimizer.fit(&chunks, 100, 0);
        assert_eq!(fitted.len(), 1);

        assert!(ContextWindowOptimizer.fit(&chunks, 10, 20).is_empty());
    }

    #[test]
    fn merger_joins_adjacent_chunks_per_source() {
        let chunks = vec![
            chunk("b", 5, "b5"),
            chunk("a", 2, "a2"),
            chunk("a", 0, "a0"),
            chunk("b", 4, "b4"),
            chunk("a", 1, "a1"),
            chunk("a", 1, "a1"),
        ];
        let blocks = ChunkMerger.merge(&chunks, 1);
        let texts: Vec<&str> = blocks.iter().map(|b| b.content.as_str()).collect();
        assert_eq!(texts, vec!["b4\n\nb5", "a0\n\na1\n\na2"]);
        assert_eq!(blocks[1].chunk_indices, vec![0, 1, 2]);
        assert_eq!(blocks[1].metadata.chunk_index, Some(0));
    }

    #[test]
    fn merger_respects_gap() {
        let chunks = vec![chunk("a", 0, "a0"), chunk("a", 2, "a2"), chunk("a", 5, "a5")];
        assert_eq!(ChunkMerger.merge_texts(&chunks, 1), vec!["a0", "a2", "a5"]);
        assert_eq!(ChunkMerger.merge_texts(&chunks, 2), vec!["a0\n\na2", "a5"]);
        assert_eq!(ChunkMerger.merge_texts(&chunks, 0), vec!["a0", "a2", "a5"]);
    }

    #[test]
    fn merger_keeps_unsourced_chunks_apart() {
        let mut x = chunk("a", 0, "x");
        x.metadata = ChunkMetadata::default();
        let mut y = x.clone();
        y.content = "y".to_string();
        assert_eq!(ChunkMerger.merge_texts(&[x, y], 3), vec!["x", "y"]);
    }
}
