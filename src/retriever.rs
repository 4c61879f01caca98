//! Hybrid lexical + semantic retrieval.
//!
//! Both searches scan the whole indexed corpus for every query; there is no
//! approximate index. Hybrid retrieval runs each search for `2 * top_k`
//! candidates and fuses the two ranked lists with reciprocal rank fusion
//! (or a weighted sum of min-max normalized scores).

use std::{collections::HashMap, fmt, hash::Hash, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    bm25::{Bm25Index, DEFAULT_B, DEFAULT_K1},
    chunking::{Chunk, ChunkMetadata},
    embedding::cosine_similarity,
    error::{Error, Result},
};

pub const DEFAULT_RRF_K: f32 = 60.0;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

impl RetrievalMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
        }
    }
}

impl FromStr for RetrievalMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" | "vector" | "dense" => Ok(Self::Semantic),
            "keyword" | "bm25" | "lexical" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(Error::unsupported("retrieval method", s)),
        }
    }
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_rrf_k() -> f32 {
    DEFAULT_RRF_K
}

/// How hybrid retrieval combines the semantic and keyword lists.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Reciprocal rank fusion: `Σ 1 / (k + rank)`, ranks 1-indexed.
    Rrf {
        #[serde(default = "default_rrf_k")]
        k: f32,
    },
    /// Weighted sum of min-max normalized scores.
    Weighted {
        semantic_weight: f32,
        keyword_weight: f32,
    },
}

impl Default for FusionStrategy {
    fn default() -> Self {
        Self::Rrf { k: DEFAULT_RRF_K }
    }
}

/// One retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    /// The chunk's position within its source document.
    pub chunk_id: usize,
    /// The chunk's position in the retriever corpus.
    pub position: usize,
    pub content: String,
    pub score: f32,
    pub method: RetrievalMethod,
    pub metadata: ChunkMetadata,
}

/// Fuse ranked lists of keys with reciprocal rank fusion.
///
/// Every key scores `Σ 1 / (k + rank)` over the lists it appears in, with
/// 1-indexed ranks. The output is sorted by descending score; ties keep the
/// order in which keys were first seen.
///
/// # Examples
///
/// ```
/// use docrag::retriever::fuse_rrf;
///
/// let fused = fuse_rrf(&[vec!["A", "C"], vec!["B", "A"]], 60.0);
/// let order: Vec<&str> = fused.iter().map(|(key, _)| *key).collect();
/// assert_eq!(order, vec!["A", "B", "C"]);
/// assert!((fused[0].1 - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
/// ```
pub fn fuse_rrf<K: Eq + Hash + Clone>(
    ranked_lists: &[Vec<K>],
    k: f32,
) -> Vec<(K, f64)> {
    let mut order: Vec<K> = Vec::new();
    let mut scores: HashMap<K, f64> = HashMap::new();

    for list in ranked_lists {
        for (i, key) in list.iter().enumerate() {
            let rrf = 1.0 / (f64::from(k) + (i + 1) as f64);
            match scores.get_mut(key) {
                Some(score) => *score += rrf,
                None => {
                    order.push(key.clone());
                    scores.insert(key.clone(), rrf);
                }
            }
        }
    }

    let mut fused: Vec<(K, f64)> = order
        .into_iter()
        .map(|key| {
            let score = scores.get(&key).copied().unwrap_or_default();
            (key, score)
        })
        .collect();
    // Stable sort keeps first-seen order on ties.
    fused.sort_by(|a, b| b.1.total_cmp(&a.1));
    fused
}

/// Min-max normalize `scores` to `[0, 1]`; a constant list maps to 1.
pub fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    let (min, max) = scores
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| {
            (lo.min(s), hi.max(s))
        });
    let range = max - min;
    scores
        .iter()
        .map(|&s| if range > f64::EPSILON { (s - min) / range } else { 1.0 })
        .collect()
}

/// Weighted sum of min-max normalized scores from two ranked lists of
/// corpus positions. A position missing from a list contributes 0 there.
pub fn fuse_weighted(
    semantic: &[(usize, f64)],
    keyword: &[(usize, f64)],
    semantic_weight: f32,
    keyword_weight: f32,
) -> Vec<(usize, f64)> {
    let mut order: Vec<usize> = Vec::new();
    let mut scores: HashMap<usize, f64> = HashMap::new();

    for (list, weight) in
        [(semantic, semantic_weight), (keyword, keyword_weight)]
    {
        let raw: Vec<f64> = list.iter().map(|(_, s)| *s).collect();
        for ((position, _), norm) in list.iter().zip(min_max_normalize(&raw))
        {
            let entry = scores.entry(*position).or_insert_with(|| {
                order.push(*position);
                0.0
            });
            *entry += f64::from(weight) * norm;
        }
    }

    let mut fused: Vec<(usize, f64)> = order
        .into_iter()
        .map(|p| (p, scores.get(&p).copied().unwrap_or_default()))
        .collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1));
    fused
}

/// In-memory corpus of chunks searchable by BM25 and cosine similarity.
#[derive(Debug, Clone)]
pub struct HybridRetriever {
    chunks: Vec<Chunk>,
    embeddings: Vec<Option<Vec<f32>>>,
    bm25: Bm25Index,
    fusion: FusionStrategy,
}

impl Default for HybridRetriever {
    fn default() -> Self {
        Self::new(FusionStrategy::default(), DEFAULT_K1, DEFAULT_B)
    }
}

impl HybridRetriever {
    pub fn new(fusion: FusionStrategy, k1: f64, b: f64) -> Self {
        Self {
            chunks: Vec::new(),
            embeddings: Vec::new(),
            bm25: Bm25Index::new(k1, b),
            fusion,
        }
    }

    pub fn fusion(&self) -> FusionStrategy {
        self.fusion
    }

    pub fn set_fusion(&mut self, fusion: FusionStrategy) {
        self.fusion = fusion;
    }

    /// Replace the corpus.
    ///
    /// `embeddings` is aligned with `chunks`; a missing or `None` slot
    /// falls back to the chunk's own `metadata.embedding`.
    pub fn index(
        &mut self,
        chunks: Vec<Chunk>,
        embeddings: Vec<Option<Vec<f32>>>,
    ) {
        let mut embeddings = embeddings.into_iter();
        self.embeddings = chunks
            .iter()
            .map(|chunk| {
                embeddings
                    .next()
                    .flatten()
                    .or_else(|| chunk.metadata.embedding.clone())
            })
            .collect();

        let texts: Vec<&str> =
            chunks.iter().map(|c| c.content.as_str()).collect();
        self.bm25.fit(&texts);
        self.chunks = chunks;

        debug!(
            chunks = self.chunks.len(),
            with_vectors = self.embeddings.iter().flatten().count(),
            "indexed corpus"
        );
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Vector of the chunk at corpus `position`, if it has one.
    pub fn embedding(&self, position: usize) -> Option<&[f32]> {
        self.embeddings.get(position)?.as_deref()
    }

    /// Vectors aligned with `results`, for rerankers.
    pub fn embeddings_for(
        &self,
        results: &[RetrievalResult],
    ) -> Vec<Option<Vec<f32>>> {
        results
            .iter()
            .map(|r| self.embedding(r.position).map(<[f32]>::to_vec))
            .collect()
    }

    /// Retrieve at most `top_k` chunks for `query`, best first, dropping
    /// results scoring below `min_score`.
    ///
    /// Semantic retrieval needs `query_embedding` and returns nothing
    /// without it; hybrid retrieval degrades to keyword-only ranking.
    pub fn retrieve(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        top_k: usize,
        min_score: f32,
        method: RetrievalMethod,
    ) -> Vec<RetrievalResult> {
        if top_k == 0 || self.is_empty() {
            return Vec::new();
        }

        let ranked: Vec<(usize, f64)> = match method {
            RetrievalMethod::Semantic => match query_embedding {
                Some(q) => self.semantic_ranked(q, top_k),
                None => {
                    debug!("semantic retrieval without a query vector");
                    Vec::new()
                }
            },
            RetrievalMethod::Keyword => self.bm25.top_n(query, top_k),
            RetrievalMethod::Hybrid => {
                let fetch = top_k.saturating_mul(2);
                let semantic = query_embedding
                    .map(|q| self.semantic_ranked(q, fetch))
                    .unwrap_or_default();
                let keyword = self.bm25.top_n(query, fetch);
                let mut fused = self.fuse(&semantic, &keyword);
                fused.truncate(top_k);
                fused
            }
        };

        let results: Vec<RetrievalResult> = ranked
            .into_iter()
            .take(top_k)
            .filter(|(_, score)| *score as f32 >= min_score)
            .map(|(position, score)| {
                self.result(position, score as f32, method)
            })
            .collect();

        debug!(
            method = %method,
            top_k,
            returned = results.len(),
            "retrieved"
        );
        results
    }

    fn fuse(
        &self,
        semantic: &[(usize, f64)],
        keyword: &[(usize, f64)],
    ) -> Vec<(usize, f64)> {
        match self.fusion {
            FusionStrategy::Rrf { k } => {
                let lists: Vec<Vec<usize>> = [semantic, keyword]
                    .into_iter()
                    .filter(|list| !list.is_empty())
                    .map(|list| list.iter().map(|(p, _)| *p).collect())
                    .collect();
                fuse_rrf(&lists, k)
            }
            FusionStrategy::Weighted {
                semantic_weight,
                keyword_weight,
            } => fuse_weighted(
                semantic,
                keyword,
                semantic_weight,
                keyword_weight,
            ),
        }
    }

    /// Chunks ranked by `(cos + 1) / 2`; chunks without a vector of the
    /// query's length are skipped.
    fn semantic_ranked(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Vec<(usize, f64)> {
        let mut ranked: Vec<(usize, f64)> = self
            .embeddings
            .iter()
            .enumerate()
            .filter_map(|(i, vector)| {
                let vector = vector.as_deref()?;
                (vector.len() == query.len()).then(|| {
                    let cos = cosine_similarity(query, vector);
                    (i, f64::from((cos + 1.0) / 2.0))
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    fn result(
        &self,
        position: usize,
        score: f32,
        method: RetrievalMethod,
    ) -> RetrievalResult {
        let chunk = &self.chunks[position];
        RetrievalResult {
            chunk_id: chunk.chunk_id,
            position,
            content: chunk.content.clone(),
            score,
            method,
            metadata: chunk.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(i: usize, content: &str) -> Chunk {
        Chunk {
            content: content.to_string(),
            chunk_id: i,
            start_char: 0,
            end_char: content.chars().count(),
            metadata: ChunkMetadata::default(),
        }
    }

    fn pets() -> HybridRetriever {
        let chunks = vec![
            chunk(0, "The cat sat on the mat."),
            chunk(1, "The dog ran in the park."),
            chunk(2, "Cats and dogs are pets."),
        ];
        let embeddings = vec![
            Some(vec![1.0, 0.0, 0.0]),
            Some(vec![0.0, 1.0, 0.0]),
            Some(vec![0.5, 0.5, 0.7]),
        ];
        let mut retriever = HybridRetriever::default();
        retriever.index(chunks, embeddings);
        retriever
    }

    fn positions(results: &[RetrievalResult]) -> Vec<usize> {
        results.iter().map(|r| r.position).collect()
    }

    #[test]
    fn rrf_rewards_agreement_across_lists() {
        let fused = fuse_rrf(&[vec!['A', 'C'], vec!['B', 'A']], 60.0);
        let score = |key| fused.iter().find(|(k, _)| *k == key).unwrap().1;

        assert_eq!(score('A'), 1.0 / 61.0 + 1.0 / 62.0);
        assert_eq!(score('B'), 1.0 / 61.0);
        assert_eq!(score('C'), 1.0 / 62.0);
        assert!(score('A') > score('B'));
        assert!(score('B') > score('C'));
        assert_eq!(
            fused.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            vec!['A', 'B', 'C']
        );
    }

    #[test]
    fn rrf_ties_keep_first_seen_order() {
        let fused = fuse_rrf(&[vec![3, 1], vec![1, 3]], 60.0);
        assert_eq!(fused[0].0, 3);
        assert_eq!(fused[1].0, 1);
    }

    #[test]
    fn keyword_retrieval_finds_cat() {
        let results = pets().retrieve("cat", None, 3, 0.0, RetrievalMethod::Keyword);
        assert_eq!(positions(&results), vec![0]);
        assert_eq!(results[0].method, RetrievalMethod::Keyword);
    }

    #[test]
    fn semantic_scores_are_rescaled_cosine() {
        let results = pets().retrieve(
            "ignored",
            Some(&[1.0, 0.0, 0.0]),
            3,
            0.0,
            RetrievalMethod::Semantic,
        );
        assert_eq!(results[0].position, 0);
        assert!((results[0].score - 1.0).abs() < 1e-6);
        // Orthogonal vector: cos = 0 -> 0.5
        let dog = results.iter().find(|r| r.position == 1).unwrap();
        assert!((dog.score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn semantic_without_query_vector_is_empty() {
        let results =
            pets().retrieve("cat", None, 3, 0.0, RetrievalMethod::Semantic);
        assert!(results.is_empty());
    }

    #[test]
    fn hybrid_keeps_agreed_document_first() {
        let results = pets().retrieve(
            "cat",
            Some(&[1.0, 0.0, 0.0]),
            3,
            0.0,
            RetrievalMethod::Hybrid,
        );
        assert_eq!(results[0].position, 0);
        assert!((results[0].score - (2.0 / 61.0)).abs() < 1e-6);
        assert_eq!(results[0].method, RetrievalMethod::Hybrid);
    }

    #[test]
    fn hybrid_without_vector_degrades_to_keyword() {
        let results =
            pets().retrieve("cat", None, 3, 0.0, RetrievalMethod::Hybrid);
        assert_eq!(positions(&results), vec![0]);
        assert!((results[0].score - 1.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn min_score_filters_results() {
        let results = pets().retrieve(
            "x",
            Some(&[1.0, 0.0, 0.0]),
            3,
            0.9,
            RetrievalMethod::Semantic,
        );
        assert_eq!(positions(&results), vec![0]);
    }

    #[test]
    fn chunks_without_vectors_are_skipped() {
        let mut retriever = HybridRetriever::default();
        retriever.index(
            vec![chunk(0, "alpha"), chunk(1, "beta"), chunk(2, "gamma")],
            vec![Some(vec![1.0, 0.0]), None, Some(vec![1.0])],
        );
        let results = retriever.retrieve(
            "q",
            Some(&[1.0, 0.0]),
            5,
            0.0,
            RetrievalMethod::Semantic,
        );
        assert_eq!(positions(&results), vec![0]);
    }

    #[test]
    fn index_falls_back_to_metadata_embedding() {
        let mut with_meta = chunk(0, "alpha");
        with_meta.metadata.embedding = Some(vec![0.0, 1.0]);
        let mut retriever = HybridRetriever::default();
        retriever.index(vec![with_meta, chunk(1, "beta")], Vec::new());

        assert_eq!(retriever.embedding(0), Some(&[0.0, 1.0][..]));
        assert_eq!(retriever.embedding(1), None);
    }

    #[test]
    fn top_k_truncates() {
        let results = pets().retrieve(
            "x",
            Some(&[1.0, 1.0, 1.0]),
            2,
            0.0,
            RetrievalMethod::Semantic,
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn weighted_fusion_combines_normalized_scores() {
        let mut retriever = pets();
        retriever.set_fusion(FusionStrategy::Weighted {
            semantic_weight: 0.5,
            keyword_weight: 0.5,
        });
        let results = retriever.retrieve(
            "cat",
            Some(&[1.0, 0.0, 0.0]),
            3,
            0.0,
            RetrievalMethod::Hybrid,
        );
        assert_eq!(results[0].position, 0);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn embeddings_for_aligns_with_results() {
        let retriever = pets();
        let results =
            retriever.retrieve("cat", None, 3, 0.0, RetrievalMethod::Keyword);
        let vectors = retriever.embeddings_for(&results);
        assert_eq!(vectors, vec![Some(vec![1.0, 0.0, 0.0])]);
    }

    #[test]
    fn method_names_parse() {
        assert_eq!("bm25".parse::<RetrievalMethod>().unwrap(), RetrievalMethod::Keyword);
        assert!("fuzzy".parse::<RetrievalMethod>().is_err());
    }
}
