//! Second-stage reordering of retrieval results.
//!
//! Every [`Reranker`] takes the retrieved pool and returns at most `top_k`
//! results with fresh 0-based ranks. MMR trades relevance against
//! similarity to what was already picked; the others rescore by lexical
//! and file-level signals.

use std::{collections::HashMap, fmt, str::FromStr};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    chunking::ChunkMetadata,
    config::RerankConfig,
    embedding::cosine_similarity,
    error::{Error, Result},
    retriever::RetrievalResult,
    text_util,
};

/// A retrieval result after reranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub chunk_id: usize,
    /// Position in the retriever corpus.
    pub position: usize,
    pub content: String,
    pub original_score: f32,
    pub reranked_score: f32,
    /// 0-based position in the reranked list.
    pub rank: usize,
    pub metadata: ChunkMetadata,
}

impl RankedResult {
    fn from_result(result: &RetrievalResult, score: f32, rank: usize) -> Self {
        Self {
            chunk_id: result.chunk_id,
            position: result.position,
            content: result.content.clone(),
            original_score: result.score,
            reranked_score: score,
            rank,
            metadata: result.metadata.clone(),
        }
    }
}

/// Reorders retrieval results.
///
/// `embeddings` is aligned with `results`; any slot may be `None`.
pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;

    /// One score per input result, higher is better.
    fn scores(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        embeddings: &[Option<Vec<f32>>],
    ) -> Vec<f32>;

    /// Sort by [`scores`](Self::scores), keep the best `top_k`, assign
    /// ranks. Ties keep input order.
    fn rerank(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        embeddings: &[Option<Vec<f32>>],
        top_k: usize,
    ) -> Vec<RankedResult> {
        let scores = self.scores(query, query_embedding, results, embeddings);
        let ranked = rank_by_scores(results, &scores, top_k);
        debug!(
            reranker = self.name(),
            candidates = results.len(),
            kept = ranked.len(),
            "reranked"
        );
        ranked
    }
}

/// Stable descending sort of `results` by `scores`, truncated to `top_k`.
/// Missing scores count as 0.
pub fn rank_by_scores(
    results: &[RetrievalResult],
    scores: &[f32],
    top_k: usize,
) -> Vec<RankedResult> {
    let score_of = |i: usize| scores.get(i).copied().unwrap_or(0.0);
    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by(|&a, &b| score_of(b).total_cmp(&score_of(a)));
    order
        .into_iter()
        .take(top_k)
        .enumerate()
        .map(|(rank, i)| {
            RankedResult::from_result(&results[i], score_of(i), rank)
        })
        .collect()
}

/// Min-max normalize to `[0, 1]`; a constant list maps to 1.
fn normalize(scores: &[f32]) -> Vec<f32> {
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    scores
        .iter()
        .map(|&s| if range > f32::EPSILON { (s - min) / range } else { 1.0 })
        .collect()
}

fn original_scores(results: &[RetrievalResult]) -> Vec<f32> {
    results.iter().map(|r| r.score).collect()
}

/// Keeps the retrieval order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReranker;

impl Reranker for NoopReranker {
    fn name(&self) -> &'static str {
        "none"
    }

    fn scores(
        &self,
        _query: &str,
        _query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        _embeddings: &[Option<Vec<f32>>],
    ) -> Vec<f32> {
        original_scores(results)
    }

    fn rerank(
        &self,
        _query: &str,
        _query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        _embeddings: &[Option<Vec<f32>>],
        top_k: usize,
    ) -> Vec<RankedResult> {
        results
            .iter()
            .take(top_k)
            .enumerate()
            .map(|(rank, r)| RankedResult::from_result(r, r.score, rank))
            .collect()
    }
}

/// Maximal marginal relevance.
///
/// Greedily picks the candidate maximizing
/// `λ·relevance − (1−λ)·max_similarity_to_selected`. Relevance is the
/// cosine between query and candidate vectors when both exist, otherwise
/// the min-max normalized retrieval score. Similarity to the selected set
/// is 0 for candidates without a vector.
#[derive(Debug, Clone, Copy)]
pub struct MmrReranker {
    pub lambda: f32,
}

impl Default for MmrReranker {
    fn default() -> Self {
        Self { lambda: 0.5 }
    }
}

impl MmrReranker {
    pub fn new(lambda: f32) -> Self {
        Self {
            lambda: lambda.clamp(0.0, 1.0),
        }
    }

    /// Selection order with the MMR value of each pick.
    fn select(
        &self,
        query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        embeddings: &[Option<Vec<f32>>],
        top_k: usize,
    ) -> Vec<(usize, f32)> {
        let fallback = normalize(&original_scores(results));
        let vector = |i: usize| embeddings.get(i).and_then(|v| v.as_deref());
        let relevance: Vec<f32> = (0..results.len())
            .map(|i| match (query_embedding, vector(i)) {
                (Some(q), Some(v)) if q.len() == v.len() => {
                    cosine_similarity(q, v)
                }
                _ => fallback[i],
            })
            .collect();

        let mut remaining: Vec<usize> = (0..results.len()).collect();
        let mut selected: Vec<(usize, f32)> = Vec::new();

        while selected.len() < top_k && !remaining.is_empty() {
            let mut best: Option<(usize, f32)> = None;
            for (slot, &i) in remaining.iter().enumerate() {
                let redundancy = vector(i).map_or(0.0, |v| {
                    selected
                        .iter()
                        .filter_map(|&(j, _)| vector(j))
                        .map(|s| cosine_similarity(v, s))
                        .fold(0.0, f32::max)
                });
                let score = self.lambda * relevance[i]
                    - (1.0 - self.lambda) * redundancy;

                let better = match best {
                    None => true,
                    Some((best_slot, best_score)) => {
                        let best_i = remaining[best_slot];
                        score > best_score
                            || (score == best_score
                                && relevance[i] > relevance[best_i])
                    }
                };
                if better {
                    best = Some((slot, score));
                }
            }

            let Some((slot, score)) = best else { break };
            selected.push((remaining.remove(slot), score));
        }

        selected
    }
}

impl Reranker for MmrReranker {
    fn name(&self) -> &'static str {
        "mmr"
    }

    /// Positional scores `(n - rank) / n` from the full MMR ordering.
    fn scores(
        &self,
        _query: &str,
        query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        embeddings: &[Option<Vec<f32>>],
    ) -> Vec<f32> {
        let n = results.len();
        let mut scores = vec![0.0; n];
        for (rank, (i, _)) in self
            .select(query_embedding, results, embeddings, n)
            .into_iter()
            .enumerate()
        {
            scores[i] = (n - rank) as f32 / n as f32;
        }
        scores
    }

    fn rerank(
        &self,
        _query: &str,
        query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        embeddings: &[Option<Vec<f32>>],
        top_k: usize,
    ) -> Vec<RankedResult> {
        let ranked: Vec<RankedResult> = self
            .select(query_embedding, results, embeddings, top_k)
            .into_iter()
            .enumerate()
            .map(|(rank, (i, score))| {
                RankedResult::from_result(&results[i], score, rank)
            })
            .collect();
        debug!(
            reranker = "mmr",
            lambda = self.lambda,
            candidates = results.len(),
            kept = ranked.len(),
            "reranked"
        );
        ranked
    }
}

/// Boosts chunks whose source file contributes several well-scoring
/// results.
#[derive(Debug, Clone, Copy)]
pub struct ContextualReranker {
    pub bonus: f32,
    pub threshold: f32,
    pub min_chunks: usize,
}

impl Default for ContextualReranker {
    fn default() -> Self {
        Self {
            bonus: 0.1,
            threshold: 0.5,
            min_chunks: 2,
        }
    }
}

impl Reranker for ContextualReranker {
    fn name(&self) -> &'static str {
        "contextual"
    }

    fn scores(
        &self,
        _query: &str,
        _query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        _embeddings: &[Option<Vec<f32>>],
    ) -> Vec<f32> {
        let base = normalize(&original_scores(results));

        let mut groups: HashMap<&str, (usize, f32)> = HashMap::new();
        for (result, score) in results.iter().zip(&base) {
            if let Some(key) = result.metadata.source_key() {
                let entry = groups.entry(key).or_default();
                entry.0 += 1;
                entry.1 += score;
            }
        }

        results
            .iter()
            .zip(base)
            .map(|(result, score)| {
                let boosted = result
                    .metadata
                    .source_key()
                    .and_then(|key| groups.get(key))
                    .is_some_and(|&(count, total)| {
                        count >= self.min_chunks
                            && total / count as f32 >= self.threshold
                    });
                if boosted { score + self.bonus } else { score }
            })
            .collect()
    }
}

/// Deterministic stand-in for a cross-encoder: token overlap, an exact
/// phrase bonus and a penalty for very short chunks.
///
/// `0.6·overlap + 0.3·exact_phrase − 0.1·(1 − min(tokens, 64) / 64)`
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicReranker;

const HEURISTIC_FULL_LENGTH: usize = 64;

impl HeuristicReranker {
    pub fn score_one(query: &str, content: &str) -> f32 {
        let mut query_tokens = text_util::tokenize(query);
        query_tokens.sort_unstable();
        query_tokens.dedup();

        let doc_tokens = text_util::tokenize(content);
        let overlap = if query_tokens.is_empty() {
            0.0
        } else {
            let hits = query_tokens
                .iter()
                .filter(|t| doc_tokens.contains(t))
                .count();
            hits as f32 / query_tokens.len() as f32
        };

        let phrase = query.trim().to_lowercase();
        let exact = if !phrase.is_empty()
            && content.to_lowercase().contains(&phrase)
        {
            1.0
        } else {
            0.0
        };

        let length_ratio = doc_tokens.len().min(HEURISTIC_FULL_LENGTH) as f32
            / HEURISTIC_FULL_LENGTH as f32;

        0.6 * overlap + 0.3 * exact - 0.1 * (1.0 - length_ratio)
    }
}

impl Reranker for HeuristicReranker {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn scores(
        &self,
        query: &str,
        _query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        _embeddings: &[Option<Vec<f32>>],
    ) -> Vec<f32> {
        results
            .par_iter()
            .map(|r| Self::score_one(query, &r.content))
            .collect()
    }
}

/// Relative weights of the ensemble components. A zero weight disables
/// the component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleWeights {
    pub mmr: f32,
    pub contextual: f32,
    pub heuristic: f32,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            mmr: 0.4,
            contextual: 0.3,
            heuristic: 0.3,
        }
    }
}

/// Linear combination of other rerankers' min-max normalized scores.
pub struct EnsembleReranker {
    components: Vec<(Box<dyn Reranker>, f32)>,
}

impl EnsembleReranker {
    /// Weights are normalized to sum to 1 (equal weights if they sum to 0).
    pub fn new(components: Vec<(Box<dyn Reranker>, f32)>) -> Self {
        let total: f32 = components.iter().map(|(_, w)| w.max(0.0)).sum();
        let count = components.len().max(1) as f32;
        let components = components
            .into_iter()
            .map(|(reranker, w)| {
                let weight = if total > f32::EPSILON {
                    w.max(0.0) / total
                } else {
                    1.0 / count
                };
                (reranker, weight)
            })
            .collect();
        Self { components }
    }

    pub fn weights(&self) -> Vec<(&'static str, f32)> {
        self.components
            .iter()
            .map(|(r, w)| (r.name(), *w))
            .collect()
    }
}

impl Reranker for EnsembleReranker {
    fn name(&self) -> &'static str {
        "ensemble"
    }

    fn scores(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        embeddings: &[Option<Vec<f32>>],
    ) -> Vec<f32> {
        let mut combined = vec![0.0; results.len()];
        for (reranker, weight) in &self.components {
            let scores = normalize(&reranker.scores(
                query,
                query_embedding,
                results,
                embeddings,
            ));
            for (slot, score) in combined.iter_mut().zip(scores) {
                *slot += weight * score;
            }
        }
        combined
    }
}

impl fmt::Debug for EnsembleReranker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnsembleReranker")
            .field("weights", &self.weights())
            .finish()
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RerankMethod {
    None,
    #[default]
    Mmr,
    Contextual,
    Heuristic,
    Ensemble,
}

impl RerankMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mmr => "mmr",
            Self::Contextual => "contextual",
            Self::Heuristic => "heuristic",
            Self::Ensemble => "ensemble",
        }
    }
}

impl FromStr for RerankMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "off" => Ok(Self::None),
            "mmr" => Ok(Self::Mmr),
            "contextual" => Ok(Self::Contextual),
            "heuristic" | "cross_encoder" => Ok(Self::Heuristic),
            "ensemble" => Ok(Self::Ensemble),
            _ => Err(Error::unsupported("rerank method", s)),
        }
    }
}

impl fmt::Display for RerankMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the reranker for `method` from its configuration.
pub fn build_reranker(
    method: RerankMethod,
    config: &RerankConfig,
) -> Box<dyn Reranker> {
    let contextual = ContextualReranker {
        bonus: config.contextual_bonus,
        threshold: config.contextual_threshold,
        min_chunks: config.contextual_min_chunks,
    };
    match method {
        RerankMethod::None => Box::new(NoopReranker),
        RerankMethod::Mmr => Box::new(MmrReranker::new(config.mmr_lambda)),
        RerankMethod::Contextual => Box::new(contextual),
        RerankMethod::Heuristic => Box::new(HeuristicReranker),
        RerankMethod::Ensemble => {
            let w = config.ensemble_weights;
            let candidates: Vec<(Box<dyn Reranker>, f32)> = vec![
                (Box::new(MmrReranker::new(config.mmr_lambda)), w.mmr),
                (Box::new(contextual), w.contextual),
                (Box::new(HeuristicReranker), w.heuristic),
            ];
            let enabled: Vec<_> =
                candidates.into_iter().filter(|(_, w)| *w > 0.0).collect();
            Box::new(EnsembleReranker::new(enabled))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::RetrievalMethod;

    fn result(position: usize, content: &str, score: f32) -> RetrievalResult {
        RetrievalResult {
            chunk_id: position,
            position,
            content: content.to_string(),
            score,
            method: RetrievalMethod::Hybrid,
            metadata: ChunkMetadata::default(),
        }
    }

    fn with_file(mut r: RetrievalResult, file: &str) -> RetrievalResult {
        r.metadata.file_id = Some(file.to_string());
        r
    }

    fn order(ranked: &[RankedResult]) -> Vec<usize> {
        ranked.iter().map(|r| r.position).collect()
    }

    #[test]
    fn mmr_lambda_one_is_pure_relevance() {
        let query = [1.0, 0.0];
        let embeddings = vec![
            Some(vec![0.2, 1.0]),
            Some(vec![1.0, 0.1]),
            Some(vec![1.0, 0.5]),
            Some(vec![1.0, 0.0]),
        ];
        let results: Vec<_> =
            (0..4).map(|i| result(i, "text", 0.5)).collect();

        let ranked = MmrReranker::new(1.0).rerank(
            "q",
            Some(&query),
            &results,
            &embeddings,
            4,
        );

        let mut by_cosine: Vec<usize> = (0..4).collect();
        by_cosine.sort_by(|&a, &b| {
            let ca = cosine_similarity(&query, embeddings[a].as_ref().unwrap());
            let cb = cosine_similarity(&query, embeddings[b].as_ref().unwrap());
            cb.total_cmp(&ca)
        });
        assert_eq!(order(&ranked), by_cosine);
        assert_eq!(order(&ranked), vec![3, 1, 2, 0]);
    }

    #[test]
    fn mmr_lambda_zero_prefers_distinct_candidate() {
        let query = [1.0, 0.0, 0.0];
        let embeddings = vec![
            Some(vec![1.0, 0.0, 0.0]),
            Some(vec![0.99, 0.01, 0.0]),
            Some(vec![0.3, 0.0, 0.95]),
        ];
        let results = vec![
            result(0, "dup a", 0.9),
            result(1, "dup b", 0.89),
            result(2, "other", 0.4),
        ];

        let ranked = MmrReranker::new(0.0).rerank(
            "q",
            Some(&query),
            &results,
            &embeddings,
            3,
        );
        let picked = order(&ranked);
        let distinct = picked.iter().position(|&p| p == 2).unwrap();
        let second_dup = picked.iter().rposition(|&p| p < 2).unwrap();
        assert!(distinct < second_dup, "{picked:?}");
    }

    #[test]
    fn mmr_without_vectors_uses_retrieval_scores() {
        let results = vec![
            result(0, "a", 0.2),
            result(1, "b", 0.9),
            result(2, "c", 0.5),
        ];
        let ranked =
            MmrReranker::new(0.7).rerank("q", None, &results, &[], 3);
        assert_eq!(order(&ranked), vec![1, 2, 0]);
        assert_eq!(
            ranked.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn mmr_positional_scores() {
        let results = vec![result(0, "a", 0.1), result(1, "b", 0.9)];
        let scores = MmrReranker::default().scores("q", None, &results, &[]);
        assert_eq!(scores, vec![0.5, 1.0]);
    }

    #[test]
    fn contextual_boosts_confident_files() {
        let results = vec![
            with_file(result(0, "a", 1.0), "f1"),
            with_file(result(1, "b", 0.8), "f1"),
            with_file(result(2, "c", 0.9), "f2"),
            result(3, "d", 0.0),
        ];
        let scores =
            ContextualReranker::default().scores("q", None, &results, &[]);
        // base: [1.0, 0.8, 0.9, 0.0]; f1 has 2 chunks averaging 0.9.
        assert!((scores[0] - 1.1).abs() < 1e-6);
        assert!((scores[1] - 0.9).abs() < 1e-6);
        assert!((scores[2] - 0.9).abs() < 1e-6);
        assert_eq!(scores[3], 0.0);
    }

    #[test]
    fn heuristic_prefers_exact_phrase_and_overlap() {
        let results = vec![
            result(0, "nothing relevant here", 0.9),
            result(1, "the quick brown fox jumps", 0.1),
            result(2, "a fox that is brown", 0.1),
        ];
        let ranked =
            HeuristicReranker.rerank("brown fox", None, &results, &[], 3);
        assert_eq!(order(&ranked), vec![1, 2, 0]);
    }

    #[test]
    fn heuristic_formula() {
        // 2/2 overlap, exact phrase, 2 tokens -> penalty 0.1 * (1 - 2/64)
        let score = HeuristicReranker::score_one("brown fox", "brown fox");
        let expected = 0.6 + 0.3 - 0.1 * (1.0 - 2.0 / 64.0);
        assert!((score - expected).abs() < 1e-6);
    }

    #[test]
    fn ensemble_normalizes_weights() {
        let ensemble = EnsembleReranker::new(vec![
            (Box::new(HeuristicReranker), 2.0),
            (Box::new(NoopReranker), 2.0),
        ]);
        let weights: Vec<f32> = ensemble.weights().iter().map(|(_, w)| *w).collect();
        assert_eq!(weights, vec![0.5, 0.5]);

        let zero = EnsembleReranker::new(vec![
            (Box::new(HeuristicReranker), 0.0),
            (Box::new(NoopReranker), 0.0),
        ]);
        assert_eq!(zero.weights()[0].1, 0.5);
    }

    #[test]
    fn ensemble_combines_normalized_components() {
        let results = vec![result(0, "alpha", 0.0), result(1, "beta", 10.0)];
        let ensemble = EnsembleReranker::new(vec![(Box::new(NoopReranker), 1.0)]);
        let scores = ensemble.scores("q", None, &results, &[]);
        assert_eq!(scores, vec![0.0, 1.0]);
    }

    #[test]
    fn ranks_are_strict_and_ties_stable() {
        let results = vec![
            result(0, "x", 0.5),
            result(1, "y", 0.5),
            result(2, "z", 0.5),
        ];
        let ranked = rank_by_scores(&results, &[0.5, 0.5, 0.5], 2);
        assert_eq!(order(&ranked), vec![0, 1]);
        assert_eq!(ranked[1].rank, 1);
    }

    #[test]
    fn noop_keeps_order() {
        let results = vec![result(0, "x", 0.1), result(1, "y", 0.9)];
        let ranked = NoopReranker.rerank("q", None, &results, &[], 5);
        assert_eq!(order(&ranked), vec![0, 1]);
        assert_eq!(ranked[1].reranked_score, 0.9);
    }

    #[test]
    fn build_reranker_honors_method_and_weights() {
        let mut config = RerankConfig::default();
        assert_eq!(build_reranker(RerankMethod::Mmr, &config).name(), "mmr");
        assert_eq!(build_reranker(RerankMethod::None, &config).name(), "none");

        config.ensemble_weights.contextual = 0.0;
        let ensemble = build_reranker(RerankMethod::Ensemble, &config);
        assert_eq!(ensemble.name(), "ensemble");
        let results = vec![result(0, "fox", 0.1), result(1, "dog", 0.9)];
        assert_eq!(ensemble.scores("fox", None, &results, &[]).len(), 2);
    }

    #[test]
    fn method_names_parse() {
        assert_eq!("cross-encoder".parse::<RerankMethod>().unwrap(), RerankMethod::Heuristic);
        assert!("colbert".parse::<RerankMethod>().is_err());
    }
}
