//! Okapi BM25 over a fixed in-memory corpus.
//!
//! Scoring is a linear scan over every document per query. Tokenization is
//! [`text_util::tokenize`], shared by indexing and querying.

use std::collections::HashMap;

use crate::text_util;

pub const DEFAULT_K1: f64 = 1.5;
pub const DEFAULT_B: f64 = 0.75;

#[derive(Debug, Clone)]
pub struct Bm25Index {
    k1: f64,
    b: f64,
    /// Term frequencies per document.
    doc_terms: Vec<HashMap<String, u32>>,
    doc_lens: Vec<usize>,
    avgdl: f64,
    /// Document frequency per term.
    df: HashMap<String, usize>,
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new(DEFAULT_K1, DEFAULT_B)
    }
}

impl Bm25Index {
    pub fn new(k1: f64, b: f64) -> Self {
        Self {
            k1,
            b,
            doc_terms: Vec::new(),
            doc_lens: Vec::new(),
            avgdl: 0.0,
            df: HashMap::new(),
        }
    }

    /// Index `corpus`, replacing whatever was indexed before.
    pub fn fit<S: AsRef<str>>(&mut self, corpus: &[S]) {
        self.doc_terms.clear();
        self.doc_lens.clear();
        self.df.clear();

        for doc in corpus {
            let tokens = text_util::tokenize(doc.as_ref());
            self.doc_lens.push(tokens.len());

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_default() += 1;
            }
            for term in tf.keys() {
                *self.df.entry(term.clone()).or_default() += 1;
            }
            self.doc_terms.push(tf);
        }

        let total: usize = self.doc_lens.iter().sum();
        self.avgdl = if self.doc_lens.is_empty() {
            0.0
        } else {
            total as f64 / self.doc_lens.len() as f64
        };
    }

    pub fn len(&self) -> usize {
        self.doc_terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_terms.is_empty()
    }

    /// `ln((N - df + 0.5) / (df + 0.5) + 1)`, always positive.
    fn idf(&self, term: &str) -> f64 {
        let n = self.len() as f64;
        let df = self.df.get(term).copied().unwrap_or(0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Score every document against `query`, in corpus order.
    ///
    /// Repeated query terms count once per occurrence.
    pub fn score(&self, query: &str) -> Vec<f64> {
        let mut scores = vec![0.0; self.len()];
        if self.is_empty() || self.avgdl == 0.0 {
            return scores;
        }

        for term in text_util::tokenize(query) {
            if !self.df.contains_key(&term) {
                continue;
            }
            let idf = self.idf(&term);
            for (i, tf_map) in self.doc_terms.iter().enumerate() {
                let Some(&tf) = tf_map.get(&term) else {
                    continue;
                };
                let tf = f64::from(tf);
                let norm = 1.0 - self.b
                    + self.b * self.doc_lens[i] as f64 / self.avgdl;
                scores[i] += idf * tf * (self.k1 + 1.0) / (tf + self.k1 * norm);
            }
        }
        scores
    }

    /// The `n` best `(index, score)` pairs with a positive score, best
    /// first; ties go to the lower index.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrag::bm25::Bm25Index;
    ///
    /// let mut index = Bm25Index::default();
    /// index.fit(&["The cat sat on the mat.", "The dog ran in the park."]);
    /// let top = index.top_n("cat", 5);
    /// assert_eq!(top.len(), 1);
    /// assert_eq!(top[0].0, 0);
    /// ```
    pub fn top_n(&self, query: &str, n: usize) -> Vec<(usize, f64)> {
        let mut ranked: Vec<(usize, f64)> = self
            .score(query)
            .into_iter()
            .enumerate()
            .filter(|(_, s)| *s > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const CORPUS: [&str; 3] = [
        "The cat sat on the mat.",
        "The dog ran in the park.",
        "Cats and dogs are pets.",
    ];

    fn fitted() -> Bm25Index {
        let mut index = Bm25Index::default();
        index.fit(&CORPUS);
        index
    }

    #[test]
    fn cat_query_ranks_first_document() {
        let top = fitted().top_n("cat", 3);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, 0);
        assert!(top[0].1 > 0.0);
    }

    #[test]
    fn matches_reference_formula() {
        let index = fitted();
        // "park": df = 1, N = 3, doc 1 has 6 tokens, avgdl = 17 / 3.
        let idf = ((3.0 - 1.0 + 0.5) / (1.0 + 0.5) + 1.0f64).ln();
        let norm = 1.0 - 0.75 + 0.75 * 6.0 / (17.0 / 3.0);
        let expected = idf * 2.5 / (1.0 + 1.5 * norm);
        let scores = index.score("park");
        assert!((scores[1] - expected).abs() < 1e-12);
        assert_eq!(scores[0], 0.0);
    }

    #[test]
    fn tokenization_is_case_insensitive() {
        let index = fitted();
        assert_eq!(index.score("PARK"), index.score("park"));
    }

    #[test]
    fn empty_corpus_and_query() {
        let index = Bm25Index::default();
        assert!(index.score("anything").is_empty());
        assert!(index.top_n("anything", 3).is_empty());

        let index = fitted();
        assert_eq!(index.score(""), vec![0.0; 3]);
        assert!(index.top_n("zebra", 3).is_empty());
    }

    #[test]
    fn ties_break_by_index() {
        let mut index = Bm25Index::default();
        index.fit(&["same words", "other text", "same words"]);
        let top = index.top_n("same", 5);
        assert_eq!(top.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn refit_replaces_corpus() {
        let mut index = fitted();
        index.fit(&["only one"]);
        assert_eq!(index.len(), 1);
        assert!(index.top_n("cat", 3).is_empty());
    }

    proptest! {
        #[test]
        fn scoring_is_deterministic(
            corpus in prop::collection::vec("[a-d ]{0,40}", 0..8),
            query in "[a-d ]{0,12}",
        ) {
            let mut a = Bm25Index::default();
            a.fit(&corpus);
            let mut b = Bm25Index::default();
            b.fit(&corpus);

            let first = a.score(&query);
            prop_assert_eq!(&first, &a.score(&query));
            prop_assert_eq!(
                first.iter().map(|s| s.to_bits()).collect::<Vec<_>>(),
                b.score(&query).iter().map(|s| s.to_bits()).collect::<Vec<_>>()
            );
            prop_assert!(first.iter().all(|s| *s >= 0.0));
        }
    }
}
