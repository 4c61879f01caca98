use std::collections::HashMap;

use crate::{
    embedding::{EmbeddingProvider, l2_normalize},
    error::Result,
    text_util,
};

pub const DEFAULT_DIMENSIONS: usize = 384;

/// Local embedding provider that hashes terms into a fixed number of
/// buckets.
///
/// Vectors are term-frequency weighted, L2-normalized and fully
/// deterministic. Texts sharing vocabulary land close together, which is
/// enough for hybrid retrieval without a model or network access.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
    model_name: String,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_name: format!("hash-{dimensions}"),
        }
    }

    /// FNV-1a bucket for a term.
    fn bucket(&self, term: &str) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= u64::from(*b);
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % self.dimensions as u64) as usize
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let tokens: Vec<String> = text_util::tokenize(text)
            .into_iter()
            .filter(|t| !text_util::is_stop_word(t))
            .collect();
        let mut vector = vec![0.0f32; self.dimensions];
        if tokens.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.as_str()).or_default() += 1.0;
        }

        let total = tokens.len() as f32;
        for (term, count) in tf {
            // Longer terms tend to be rarer.
            let weight = 1.0 + (term.chars().count() as f32).ln();
            vector[self.bucket(term)] += count / total * weight;
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        256
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
