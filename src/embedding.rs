//! Text embedding with a content-addressed cache.
//!
//! [`Embedder`] never fails a whole batch: blank inputs, provider errors
//! and malformed vectors all come back as `None` in the affected slots.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    chunking::Chunk,
    config::EmbeddingConfig,
    embedding_cache::EmbeddingCache,
    error::{Error, Result},
    hash_embedder::HashEmbedder,
    remote_embedder::RemoteEmbedder,
};

/// Something that turns texts into fixed-length vectors.
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier; part of every cache key.
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Largest batch the provider accepts in one call.
    fn max_batch_size(&self) -> usize {
        64
    }

    /// Embed `texts`, returning one vector per input in order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

/// Which [`EmbeddingProvider`] to build.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Local feature-hashing embedder.
    #[default]
    Hash,
    /// OpenAI-compatible HTTP API.
    Remote,
    /// Local ColBERT model (requires the `colbert` feature).
    Colbert,
}

impl EmbeddingBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hash => "hash",
            Self::Remote => "remote",
            Self::Colbert => "colbert",
        }
    }
}

impl FromStr for EmbeddingBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hash" | "local" => Ok(Self::Hash),
            "remote" | "openai" | "api" => Ok(Self::Remote),
            "colbert" => Ok(Self::Colbert),
            _ => Err(Error::unsupported("embedding backend", s)),
        }
    }
}

impl fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the provider selected by `config`.
pub fn build_provider(
    config: &EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.backend {
        EmbeddingBackend::Hash => Ok(Box::new(HashEmbedder::new(
            config.dimensions,
        ))),
        EmbeddingBackend::Remote => {
            let mut provider = RemoteEmbedder::new(&config.url)?
                .with_batch_size(config.batch_size)
                .with_timeout(Duration::from_secs(config.timeout_secs))
                .with_api_key_env(&config.api_key_env);
            if let Some(model) = &config.model {
                provider = provider.with_model(model);
            }
            Ok(Box::new(provider.with_dimensions(config.dimensions)))
        }
        #[cfg(feature = "colbert")]
        EmbeddingBackend::Colbert => {
            let mut provider = crate::model_manager::ColbertEmbedder::new();
            if let Some(model) = &config.model {
                provider = provider.with_model_id(model.clone());
            }
            Ok(Box::new(provider))
        }
        #[cfg(not(feature = "colbert"))]
        EmbeddingBackend::Colbert => Err(Error::Config(
            "the colbert backend requires building with --features colbert"
                .to_string(),
        )),
    }
}

/// Cosine similarity of two vectors; 0 when either is empty, zero or the
/// lengths differ.
///
/// # Examples
///
/// ```
/// use docrag::embedding::cosine_similarity;
///
/// assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
/// assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
/// assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Scale `v` to unit length in place (zero vectors are left alone).
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v {
            *x /= norm;
        }
    }
}

/// A provider plus an optional cache.
pub struct Embedder {
    provider: Box<dyn EmbeddingProvider>,
    cache: Option<EmbeddingCache>,
}

impl Embedder {
    pub fn new(provider: Box<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: EmbeddingCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn cache(&self) -> Option<&EmbeddingCache> {
        self.cache.as_ref()
    }

    /// Embed one text. `None` for blank input or on failure.
    pub fn embed(&self, text: &str, use_cache: bool) -> Option<Vec<f32>> {
        self.embed_batch(&[text], use_cache).pop().flatten()
    }

    /// Embed `texts`, one slot per input in order.
    ///
    /// Cached vectors are returned as-is; the rest are sent to the
    /// provider in batches of at most
    /// [`max_batch_size`](EmbeddingProvider::max_batch_size) and written
    /// back to the cache.
    pub fn embed_batch<S: AsRef<str>>(
        &self,
        texts: &[S],
        use_cache: bool,
    ) -> Vec<Option<Vec<f32>>> {
        let model = self.provider.model_name();
        let cache = self.cache.as_ref().filter(|_| use_cache);

        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending = Vec::new();
        let mut cached = 0usize;

        for (i, text) in texts.iter().enumerate() {
            let text = text.as_ref();
            if text.trim().is_empty() {
                continue;
            }
            if let Some(cache) = cache
                && let Some(vector) = cache.get(model, text)
            {
                if self.is_valid(&vector) {
                    out[i] = Some(vector);
                    cached += 1;
                    continue;
                }
                // Stale entries would otherwise block the rewrite below.
                cache.evict(model, text);
            }
            pending.push(i);
        }

        let batch_size = self.provider.max_batch_size().max(1);
        for batch in pending.chunks(batch_size) {
            let inputs: Vec<&str> =
                batch.iter().map(|&i| texts[i].as_ref()).collect();
            let vectors = self.embed_provider_batch(&inputs);

            for (&i, vector) in batch.iter().zip(vectors) {
                let vector = vector.filter(|v| self.is_valid(v));
                if let (Some(cache), Some(vector)) = (cache, &vector) {
                    cache.put(model, texts[i].as_ref(), vector);
                }
                out[i] = vector;
            }
        }

        debug!(
            model,
            total = texts.len(),
            cached,
            computed = pending.len(),
            failed = out.iter().filter(|v| v.is_none()).count(),
            "embedded batch"
        );
        out
    }

    /// Embed every chunk's content and stamp `embedding`,
    /// `embedding_model` and `embedding_dim` on the ones that succeeded.
    /// Returns how many chunks got a vector.
    pub fn embed_chunks(&self, chunks: &mut [Chunk], use_cache: bool) -> usize {
        let texts: Vec<&str> =
            chunks.iter().map(|c| c.content.as_str()).collect();
        let vectors = self.embed_batch(&texts, use_cache);

        let mut embedded = 0;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            if let Some(vector) = vector {
                chunk.metadata.embedding_dim = Some(vector.len());
                chunk.metadata.embedding_model =
                    Some(self.model_name().to_string());
                chunk.metadata.embedding = Some(vector);
                embedded += 1;
            }
        }
        embedded
    }

    /// Call the provider once; on failure retry item by item so one bad
    /// input only loses its own slot.
    fn embed_provider_batch(&self, inputs: &[&str]) -> Vec<Option<Vec<f32>>> {
        match self.provider.embed_batch(inputs) {
            Ok(vectors) if vectors.len() == inputs.len() => {
                vectors.into_iter().map(Some).collect()
            }
            Ok(vectors) => {
                warn!(
                    model = self.model_name(),
                    expected = inputs.len(),
                    got = vectors.len(),
                    "provider returned wrong number of vectors"
                );
                self.embed_individually(inputs)
            }
            Err(e) => {
                warn!(
                    model = self.model_name(),
                    batch = inputs.len(),
                    error = %e,
                    "embedding batch failed"
                );
                self.embed_individually(inputs)
            }
        }
    }

    fn embed_individually(&self, inputs: &[&str]) -> Vec<Option<Vec<f32>>> {
        if inputs.len() == 1 {
            return vec![None];
        }
        inputs
            .iter()
            .map(|text| match self.provider.embed_batch(&[*text]) {
                Ok(mut vectors) if vectors.len() == 1 => vectors.pop(),
                Ok(_) => None,
                Err(e) => {
                    warn!(
                        model = self.model_name(),
                        error = %e,
                        "embedding failed"
                    );
                    None
                }
            })
            .collect()
    }

    fn is_valid(&self, vector: &[f32]) -> bool {
        let dims = self.provider.dimensions();
        let ok = !vector.is_empty()
            && (dims == 0 || vector.len() == dims)
            && vector.iter().all(|x| x.is_finite());
        if !ok {
            warn!(
                model = self.model_name(),
                expected = dims,
                got = vector.len(),
                "discarding malformed embedding"
            );
        }
        ok
    }
}

impl fmt::Debug for Embedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedder")
            .field("model", &self.model_name())
            .field("cache", &self.cache)
            .finish()
    }
}
