use std::sync::Mutex;

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;
use tracing::info;

use crate::{
    embedding::{EmbeddingProvider, l2_normalize},
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
/// Output size of the default model's projection layer.
pub const DEFAULT_DIMENSIONS: usize = 128;

const PROVIDER: &str = "colbert";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn model_error(e: impl std::fmt::Display) -> Error {
    Error::embedding(PROVIDER, e.to_string())
}

/// Local ColBERT model producing one mean-pooled vector per text.
///
/// The model is downloaded and loaded on the first call to
/// [`embed_batch`](EmbeddingProvider::embed_batch).
pub struct ColbertEmbedder {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
    dimensions: usize,
}

impl Default for ColbertEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl ColbertEmbedder {
    pub fn new() -> Self {
        Self {
            model: Mutex::new(None),
            model_id: DEFAULT_MODEL_ID.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
        }
    }

    /// Use another HuggingFace model. Its projection size must be given
    /// with [`with_dimensions`](Self::with_dimensions) if it is not 128.
    pub fn with_model_id(mut self, model_id: String) -> Self {
        self.model_id = model_id;
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.lock().is_ok_and(|m| m.is_some())
    }

    /// Encode `texts` into token embeddings of shape `[batch, tokens, dim]`.
    fn encode(&self, texts: &[String]) -> Result<Tensor> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| model_error("model lock poisoned"))?;

        if guard.is_none() {
            info!(model = %self.model_id, "loading ColBERT model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(model_error)?;
            *guard = Some(colbert);
        }

        let Some(model) = guard.as_mut() else {
            return Err(model_error("model failed to load"));
        };
        model.encode(texts, false).map_err(model_error)
    }
}

impl EmbeddingProvider for ColbertEmbedder {
    fn model_name(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        32
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let embeddings = self.encode(&owned)?;

        // [batch, tokens, dim] -> [batch, dim]
        let pooled = embeddings.mean(1).map_err(model_error)?;
        let mut vectors = pooled.to_vec2::<f32>().map_err(model_error)?;
        for vector in &mut vectors {
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}

impl std::fmt::Debug for ColbertEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColbertEmbedder")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_model_id() {
        let embedder =
            ColbertEmbedder::new().with_model_id("custom/model".to_string());
        assert_eq!(embedder.model_id(), "custom/model");
        assert_eq!(embedder.model_name(), "custom/model");
        assert!(!embedder.is_loaded());
    }

    #[test]
    fn not_loaded_by_default() {
        let embedder = ColbertEmbedder::default();
        assert!(!embedder.is_loaded());
        assert_eq!(embedder.model_id(), DEFAULT_MODEL_ID);
        assert_eq!(embedder.dimensions(), DEFAULT_DIMENSIONS);
    }

    #[test]
    fn empty_batch_does_not_load_model() {
        let embedder = ColbertEmbedder::default();
        assert!(embedder.embed_batch(&[]).unwrap().is_empty());
        assert!(!embedder.is_loaded());
    }
}
