//! Layered pipeline configuration.
//!
//! Sources, lowest to highest priority: built-in defaults, the JSON config
//! file, global then per-user overrides from [`ConfigDb`], environment
//! variables, and finally CLI flags (applied by the binary).

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    chunking::{ChunkStrategy, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE},
    citation::CitationFormat,
    config_db::ConfigDb,
    data_dir::DataDir,
    embedding::EmbeddingBackend,
    embedding_cache::CacheBackendKind,
    error::{Error, Result},
    reranker::{EnsembleWeights, RerankMethod},
    retriever::{FusionStrategy, RetrievalMethod},
};

/// Environment variables and the settings they override.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DOCRAG_MODEL", "embedding.model"),
    ("DOCRAG_EMBEDDING_URL", "embedding.url"),
    ("DOCRAG_CHUNK_SIZE", "chunking.chunk_size"),
    ("DOCRAG_TOP_K", "retrieval.top_k"),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub context: ContextConfig,
    pub citation: CitationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub strategy: ChunkStrategy,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            strategy: ChunkStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    /// Model name; each backend has its own default.
    pub model: Option<String>,
    /// Vector size for backends that do not report one themselves.
    pub dimensions: usize,
    /// Base URL of an OpenAI-compatible API (remote backend).
    pub url: String,
    /// Environment variable holding the API key (remote backend).
    pub api_key_env: String,
    pub batch_size: usize,
    pub timeout_secs: u64,
    pub use_cache: bool,
    pub cache_backend: CacheBackendKind,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model: None,
            dimensions: 384,
            url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            batch_size: 100,
            timeout_secs: 30,
            use_cache: true,
            cache_backend: CacheBackendKind::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub method: RetrievalMethod,
    pub top_k: usize,
    pub min_score: f32,
    pub fusion: FusionStrategy,
    pub bm25_k1: f64,
    pub bm25_b: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            method: RetrievalMethod::default(),
            top_k: 5,
            min_score: 0.0,
            fusion: FusionStrategy::default(),
            bm25_k1: crate::bm25::DEFAULT_K1,
            bm25_b: crate::bm25::DEFAULT_B,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub method: RerankMethod,
    pub mmr_lambda: f32,
    pub contextual_bonus: f32,
    pub contextual_threshold: f32,
    pub contextual_min_chunks: usize,
    pub ensemble_weights: EnsembleWeights,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            method: RerankMethod::default(),
            mmr_lambda: 0.5,
            contextual_bonus: 0.1,
            contextual_threshold: 0.5,
            contextual_min_chunks: 2,
            ensemble_weights: EnsembleWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub reserved_tokens: usize,
    pub use_compression: bool,
    pub compression_ratio: f32,
    /// Largest `chunk_index` gap still merged into one block.
    pub merge_max_gap: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            reserved_tokens: 1000,
            use_compression: false,
            compression_ratio: 0.5,
            merge_max_gap: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationConfig {
    pub format: CitationFormat,
    pub include_references: bool,
}

impl Default for CitationConfig {
    fn default() -> Self {
        Self {
            format: CitationFormat::default(),
            include_references: true,
        }
    }
}

impl RagConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound {
                    kind: "config file",
                    name: path.display().to_string(),
                }
            } else {
                e.into()
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!("{}: {e}", path.display()))
        })
    }

    /// Build the effective configuration.
    ///
    /// An explicit `config_file` must exist; otherwise
    /// `<data_dir>/config.json` is read when present. Overrides stored in
    /// `db` are applied globally first, then for `user`.
    pub fn load(
        config_file: Option<&Path>,
        data_dir: &DataDir,
        db: Option<&ConfigDb>,
        user: Option<&str>,
    ) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = data_dir.config_file();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Some(db) = db {
            for (key, value) in db.list_settings()? {
                config.apply_setting(&key, &value)?;
            }
            if let Some(user) = user {
                for (key, value) in db.user_settings(user)? {
                    config.apply_setting(&key, &value)?;
                }
            }
        }

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply the [`ENV_OVERRIDES`] found by `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(var) {
                debug!(var, key, "applying environment override");
                self.apply_setting(key, &value)?;
            }
        }
        Ok(())
    }

    /// Set one `section.field` value from its string form.
    ///
    /// The value is parsed as JSON when possible (numbers, booleans,
    /// objects) and used as a plain string otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrag::config::RagConfig;
    ///
    /// let mut config = RagConfig::default();
    /// config.apply_setting("retrieval.top_k", "3").unwrap();
    /// config.apply_setting("chunking.strategy", "sentence").unwrap();
    /// assert_eq!(config.retrieval.top_k, 3);
    /// assert!(config.apply_setting("retrieval.nope", "1").is_err());
    /// ```
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<()> {
        let (section, field) = split_key(key)?;
        let mut tree = serde_json::to_value(&*self)?;

        let slot = tree
            .get_mut(section)
            .and_then(|s| s.get_mut(field))
            .ok_or_else(|| Error::NotFound {
                kind: "setting",
                name: key.to_string(),
            })?;
        *slot = serde_json::from_str(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));

        *self = serde_json::from_value(tree).map_err(|e| {
            Error::Config(format!("invalid value {value:?} for {key}: {e}"))
        })?;
        Ok(())
    }

    /// Read one `section.field` value.
    pub fn get_setting(&self, key: &str) -> Result<Value> {
        let (section, field) = split_key(key)?;
        serde_json::to_value(self)?
            .get(section)
            .and_then(|s| s.get(field))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "setting",
                name: key.to_string(),
            })
    }

    /// Every `section.field` key, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let tree = serde_json::to_value(self)?;
        let mut keys = Vec::new();
        if let Value::Object(sections) = tree {
            for (section, fields) in sections {
                if let Value::Object(fields) = fields {
                    keys.extend(
                        fields.keys().map(|field| format!("{section}.{field}")),
                    );
                }
            }
        }
        Ok(keys)
    }
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('.').ok_or_else(|| {
        Error::Config(format!(
            "setting keys look like section.field, got {key:?}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RagConfig::default();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.chunking.strategy, ChunkStrategy::Recursive);
        assert_eq!(config.retrieval.method, RetrievalMethod::Hybrid);
        assert_eq!(config.retrieval.fusion, FusionStrategy::Rrf { k: 60.0 });
        assert_eq!(config.rerank.mmr_lambda, 0.5);
        assert!(config.embedding.use_cache);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RagConfig = serde_json::from_str(
            r#"{"retrieval": {"top_k": 9}, "citation": {"format": "footnote"}}"#,
        )
        .unwrap();
        assert_eq!(config.retrieval.top_k, 9);
        assert_eq!(config.retrieval.min_score, 0.0);
        assert_eq!(config.citation.format, CitationFormat::Footnote);
        assert_eq!(config.chunking, ChunkingConfig::default());
    }

    #[test]
    fn apply_setting_parses_types() {
        let mut config = RagConfig::default();
        config.apply_setting("context.use_compression", "true").unwrap();
        config.apply_setting("embedding.model", "my-model").unwrap();
        config.apply_setting("rerank.method", "ensemble").unwrap();
        config
            .apply_setting(
                "retrieval.fusion",
                r#"{"type": "weighted", "semantic_weight": 0.7, "keyword_weight": 0.3}"#,
            )
            .unwrap();

        assert!(config.context.use_compression);
        assert_eq!(config.embedding.model.as_deref(), Some("my-model"));
        assert_eq!(config.rerank.method, RerankMethod::Ensemble);
        assert_eq!(
            config.retrieval.fusion,
            FusionStrategy::Weighted {
                semantic_weight: 0.7,
                keyword_weight: 0.3
            }
        );
    }

    #[test]
    fn apply_setting_rejects_bad_input() {
        let mut config = RagConfig::default();
        assert!(matches!(
            config.apply_setting("nodot", "1"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config.apply_setting("chunking.bogus", "1"),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            config.apply_setting("retrieval.top_k", "many"),
            Err(Error::Config(_))
        ));
        assert_eq!(config, RagConfig::default());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = RagConfig::default();
        config
            .apply_env(|name| match name {
                "DOCRAG_TOP_K" => Some("7".to_string()),
                "DOCRAG_MODEL" => Some("env-model".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.retrieval.top_k, 7);
        assert_eq!(config.embedding.model.as_deref(), Some("env-model"));
    }

    #[test]
    fn load_layers_file_then_db() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        std::fs::write(
            data_dir.config_file(),
            r#"{"retrieval": {"top_k": 2, "min_score": 0.1}}"#,
        )
        .unwrap();

        let db = ConfigDb::open(&data_dir.config_db()).unwrap();
        db.set_setting("retrieval.top_k", "4").unwrap();
        db.set_user_setting("alice", "retrieval.top_k", "6").unwrap();

        let global =
            RagConfig::load(None, &data_dir, Some(&db), None).unwrap();
        let alice =
            RagConfig::load(None, &data_dir, Some(&db), Some("alice")).unwrap();

        // DOCRAG_TOP_K may be set in the environment running the tests.
        if std::env::var("DOCRAG_TOP_K").is_err() {
            assert_eq!(global.retrieval.top_k, 4);
            assert_eq!(alice.retrieval.top_k, 6);
        }
        assert_eq!(global.retrieval.min_score, 0.1);
    }

    #[test]
    fn missing_explicit_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let err = RagConfig::load(
            Some(&tmp.path().join("missing.json")),
            &data_dir,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "config file", .. }));
    }

    #[test]
    fn get_setting_and_keys() {
        let config = RagConfig::default();
        assert_eq!(config.get_setting("retrieval.top_k").unwrap(), 5);
        let keys = config.keys().unwrap();
        assert!(keys.contains(&"chunking.strategy".to_string()));
        assert!(keys.contains(&"citation.include_references".to_string()));
    }
}
