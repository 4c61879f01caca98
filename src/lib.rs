//! docrag - retrieval-augmented context building for local documents.
//!
//! docrag splits documents into chunks, embeds them (with a
//! content-addressed cache), retrieves with BM25, vectors or both fused by
//! reciprocal rank, reranks for diversity and relevance, packs the result
//! into a token budget and attaches citations.
//!
//! # Quick start
//!
//! ```
//! use docrag::{RagConfig, RagPipeline};
//! use docrag::embedding::Embedder;
//! use docrag::hash_embedder::HashEmbedder;
//! use docrag::ingestion::SourceDocument;
//!
//! let embedder = Embedder::new(Box::new(HashEmbedder::new(64)));
//! let mut pipeline = RagPipeline::new(RagConfig::default(), embedder);
//!
//! pipeline.index_documents(&[
//!     SourceDocument::new("cats.md", Some("md".into()), "Cats purr."),
//!     SourceDocument::new("dogs.md", Some("md".into()), "Dogs bark."),
//! ]);
//!
//! let response = pipeline.answer_context("why do cats purr");
//! assert!(response.context.contains("Cats purr."));
//! assert_eq!(response.citations[0].filename, "cats.md");
//! ```

pub mod bm25;
pub mod cache_key;
pub mod chunking;
pub mod citation;
pub mod config;
pub mod config_db;
pub mod context;
pub mod data_dir;
pub mod embedding;
pub mod embedding_cache;
pub mod error;
pub mod hash_embedder;
pub mod ingestion;
#[cfg(feature = "colbert")]
pub mod model_manager;
pub mod pipeline;
pub mod query_expansion;
pub mod remote_embedder;
pub mod reranker;
pub mod retriever;
pub mod text_util;
pub mod walker;

pub use config::RagConfig;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use pipeline::{RagPipeline, RagResponse};
