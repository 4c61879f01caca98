//! The RAG facade: chunk, embed, retrieve, rerank, optimize, cite.
//!
//! [`RagPipeline`] is synchronous and handles one request at a time. The
//! typed operations never fail on bad input; the `*_named` variants accept
//! method and format names as strings and report unknown names as a failed
//! [`Outcome`] instead of an `Err`.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    chunking::{self, Chunk, ChunkMetadata, ChunkOptions, ChunkStrategy},
    citation::{Citation, CitationFormat, CitationManager, NewCitation},
    config::RagConfig,
    context::{
        ChunkMerger, ContextBlock, ContextCompressor, ContextSource,
        ContextWindowOptimizer,
    },
    data_dir::DataDir,
    embedding::{Embedder, build_provider},
    embedding_cache::EmbeddingCache,
    error::Result,
    ingestion::SourceDocument,
    reranker::{RankedResult, RerankMethod, build_reranker},
    retriever::{HybridRetriever, RetrievalMethod, RetrievalResult},
};

/// Separator placed between context blocks.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Retrieval candidates fetched per requested result when reranking.
const RERANK_POOL_FACTOR: usize = 3;

/// Chunks embedded per progress step in
/// [`RagPipeline::index_documents_with_progress`].
const INDEX_BATCH: usize = 64;

/// Result envelope for string-keyed operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Outcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            data: None,
        }
    }
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failure(e),
        }
    }
}

/// Text with its citation markers applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CitedText {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// Everything a caller needs to build a prompt for one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagResponse {
    pub context: String,
    pub citations: Vec<Citation>,
    pub results: Vec<RankedResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub documents: usize,
    pub chunks: usize,
    pub embedded: usize,
}

pub struct RagPipeline {
    config: RagConfig,
    embedder: Embedder,
    retriever: HybridRetriever,
}

impl RagPipeline {
    pub fn new(config: RagConfig, embedder: Embedder) -> Self {
        let retriever = HybridRetriever::new(
            config.retrieval.fusion,
            config.retrieval.bm25_k1,
            config.retrieval.bm25_b,
        );
        Self {
            config,
            embedder,
            retriever,
        }
    }

    /// Build the configured provider and, when caching is enabled and a
    /// data directory is given, attach the embedding cache. A cache that
    /// cannot be opened is logged and skipped.
    pub fn from_config(
        config: RagConfig,
        data_dir: Option<&DataDir>,
    ) -> Result<Self> {
        let mut embedder = Embedder::new(build_provider(&config.embedding)?);
        if config.embedding.use_cache
            && let Some(data_dir) = data_dir
        {
            match EmbeddingCache::open(config.embedding.cache_backend, data_dir)
            {
                Ok(cache) => embedder = embedder.with_cache(cache),
                Err(e) => warn!(error = %e, "embedding cache unavailable"),
            }
        }
        Ok(Self::new(config, embedder))
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn retriever(&self) -> &HybridRetriever {
        &self.retriever
    }

    /// Split `text` into chunks. Blank text yields none.
    pub fn chunk(
        &self,
        text: &str,
        chunk_size: usize,
        chunk_overlap: usize,
        strategy: ChunkStrategy,
        metadata: &ChunkMetadata,
        file_type: Option<&str>,
    ) -> Vec<Chunk> {
        let options = ChunkOptions {
            chunk_size,
            chunk_overlap,
            strategy,
            file_type: file_type.map(str::to_string),
        };
        chunking::chunk_text(text, &options, metadata)
    }

    /// One vector per text; failures are `None`.
    pub fn embed_batch<S: AsRef<str>>(
        &self,
        texts: &[S],
        use_cache: bool,
    ) -> Vec<Option<Vec<f32>>> {
        self.embedder.embed_batch(texts, use_cache)
    }

    pub fn retrieve(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        top_k: usize,
        min_score: f32,
        method: RetrievalMethod,
    ) -> Vec<RetrievalResult> {
        self.retriever
            .retrieve(query, query_embedding, top_k, min_score, method)
    }

    pub fn rerank(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        embeddings: &[Option<Vec<f32>>],
        top_k: usize,
        method: RerankMethod,
    ) -> Vec<RankedResult> {
        build_reranker(method, &self.config.rerank).rerank(
            query,
            query_embedding,
            results,
            embeddings,
            top_k,
        )
    }

    /// Rejoin chunks that sit within `context.merge_max_gap` of each other
    /// in their document, returning the merged texts.
    pub fn merge_chunks<T: ContextSource>(
        &self,
        chunks: &[T],
    ) -> Vec<String> {
        ChunkMerger.merge_texts(chunks, self.config.context.merge_max_gap)
    }

    /// Merge adjacent chunks, optionally compress, fit the token budget and
    /// join the surviving blocks with [`CONTEXT_SEPARATOR`].
    pub fn optimize_context<T: ContextSource>(
        &self,
        chunks: &[T],
        query: &str,
        max_tokens: usize,
        use_compression: bool,
        ratio: f32,
    ) -> String {
        join_blocks(self.fit_context(
            chunks,
            query,
            max_tokens,
            use_compression,
            ratio,
        ))
    }

    fn fit_context<T: ContextSource>(
        &self,
        chunks: &[T],
        query: &str,
        max_tokens: usize,
        use_compression: bool,
        ratio: f32,
    ) -> Vec<ContextBlock> {
        let context = &self.config.context;
        let blocks = ChunkMerger.merge(chunks, context.merge_max_gap);

        if use_compression {
            let compressed = ContextCompressor.compress(&blocks, query, ratio);
            if compressed.compressed_text.is_empty() {
                Vec::new()
            } else {
                let block = ContextBlock::new(
                    compressed.compressed_text,
                    ChunkMetadata::default(),
                );
                ContextWindowOptimizer.fit(
                    &[block],
                    max_tokens,
                    context.reserved_tokens,
                )
            }
        } else {
            ContextWindowOptimizer.fit(
                &blocks,
                max_tokens,
                context.reserved_tokens,
            )
        }
    }

    /// Cite every chunk, mark the first paragraph of `text` and optionally
    /// append a reference list.
    pub fn format_with_citations<T: ContextSource>(
        &self,
        text: &str,
        chunks: &[T],
        format: CitationFormat,
        include_references: bool,
    ) -> (String, Vec<Citation>) {
        self.cite(text, chunks, format, include_references, None)
    }

    /// Citations with snippets focused on `query` when one is given.
    fn cite<T: ContextSource>(
        &self,
        text: &str,
        chunks: &[T],
        format: CitationFormat,
        include_references: bool,
        query: Option<&str>,
    ) -> (String, Vec<Citation>) {
        let mut manager = CitationManager::new(format);
        let cited: Vec<Citation> = chunks
            .iter()
            .map(|c| {
                let new = NewCitation::from_source(c);
                let new = match query {
                    Some(query) => new.focused(query),
                    None => new,
                };
                manager.add(new)
            })
            .collect();

        let mut out = manager.inject(text, &cited);
        if include_references && !manager.is_empty() {
            out.push_str("\n\nReferences:\n");
            out.push_str(&manager.references());
        }
        (out, manager.citations().to_vec())
    }

    /// Chunk, embed and add `documents` to the corpus.
    pub fn index_documents(
        &mut self,
        documents: &[SourceDocument],
    ) -> IndexSummary {
        self.index_documents_with_progress(documents, |_| {})
    }

    /// [`index_documents`](Self::index_documents), calling `progress` with
    /// the number of chunks embedded after each batch.
    pub fn index_documents_with_progress(
        &mut self,
        documents: &[SourceDocument],
        mut progress: impl FnMut(usize),
    ) -> IndexSummary {
        let chunking = &self.config.chunking;
        let mut chunks: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| {
                self.chunk(
                    &doc.text,
                    chunking.chunk_size,
                    chunking.chunk_overlap,
                    chunking.strategy,
                    &doc.metadata(),
                    doc.file_type.as_deref(),
                )
            })
            .collect();

        let use_cache = self.config.embedding.use_cache;
        let mut embedded = 0;
        for batch in chunks.chunks_mut(INDEX_BATCH) {
            embedded += self.embedder.embed_chunks(batch, use_cache);
            progress(batch.len());
        }

        let summary = IndexSummary {
            documents: documents.len(),
            chunks: chunks.len(),
            embedded,
        };
        if embedded < chunks.len() {
            warn!(
                missing = chunks.len() - embedded,
                "some chunks have no embedding and are keyword-only"
            );
        }

        let mut corpus = self.retriever.chunks().to_vec();
        corpus.append(&mut chunks);
        self.retriever.index(corpus, Vec::new());

        info!(
            documents = summary.documents,
            chunks = summary.chunks,
            embedded = summary.embedded,
            "indexed documents"
        );
        summary
    }

    /// Run the configured flow for `query`: retrieve a candidate pool,
    /// rerank it down to `top_k`, build the context and cite it.
    pub fn answer_context(&self, query: &str) -> RagResponse {
        let retrieval = &self.config.retrieval;
        let rerank = &self.config.rerank;
        let context = &self.config.context;
        let citation = &self.config.citation;

        let query_embedding = match retrieval.method {
            RetrievalMethod::Keyword => None,
            _ => self.embedder.embed(query, self.config.embedding.use_cache),
        };
        let query_embedding = query_embedding.as_deref();

        let pool = match rerank.method {
            RerankMethod::None => retrieval.top_k,
            _ => retrieval.top_k.saturating_mul(RERANK_POOL_FACTOR),
        };
        let candidates = self.retrieve(
            query,
            query_embedding,
            pool,
            retrieval.min_score,
            retrieval.method,
        );
        let embeddings = self.retriever.embeddings_for(&candidates);
        let results = self.rerank(
            query,
            query_embedding,
            &candidates,
            &embeddings,
            retrieval.top_k,
            rerank.method,
        );

        let fitted = self.fit_context(
            &results,
            query,
            context.max_tokens,
            context.use_compression,
            context.compression_ratio,
        );
        // Compressed context draws on every result, so all are cited.
        let sources: Vec<RankedResult> =
            if context.use_compression && !fitted.is_empty() {
                results.clone()
            } else {
                results
                    .iter()
                    .filter(|r| fitted.iter().any(|b| b.covers(*r)))
                    .cloned()
                    .collect()
            };
        let (context, citations) = self.cite(
            &join_blocks(fitted),
            &sources,
            citation.format,
            citation.include_references,
            Some(query),
        );

        debug!(
            candidates = candidates.len(),
            results = results.len(),
            context_chars = context.chars().count(),
            citations = citations.len(),
            "answered query"
        );
        RagResponse {
            context,
            citations,
            results,
        }
    }

    /// [`retrieve`](Self::retrieve) with the method given by name.
    pub fn retrieve_named(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        top_k: usize,
        min_score: f32,
        method: &str,
    ) -> Outcome<Vec<RetrievalResult>> {
        method
            .parse::<RetrievalMethod>()
            .map(|m| {
                self.retrieve(query, query_embedding, top_k, min_score, m)
            })
            .into()
    }

    /// [`rerank`](Self::rerank) with the method given by name.
    pub fn rerank_named(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        results: &[RetrievalResult],
        embeddings: &[Option<Vec<f32>>],
        top_k: usize,
        method: &str,
    ) -> Outcome<Vec<RankedResult>> {
        method
            .parse::<RerankMethod>()
            .map(|m| {
                self.rerank(
                    query,
                    query_embedding,
                    results,
                    embeddings,
                    top_k,
                    m,
                )
            })
            .into()
    }

    /// [`format_with_citations`](Self::format_with_citations) with the
    /// style given by name.
    pub fn format_with_citations_named<T: ContextSource>(
        &self,
        text: &str,
        chunks: &[T],
        format: &str,
        include_references: bool,
    ) -> Outcome<CitedText> {
        CitationFormat::parse(format)
            .map(|f| {
                let (text, citations) = self.format_with_citations(
                    text,
                    chunks,
                    f,
                    include_references,
                );
                CitedText { text, citations }
            })
            .into()
    }
}

fn join_blocks(blocks: Vec<ContextBlock>) -> String {
    blocks
        .into_iter()
        .map(|b| b.content)
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

impl std::fmt::Debug for RagPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagPipeline")
            .field("model", &self.embedder.model_name())
            .field("chunks", &self.retriever.len())
            .finish_non_exhaustive()
    }
}
