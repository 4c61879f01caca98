//! Chunking utilities for splitting documents into retrievable segments.
//!
//! Every strategy works on character (not byte) offsets: a chunk's
//! `start_char..end_char` always addresses exactly its `content` in the
//! source text, so `end_char - start_char == content.chars().count()`.
//!
//! Chunking fails soft. Blank input yields no chunks, and unknown strategy
//! names resolve to [`ChunkStrategy::Recursive`] through
//! [`ChunkStrategy::parse_lossy`].

use std::{collections::BTreeMap, fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    text_util::{self, CHARS_PER_TOKEN, CharMap},
};

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between chunks in characters (only `overlap` uses it).
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// How far back from a window edge the `overlap` strategy looks for a
/// sentence boundary.
const BOUNDARY_LOOKBACK: usize = 100;

/// Splitting strategy.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    Fixed,
    Sentence,
    Paragraph,
    #[default]
    Recursive,
    Overlap,
    Semantic,
    TokenAware,
    CodeAware,
}

impl ChunkStrategy {
    pub const ALL: [ChunkStrategy; 8] = [
        Self::Fixed,
        Self::Sentence,
        Self::Paragraph,
        Self::Recursive,
        Self::Overlap,
        Self::Semantic,
        Self::TokenAware,
        Self::CodeAware,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Sentence => "sentence",
            Self::Paragraph => "paragraph",
            Self::Recursive => "recursive",
            Self::Overlap => "overlap",
            Self::Semantic => "semantic",
            Self::TokenAware => "token_aware",
            Self::CodeAware => "code_aware",
        }
    }

    /// Parse a strategy name, falling back to the default strategy for
    /// unknown names.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrag::chunking::ChunkStrategy;
    ///
    /// assert_eq!(ChunkStrategy::parse_lossy("overlap"), ChunkStrategy::Overlap);
    /// assert_eq!(ChunkStrategy::parse_lossy("bogus"), ChunkStrategy::Recursive);
    /// ```
    pub fn parse_lossy(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            tracing::warn!(
                strategy = name,
                "unknown chunking strategy, using recursive"
            );
            Self::default()
        })
    }
}

impl FromStr for ChunkStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| Error::unsupported("chunking strategy", s))
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to a chunk.
///
/// The recognized keys are typed fields; anything strategy- or
/// caller-specific goes into `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ChunkStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ChunkMetadata {
    /// Metadata describing the source file of a document.
    pub fn for_source(
        file_id: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            file_id: Some(file_id.into()),
            filename: Some(filename.into()),
            ..Self::default()
        }
    }

    /// Fill every field that is still unset from `base`.
    pub fn merge_from(&mut self, base: &ChunkMetadata) {
        fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(from);
            }
        }

        fill(&mut self.header, &base.header);
        fill(&mut self.page_number, &base.page_number);
        fill(&mut self.chunk_type, &base.chunk_type);
        fill(&mut self.language, &base.language);
        fill(&mut self.strategy, &base.strategy);
        fill(&mut self.chunk_index, &base.chunk_index);
        fill(&mut self.total_chunks, &base.total_chunks);
        fill(&mut self.embedding, &base.embedding);
        fill(&mut self.embedding_model, &base.embedding_model);
        fill(&mut self.embedding_dim, &base.embedding_dim);
        fill(&mut self.file_id, &base.file_id);
        fill(&mut self.filename, &base.filename);
        for (key, value) in &base.extra {
            self.extra
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Key identifying the source document: `file_id`, else `filename`.
    pub fn source_key(&self) -> Option<&str> {
        self.file_id.as_deref().or(self.filename.as_deref())
    }
}

/// A contiguous span of a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    /// Zero-based position of the chunk within its document.
    pub chunk_id: usize,
    /// Character offset where the chunk starts in the source text.
    pub start_char: usize,
    /// Character offset one past the chunk's last character.
    pub end_char: usize,
    pub metadata: ChunkMetadata,
}

/// Options for [`chunk_text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOptions {
    /// Maximum chunk size in characters (in tokens for `token_aware`).
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub strategy: ChunkStrategy,
    /// File extension or language name, used by `code_aware`.
    pub file_type: Option<String>,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            strategy: ChunkStrategy::default(),
            file_type: None,
        }
    }
}

/// Split `text` into chunks.
///
/// Every chunk is stamped with `chunk_index`, `total_chunks` and
/// `strategy`, then merged with the caller's `metadata`.
///
/// # Examples
///
/// ```
/// use docrag::chunking::{chunk_text, ChunkMetadata, ChunkOptions, ChunkStrategy};
///
/// let opts = ChunkOptions {
///     chunk_size: 20,
///     strategy: ChunkStrategy::Sentence,
///     ..ChunkOptions::default()
/// };
/// let chunks = chunk_text("One. Two! Three?", &opts, &ChunkMetadata::default());
/// assert_eq!(chunks.len(), 3);
/// assert_eq!(chunks[1].content, "Two!");
/// assert_eq!(chunks[1].metadata.total_chunks, Some(3));
///
/// assert!(chunk_text("   ", &opts, &ChunkMetadata::default()).is_empty());
/// ```
pub fn chunk_text(
    text: &str,
    options: &ChunkOptions,
    metadata: &ChunkMetadata,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let doc = Doc::new(text);
    let size = options.chunk_size.max(1);
    let whole = (0, doc.len());

    let pieces = match options.strategy {
        ChunkStrategy::Fixed => plain(split_fixed(&doc, whole, size)),
        ChunkStrategy::Sentence => plain(split_units(
            &doc,
            doc.sentences(whole),
            size,
        )),
        ChunkStrategy::Paragraph => plain(split_units(
            &doc,
            doc.paragraphs(whole),
            size,
        )),
        ChunkStrategy::Recursive => plain(split_recursive(&doc, whole, size)),
        ChunkStrategy::Overlap => plain(split_overlapping(
            &doc,
            whole,
            size,
            options.chunk_overlap,
        )),
        ChunkStrategy::Semantic => split_sections(&doc, size),
        ChunkStrategy::TokenAware => plain(split_recursive(
            &doc,
            whole,
            size.saturating_mul(CHARS_PER_TOKEN),
        )),
        ChunkStrategy::CodeAware => {
            split_code(&doc, size, options.file_type.as_deref())
        }
    };

    finalize(&doc, pieces, options.strategy, metadata)
}

/// A span selected by a strategy, before stamping.
#[derive(Debug, Clone)]
struct Piece {
    start: usize,
    end: usize,
    header: Option<String>,
    chunk_type: &'static str,
    language: Option<&'static str>,
}

type Span = (usize, usize);

fn plain(spans: Vec<Span>) -> Vec<Piece> {
    spans
        .into_iter()
        .map(|(start, end)| Piece {
            start,
            end,
            header: None,
            chunk_type: "text",
            language: None,
        })
        .collect()
}

fn finalize(
    doc: &Doc<'_>,
    pieces: Vec<Piece>,
    strategy: ChunkStrategy,
    base: &ChunkMetadata,
) -> Vec<Chunk> {
    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            let content = doc.slice((piece.start, piece.end)).to_string();
            let mut metadata = ChunkMetadata {
                header: piece.header,
                chunk_type: Some(piece.chunk_type.to_string()),
                language: piece.language.map(str::to_string),
                strategy: Some(strategy),
                chunk_index: Some(index),
                total_chunks: Some(total),
                ..ChunkMetadata::default()
            };
            if strategy == ChunkStrategy::TokenAware {
                metadata.extra.insert(
                    "token_count".to_string(),
                    text_util::estimate_tokens(&content).into(),
                );
            }
            metadata.merge_from(base);

            Chunk {
                content,
                chunk_id: index,
                start_char: piece.start,
                end_char: piece.end,
                metadata,
            }
        })
        .collect()
}

/// Source text with character-indexed access.
struct Doc<'a> {
    text: &'a str,
    chars: Vec<char>,
    map: CharMap,
}

impl<'a> Doc<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.chars().collect(),
            map: CharMap::new(text),
        }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn slice(&self, (start, end): Span) -> &'a str {
        &self.text[self.map.byte(start)..self.map.byte(end)]
    }

    fn is_blank(&self, (start, end): Span) -> bool {
        self.chars[start..end].iter().all(|c| c.is_whitespace())
    }

    /// Convert byte spans relative to `range` into absolute char spans.
    fn to_char_spans(&self, range: Span, spans: Vec<Span>) -> Vec<Span> {
        let base = self.map.byte(range.0);
        spans
            .into_iter()
            .map(|(s, e)| (self.map.char_of(base + s), self.map.char_of(base + e)))
            .collect()
    }

    fn sentences(&self, range: Span) -> Vec<Span> {
        let spans = text_util::sentence_spans(self.slice(range));
        self.to_char_spans(range, spans)
    }

    fn paragraphs(&self, range: Span) -> Vec<Span> {
        let spans = text_util::paragraph_spans(self.slice(range));
        self.to_char_spans(range, spans)
    }

    fn trim(&self, (mut start, mut end): Span) -> Span {
        while start < end && self.chars[start].is_whitespace() {
            start += 1;
        }
        while end > start && self.chars[end - 1].is_whitespace() {
            end -= 1;
        }
        (start, end)
    }
}

/// Hard split every `size` characters, dropping blank windows.
fn split_fixed(doc: &Doc<'_>, (start, end): Span, size: usize) -> Vec<Span> {
    (start..end)
        .step_by(size)
        .map(|s| (s, (s + size).min(end)))
        .filter(|&span| !doc.is_blank(span))
        .collect()
}

/// Emit one chunk per unit, character-splitting units larger than `size`.
fn split_units(doc: &Doc<'_>, units: Vec<Span>, size: usize) -> Vec<Span> {
    units
        .into_iter()
        .flat_map(|unit| {
            if unit.1 - unit.0 <= size {
                vec![unit]
            } else {
                split_fixed(doc, unit, size)
            }
        })
        .collect()
}

/// Greedily pack paragraphs, falling back to packed sentences for oversized
/// paragraphs and to raw character windows for oversized sentences.
fn split_recursive(doc: &Doc<'_>, range: Span, size: usize) -> Vec<Span> {
    pack(doc.paragraphs(range), size, |paragraph| {
        pack(doc.sentences(paragraph), size, |sentence| {
            split_fixed(doc, sentence, size)
        })
    })
}

/// Merge consecutive units while the combined span fits in `size`; units
/// that are too large on their own go through `oversized`.
fn pack(
    units: Vec<Span>,
    size: usize,
    mut oversized: impl FnMut(Span) -> Vec<Span>,
) -> Vec<Span> {
    let mut out = Vec::new();
    let mut buffer: Option<Span> = None;

    for unit in units {
        if let Some((buf_start, _)) = buffer
            && unit.1 - buf_start <= size
        {
            buffer = Some((buf_start, unit.1));
            continue;
        }

        out.extend(buffer.take());
        if unit.1 - unit.0 <= size {
            buffer = Some(unit);
        } else {
            out.extend(oversized(unit));
        }
    }
    out.extend(buffer);

    out
}

/// Sliding window that snaps its right edge back to a sentence end when one
/// is found in the last [`BOUNDARY_LOOKBACK`] characters.
fn split_overlapping(
    doc: &Doc<'_>,
    (range_start, range_end): Span,
    size: usize,
    overlap: usize,
) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut start = range_start;

    loop {
        let mut end = (start + size).min(range_end);

        if end < range_end {
            let look_from = end.saturating_sub(BOUNDARY_LOOKBACK).max(start);
            if let Some(idx) = (look_from..end).rev().find(|&i| {
                matches!(doc.chars[i], '.' | '!' | '?')
                    && doc.chars[i + 1].is_whitespace()
            }) {
                end = idx + 1;
            }
        }

        if !doc.is_blank((start, end)) {
            spans.push((start, end));
        }
        if end >= range_end {
            break;
        }

        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    spans
}

static MARKDOWN_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#{1,6}\s+(\S.*)$").expect("static regex")
});

/// Connecting words allowed in lowercase inside a title-case header.
const TITLE_SMALL_WORDS: &[&str] = &[
    "a", "an", "and", "as", "at", "by", "for", "in", "of", "on", "or", "the",
    "to", "vs", "with",
];

/// Return the header text if `line` looks like a section header.
fn header_text(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.chars().count() > 100 {
        return None;
    }

    if let Some(caps) = MARKDOWN_HEADER_RE.captures(line) {
        return Some(caps[1].trim().to_string());
    }

    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() >= 3 && letters.iter().all(|c| c.is_uppercase()) {
        return Some(line.to_string());
    }

    let words: Vec<&str> = line.split_whitespace().collect();
    let starts_upper =
        |w: &str| w.chars().next().is_some_and(|c| c.is_uppercase());
    let is_title = (2..=10).contains(&words.len())
        && !line.ends_with(['.', '!', '?', ',', ';', ':'])
        && starts_upper(words[0])
        && words.iter().all(|w| {
            starts_upper(w)
                || TITLE_SMALL_WORDS.contains(&w.to_lowercase().as_str())
        });
    is_title.then(|| line.to_string())
}

/// One chunk per header-delimited section; oversized sections are
/// re-chunked recursively and keep their header.
fn split_sections(doc: &Doc<'_>, size: usize) -> Vec<Piece> {
    let mut sections: Vec<(usize, Option<String>)> = vec![(0, None)];
    let mut line_start = 0;
    for line in doc.text.split_inclusive('\n') {
        if let Some(header) = header_text(line) {
            sections.push((doc.map.char_of(line_start), Some(header)));
        }
        line_start += line.len();
    }

    let mut pieces = Vec::new();
    for (i, (start, header)) in sections.iter().enumerate() {
        let end = sections
            .get(i + 1)
            .map_or(doc.len(), |(next_start, _)| *next_start);
        let span = doc.trim((*start, end));
        if span.0 >= span.1 {
            continue;
        }

        let spans = if span.1 - span.0 <= size {
            vec![span]
        } else {
            split_recursive(doc, span, size)
        };
        pieces.extend(spans.into_iter().map(|(start, end)| Piece {
            start,
            end,
            header: header.clone(),
            chunk_type: "section",
            language: None,
        }));
    }

    pieces
}

/// Programming languages with dedicated boundary patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    C,
    Cpp,
    Ruby,
    Php,
}

impl Language {
    const ALL: [Language; 10] = [
        Self::Rust,
        Self::Python,
        Self::JavaScript,
        Self::TypeScript,
        Self::Go,
        Self::Java,
        Self::C,
        Self::Cpp,
        Self::Ruby,
        Self::Php,
    ];

    /// Detect a language from a file extension, file name or language name.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrag::chunking::Language;
    ///
    /// assert_eq!(Language::detect("src/main.rs"), Some(Language::Rust));
    /// assert_eq!(Language::detect(".py"), Some(Language::Python));
    /// assert_eq!(Language::detect("markdown"), None);
    /// ```
    pub fn detect(file_type: &str) -> Option<Self> {
        let lower = file_type.trim().to_ascii_lowercase();
        let ext = lower.rsplit('.').next().unwrap_or(&lower);
        match ext {
            "rs" | "rust" => Some(Self::Rust),
            "py" | "pyi" | "python" => Some(Self::Python),
            "js" | "jsx" | "mjs" | "cjs" | "javascript" => {
                Some(Self::JavaScript)
            }
            "ts" | "tsx" | "typescript" => Some(Self::TypeScript),
            "go" | "golang" => Some(Self::Go),
            "java" => Some(Self::Java),
            "c" | "h" => Some(Self::C),
            "cpp" | "cc" | "cxx" | "hpp" | "hh" | "c++" => Some(Self::Cpp),
            "rb" | "ruby" => Some(Self::Ruby),
            "php" => Some(Self::Php),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Ruby => "ruby",
            Self::Php => "php",
        }
    }

    fn boundary_pattern(self) -> &'static str {
        match self {
            Self::Rust => {
                r"(?m)^(pub(\([^)]*\))?\s+)?(const\s+)?(async\s+)?(unsafe\s+)?(fn|struct|enum|trait|impl|mod|macro_rules!)\b"
            }
            Self::Python => r"(?m)^((async\s+)?def|class)\s",
            Self::JavaScript | Self::TypeScript => {
                r"(?m)^(export\s+)?(default\s+)?(async\s+)?(function\*?|class|interface|type|enum)\s"
            }
            Self::Go => r"(?m)^(func|type)\s",
            Self::Java => {
                r"(?m)^\s{0,4}((public|private|protected|static|final|abstract)\s+)+[\w<>\[\],\s]*\(|^((public|private|protected|abstract|final)\s+)*(class|interface|enum|record)\s"
            }
            Self::C | Self::Cpp => {
                r"(?m)^(class|struct|namespace|template)\b|^[A-Za-z_][\w\s\*&:<>,]*\([^;]*\)\s*\{?\s*$"
            }
            Self::Ruby => r"(?m)^\s*(def|class|module)\s",
            Self::Php => {
                r"(?m)^\s*((public|private|protected|static|abstract|final)\s+)*(function|class|interface|trait)\s"
            }
        }
    }
}

const GENERIC_BOUNDARY: &str =
    r"(?m)^\s*(def|fn|func|function|class|struct|impl|interface|module)\b";

static BOUNDARY_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    Language::ALL
        .iter()
        .map(|lang| lang.boundary_pattern())
        .chain(std::iter::once(GENERIC_BOUNDARY))
        .map(|pattern| Regex::new(pattern).expect("static regex"))
        .collect()
});

fn boundary_regex(language: Option<Language>) -> &'static Regex {
    let idx = language
        .and_then(|lang| Language::ALL.iter().position(|l| *l == lang))
        .unwrap_or(Language::ALL.len());
    &BOUNDARY_RES[idx]
}

/// Split source code at function/class boundaries; oversized sections fall
/// back to recursive chunking.
fn split_code(
    doc: &Doc<'_>,
    size: usize,
    file_type: Option<&str>,
) -> Vec<Piece> {
    let language = file_type.and_then(Language::detect);
    let re = boundary_regex(language);

    let mut starts = vec![0];
    starts.extend(
        re.find_iter(doc.text)
            .map(|m| doc.map.char_of(m.start()))
            .filter(|&s| s > 0),
    );
    starts.dedup();

    let mut pieces = Vec::new();
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(doc.len());
        let span = doc.trim((start, end));
        if span.0 >= span.1 {
            continue;
        }

        let spans = if span.1 - span.0 <= size {
            vec![span]
        } else {
            split_recursive(doc, span, size)
        };
        pieces.extend(spans.into_iter().map(|(start, end)| Piece {
            start,
            end,
            header: None,
            chunk_type: "code",
            language: language.map(Language::as_str),
        }));
    }

    pieces
}
