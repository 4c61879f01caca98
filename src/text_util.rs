//! Text helpers shared by the chunker, the lexical index and the context
//! optimizer.
//!
//! All offsets produced here are byte offsets into the input string unless a
//! function says otherwise. [`CharMap`] converts between byte and character
//! positions for callers that report character offsets.

use std::sync::LazyLock;

use regex::Regex;

/// Approximate characters per token for English text.
pub const CHARS_PER_TOKEN: usize = 4;

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+").expect("static regex"));

static PARAGRAPH_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t\r]*\n").expect("static regex"));

const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "could",
    "did", "do", "does", "for", "from", "had", "has", "have", "how", "i",
    "in", "is", "it", "its", "me", "my", "of", "on", "or", "please", "should",
    "tell", "that", "the", "their", "there", "these", "this", "those", "to",
    "was", "we", "were", "what", "when", "where", "which", "who", "why",
    "will", "with", "would", "you", "your",
];

/// Lowercase `text` and split it into `\w+` tokens.
///
/// The lexical index, the heuristic reranker and the compressor all go
/// through this function so indexing and querying tokenize identically.
///
/// # Examples
///
/// ```
/// use docrag::text_util::tokenize;
///
/// assert_eq!(tokenize("The Cat, the HAT!"), vec!["the", "cat", "the", "hat"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Estimate the token count of `text` with the 4-chars-per-token heuristic.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Byte spans of the sentences in `text`.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace. Spans are
/// trimmed of surrounding whitespace and empty spans are dropped.
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut iter = text.char_indices().peekable();

    while let Some((idx, c)) = iter.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if let Some(&(_, next)) = iter.peek()
            && next.is_whitespace()
        {
            let end = idx + c.len_utf8();
            push_trimmed(text, start, end, &mut spans);
            start = end;
        }
    }
    push_trimmed(text, start, text.len(), &mut spans);

    spans
}

/// Byte spans of the blank-line delimited paragraphs in `text`.
pub fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for sep in PARAGRAPH_BREAK_RE.find_iter(text) {
        push_trimmed(text, start, sep.start(), &mut spans);
        start = sep.end();
    }
    push_trimmed(text, start, text.len(), &mut spans);
    spans
}

/// Split `text` into owned sentences.
pub fn split_sentences(text: &str) -> Vec<&str> {
    sentence_spans(text)
        .into_iter()
        .map(|(s, e)| &text[s..e])
        .collect()
}

fn push_trimmed(
    text: &str,
    start: usize,
    end: usize,
    spans: &mut Vec<(usize, usize)>,
) {
    let slice = &text[start..end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }
    let lead = slice.len() - slice.trim_start().len();
    spans.push((start + lead, start + lead + trimmed.len()));
}

/// Return the longest prefix of `s` holding at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Shorten `s` to at most `max_chars` characters, marking the cut with
/// `...` (the marker counts towards the limit).
pub fn ellipsize(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out = truncate_chars(s, keep).trim_end().to_string();
    out.push_str("...");
    out
}

/// Extract a snippet of at most `max_chars` characters around the first
/// case-insensitive occurrence of `query` in `text`.
///
/// Falls back to the first query token, then to the start of the text.
/// Returns `None` if the text is blank.
pub fn extract_snippet(
    text: &str,
    query: &str,
    max_chars: usize,
) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let lower = text.to_lowercase();
    // Lowercasing can change byte lengths, so only trust a hit when the
    // lengths agree.
    let hit = if lower.len() == text.len() {
        let query = query.trim().to_lowercase();
        let by_phrase = (!query.is_empty())
            .then(|| lower.find(&query))
            .flatten();
        by_phrase.or_else(|| {
            tokenize(&query)
                .into_iter()
                .filter(|t| !is_stop_word(t))
                .find_map(|t| lower.find(&t))
        })
    } else {
        None
    };

    let start_char = match hit {
        Some(byte) => {
            let map = CharMap::new(text);
            map.char_of(byte).saturating_sub(max_chars / 4)
        }
        None => 0,
    };

    let tail: String = text.chars().skip(start_char).collect();
    let mut snippet = ellipsize(tail.trim(), max_chars);
    if start_char > 0 && snippet.chars().count() + 3 <= max_chars {
        snippet.insert_str(0, "...");
    }
    Some(snippet)
}

/// Mapping between character positions and byte offsets of one string.
#[derive(Debug, Clone)]
pub struct CharMap {
    char_to_byte: Vec<usize>,
}

impl CharMap {
    pub fn new(text: &str) -> Self {
        let char_to_byte = text
            .char_indices()
            .map(|(byte_idx, _)| byte_idx)
            .chain(std::iter::once(text.len()))
            .collect();
        Self { char_to_byte }
    }

    /// Number of characters in the mapped string.
    pub fn len_chars(&self) -> usize {
        self.char_to_byte.len() - 1
    }

    /// Byte offset of character position `char_idx` (clamped to the end).
    pub fn byte(&self, char_idx: usize) -> usize {
        let idx = char_idx.min(self.len_chars());
        self.char_to_byte[idx]
    }

    /// Character position of a byte offset that lies on a char boundary.
    pub fn char_of(&self, byte: usize) -> usize {
        match self.char_to_byte.binary_search(&byte) {
            Ok(idx) => idx,
            Err(idx) => idx.saturating_sub(1),
        }
    }
}
