//! Deterministic query rewriting: paraphrased variants, keyword-only
//! queries and HyDE-style hypothetical answers. Nothing here calls a model.

use crate::text_util;

/// Leading phrases stripped to find the topic of a question, longest
/// first so "what is" wins over "what".
const QUESTION_PREFIXES: &[&str] = &[
    "can you explain",
    "tell me about",
    "what are the",
    "what is the",
    "how do you",
    "how does",
    "what are",
    "what is",
    "how do i",
    "why does",
    "how to",
    "why is",
    "describe",
    "explain",
    "where",
    "which",
    "what",
    "when",
    "how",
    "who",
    "why",
];

const INTERROGATIVES: &[&str] = &[
    "what", "how", "why", "who", "when", "where", "which", "can", "is", "does",
];

/// Generates alternative phrasings of a query to widen recall.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryExpander;

impl QueryExpander {
    /// Up to `n` distinct variants of `query`, the original first.
    ///
    /// Blank queries produce no variants.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrag::query_expansion::QueryExpander;
    ///
    /// let variants = QueryExpander.expand("How does caching work?", 3);
    /// assert_eq!(variants[0], "How does caching work?");
    /// assert_eq!(variants.len(), 3);
    /// ```
    pub fn expand(&self, query: &str, n: usize) -> Vec<String> {
        let query = query.trim();
        if query.is_empty() || n == 0 {
            return Vec::new();
        }

        let topic = topic(query);
        let candidates = if is_question(query) {
            vec![
                format!("Explain {topic}"),
                format!("Describe {topic}"),
                self.keywords(query).join(" "),
                format!("Information about {topic}"),
            ]
        } else {
            vec![
                format!("What is {topic}?"),
                format!("How does {topic} work?"),
                self.keywords(query).join(" "),
                format!("Explain {topic}"),
            ]
        };

        let mut variants = vec![query.to_string()];
        for candidate in candidates {
            if variants.len() >= n {
                break;
            }
            let candidate = candidate.trim();
            if candidate.is_empty()
                || variants.iter().any(|v| v.eq_ignore_ascii_case(candidate))
            {
                continue;
            }
            variants.push(candidate.to_string());
        }
        variants
    }

    /// Content words of `query`: lowercased tokens without stop words, in
    /// first-occurrence order.
    pub fn keywords(&self, query: &str) -> Vec<String> {
        let mut keywords: Vec<String> = Vec::new();
        for token in text_util::tokenize(query) {
            if !text_util::is_stop_word(&token) && !keywords.contains(&token) {
                keywords.push(token);
            }
        }
        keywords
    }

    /// A hypothetical answer passage for `query`, meant to be embedded in
    /// place of the query itself.
    pub fn hyde(&self, query: &str) -> String {
        let query = query.trim();
        if query.is_empty() {
            return String::new();
        }
        let topic = topic(query);
        let first = first_word(query);

        let lead = match first.as_str() {
            "how" => format!("The process for {topic} works as follows."),
            "why" => format!("The reason for {topic} is explained here."),
            "when" => format!("The timing of {topic} is described here."),
            "where" => format!("The location of {topic} is described here."),
            "who" => {
                format!("The people involved in {topic} are described here.")
            }
            _ => format!("{} is described here.", capitalize(&topic)),
        };
        let keywords = self.keywords(query);
        if keywords.is_empty() {
            lead
        } else {
            format!(
                "{lead} It covers {} and the details relevant to them.",
                keywords.join(", ")
            )
        }
    }
}

fn first_word(query: &str) -> String {
    query
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

fn is_question(query: &str) -> bool {
    query.ends_with('?')
        || INTERROGATIVES.contains(&first_word(query).as_str())
        || QUESTION_PREFIXES
            .iter()
            .any(|p| strip_prefix_ci(query, p).is_some())
}

/// `query` without a leading question phrase and trailing punctuation.
fn topic(query: &str) -> String {
    let mut rest = query.trim();
    for prefix in QUESTION_PREFIXES {
        if let Some(stripped) = strip_prefix_ci(rest, prefix) {
            rest = stripped;
            break;
        }
    }
    let rest = rest.trim().trim_end_matches(['?', '.', '!']).trim();
    if rest.is_empty() {
        query.trim_end_matches(['?', '.', '!']).trim().to_string()
    } else {
        rest.to_string()
    }
}

/// Case-insensitive whole-word prefix strip.
fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &s[prefix.len()..];
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() => Some(rest.trim_start()),
        Some(_) => None,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
