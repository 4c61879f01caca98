//! Citation tracking for one generated response.
//!
//! A [`CitationManager`] is created per response and never shared: ids are
//! assigned sequentially from 1 in the order sources are added.

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    context::ContextSource,
    error::{Error, Result},
    text_util,
};

/// Longest stored snippet, in characters, including the `...` marker.
pub const MAX_SNIPPET_CHARS: usize = 150;

const SUPERSCRIPT_DIGITS: [char; 10] =
    ['⁰', '¹', '²', '³', '⁴', '⁵', '⁶', '⁷', '⁸', '⁹'];

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CitationFormat {
    /// `[guide.md, p.3]`
    Inline,
    /// `(1)`
    #[default]
    Numbered,
    /// `[1]`
    Footnote,
    /// `[^1]`
    Markdown,
    /// `¹`
    Superscript,
}

impl CitationFormat {
    pub const ALL: [CitationFormat; 5] = [
        Self::Inline,
        Self::Numbered,
        Self::Footnote,
        Self::Markdown,
        Self::Superscript,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Numbered => "numbered",
            Self::Footnote => "footnote",
            Self::Markdown => "markdown",
            Self::Superscript => "superscript",
        }
    }

    /// Parse a style name; unknown names are [`Error::Unsupported`].
    pub fn parse(name: &str) -> Result<Self> {
        let normalized = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == normalized)
            .ok_or_else(|| Error::unsupported("citation format", name))
    }

    /// Markers that sit directly against each other and the text.
    fn is_compact(self) -> bool {
        matches!(self, Self::Footnote | Self::Markdown | Self::Superscript)
    }
}

impl FromStr for CitationFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CitationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub citation_id: usize,
    pub chunk_id: usize,
    pub file_id: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub relevance_score: f32,
    pub content_snippet: String,
}

/// Input for [`CitationManager::add`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCitation {
    pub chunk_id: usize,
    pub file_id: String,
    pub filename: String,
    pub relevance_score: f32,
    pub snippet: String,
    pub page_number: Option<u32>,
    pub section: Option<String>,
}

impl NewCitation {
    /// Describe a retrieved chunk. The source falls back from `file_id` to
    /// `filename` (and vice versa), then to `"unknown"`.
    pub fn from_source<T: ContextSource>(source: &T) -> Self {
        let metadata = source.metadata();
        let file_id = metadata
            .source_key()
            .unwrap_or("unknown")
            .to_string();
        let filename = metadata
            .filename
            .clone()
            .unwrap_or_else(|| file_id.clone());
        Self {
            chunk_id: source.chunk_id(),
            file_id,
            filename,
            relevance_score: source.score(),
            snippet: source.content().to_string(),
            page_number: metadata.page_number,
            section: metadata.header.clone(),
        }
    }

    /// Narrow the snippet to the passage around `query`.
    pub fn focused(mut self, query: &str) -> Self {
        if let Some(snippet) =
            text_util::extract_snippet(&self.snippet, query, MAX_SNIPPET_CHARS)
        {
            self.snippet = snippet;
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CitationManager {
    style: CitationFormat,
    citations: Vec<Citation>,
    by_source: HashMap<(String, usize), usize>,
}

impl CitationManager {
    pub fn new(style: CitationFormat) -> Self {
        Self {
            style,
            citations: Vec::new(),
            by_source: HashMap::new(),
        }
    }

    pub fn style(&self) -> CitationFormat {
        self.style
    }

    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn len(&self) -> usize {
        self.citations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }

    pub fn get(&self, citation_id: usize) -> Option<&Citation> {
        citation_id
            .checked_sub(1)
            .and_then(|i| self.citations.get(i))
    }

    /// Register a source and return its citation. Adding the same
    /// `(file_id, chunk_id)` again returns the existing citation.
    pub fn add(&mut self, new: NewCitation) -> Citation {
        let key = (new.file_id.clone(), new.chunk_id);
        if let Some(&i) = self.by_source.get(&key) {
            return self.citations[i].clone();
        }

        let citation = Citation {
            citation_id: self.citations.len() + 1,
            chunk_id: new.chunk_id,
            file_id: new.file_id,
            filename: new.filename,
            page_number: new.page_number,
            section: new.section,
            relevance_score: new.relevance_score,
            content_snippet: text_util::ellipsize(
                new.snippet.trim(),
                MAX_SNIPPET_CHARS,
            ),
        };
        self.by_source.insert(key, self.citations.len());
        self.citations.push(citation.clone());
        citation
    }

    /// Render the marker for `citation` in this manager's style.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrag::citation::{CitationFormat, CitationManager, NewCitation};
    ///
    /// let mut manager = CitationManager::new(CitationFormat::Markdown);
    /// let citation = manager.add(NewCitation {
    ///     file_id: "f1".into(),
    ///     filename: "guide.md".into(),
    ///     ..NewCitation::default()
    /// });
    /// assert_eq!(manager.format(&citation), "[^1]");
    /// ```
    pub fn format(&self, citation: &Citation) -> String {
        format_citation(citation, self.style)
    }

    /// Append one marker per distinct source file to the end of the first
    /// paragraph of `text`. Markers are not placed per claim.
    pub fn inject(&self, text: &str, citations: &[Citation]) -> String {
        let mut seen: Vec<&str> = Vec::new();
        let mut markers = Vec::new();
        for citation in citations {
            if !seen.contains(&citation.file_id.as_str()) {
                seen.push(&citation.file_id);
                markers.push(self.format(citation));
            }
        }
        if markers.is_empty() || text.trim().is_empty() {
            return text.to_string();
        }

        let (separator, lead) = match self.style {
            CitationFormat::Superscript => (",", ""),
            style if style.is_compact() => ("", ""),
            _ => (" ", " "),
        };
        let marker_text = markers.join(separator);

        let (first, rest) = match text.find("\n\n") {
            Some(i) => text.split_at(i),
            None => (text, ""),
        };
        format!("{}{lead}{marker_text}{rest}", first.trim_end())
    }

    /// One numbered line per cited file, listing cited pages and sections.
    pub fn references(&self) -> String {
        let mut files: Vec<(&str, &str, Vec<u32>, Vec<&str>)> = Vec::new();
        for c in &self.citations {
            let i = match files.iter().position(|f| f.0 == c.file_id) {
                Some(i) => i,
                None => {
                    files.push((
                        c.file_id.as_str(),
                        c.filename.as_str(),
                        Vec::new(),
                        Vec::new(),
                    ));
                    files.len() - 1
                }
            };
            let entry = &mut files[i];
            if let Some(page) = c.page_number
                && !entry.2.contains(&page)
            {
                entry.2.push(page);
            }
            if let Some(section) = c.section.as_deref()
                && !entry.3.contains(&section)
            {
                entry.3.push(section);
            }
        }

        let mut out = String::new();
        for (n, (_, filename, mut pages, sections)) in
            files.into_iter().enumerate()
        {
            pages.sort_unstable();
            let mut details = Vec::new();
            if !pages.is_empty() {
                let pages: Vec<String> =
                    pages.iter().map(u32::to_string).collect();
                let label = if pages.len() == 1 { "p." } else { "pp." };
                details.push(format!("{label} {}", pages.join(", ")));
            }
            if !sections.is_empty() {
                let sections: Vec<String> =
                    sections.iter().map(|s| format!("§{s}")).collect();
                details.push(sections.join(", "));
            }

            out.push_str(&format!("{}. {filename}", n + 1));
            if !details.is_empty() {
                out.push_str(&format!(" ({})", details.join("; ")));
            }
            out.push('\n');
        }
        out
    }
}

/// Render a citation marker in `style`.
pub fn format_citation(citation: &Citation, style: CitationFormat) -> String {
    let n = citation.citation_id;
    match style {
        CitationFormat::Inline => {
            let name = &citation.filename;
            match (citation.page_number, &citation.section) {
                (Some(page), _) => format!("[{name}, p.{page}]"),
                (None, Some(section)) => format!("[{name}, §{section}]"),
                (None, None) => format!("[{name}]"),
            }
        }
        CitationFormat::Numbered => format!("({n})"),
        CitationFormat::Footnote => format!("[{n}]"),
        CitationFormat::Markdown => format!("[^{n}]"),
        CitationFormat::Superscript => n
            .to_string()
            .chars()
            .filter_map(|d| d.to_digit(10))
            .map(|d| SUPERSCRIPT_DIGITS[d as usize])
            .collect(),
    }
}
