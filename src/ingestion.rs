use std::path::Path;

use rayon::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::{chunking::ChunkMetadata, walker::DiscoveredFile};

/// Length of the hex file id derived from a path.
const FILE_ID_LEN: usize = 12;

/// Extracted text of one source file, ready for chunking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceDocument {
    /// Stable id derived from the path.
    pub file_id: String,
    /// Path relative to the ingested root.
    pub filename: String,
    /// Lowercased extension, if any.
    pub file_type: Option<String>,
    pub title: String,
    pub text: String,
}

impl SourceDocument {
    pub fn new(
        filename: impl Into<String>,
        file_type: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        let filename = filename.into();
        let text = text.into();
        Self {
            file_id: file_id(&filename),
            title: extract_title(&text, Path::new(&filename)),
            filename,
            file_type,
            text,
        }
    }

    /// Base metadata stamped onto every chunk of this document.
    pub fn metadata(&self) -> ChunkMetadata {
        let mut metadata =
            ChunkMetadata::for_source(&self.file_id, &self.filename);
        metadata
            .extra
            .insert("title".to_string(), self.title.clone().into());
        metadata
    }
}

/// Short blake3 hex digest of `path`.
pub fn file_id(path: &str) -> String {
    let hex = blake3::hash(path.as_bytes()).to_hex();
    hex[..FILE_ID_LEN].to_string()
}

/// Read files in parallel. Unreadable or non-UTF-8 files are logged and
/// skipped; the output keeps the input order.
pub fn load_documents(files: &[DiscoveredFile]) -> Vec<SourceDocument> {
    files
        .par_iter()
        .filter_map(|file| {
            let text = match std::fs::read_to_string(&file.absolute_path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        path = %file.absolute_path.display(),
                        error = %e,
                        "skipping unreadable file"
                    );
                    return None;
                }
            };
            Some(SourceDocument::new(
                file.relative_path.to_string_lossy(),
                file.extension(),
                text,
            ))
        })
        .collect()
}

/// Extract a title from file content.
///
/// Looks for the first markdown heading (line starting with `# `).
/// Falls back to the filename without extension.
pub fn extract_title(content: &str, file_path: &Path) -> String {
    for line in content.lines() {
        if let Some(heading) = line.trim().strip_prefix("# ") {
            let title = heading.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }

    file_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string()
}
