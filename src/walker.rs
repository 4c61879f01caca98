use std::path::{Path, PathBuf};

use globset::GlobSet;

use crate::error::Result;

/// A discovered source file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Path relative to the walked root directory.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
}

impl DiscoveredFile {
    /// Lowercased extension, used as the document's file type.
    pub fn extension(&self) -> Option<String> {
        self.relative_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }
}

/// Text, markup and source-code extensions picked up by discovery.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "rst", "rs", "py", "js", "jsx", "mjs", "ts",
    "tsx", "go", "java", "c", "h", "cc", "cpp", "hpp", "rb", "php",
];

/// Recursively walk a directory and discover eligible files.
///
/// Skips hidden files/directories (names starting with `.`), keeps only
/// [`SUPPORTED_EXTENSIONS`] and, when `filter` is given, only relative
/// paths it matches. Results are sorted by relative path.
pub fn discover_files(
    root: &Path,
    filter: Option<&GlobSet>,
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, &mut results)?;
    if let Some(filter) = filter {
        results.retain(|f| filter.is_match(&f.relative_path));
    }
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

/// Discover files under every path in `paths`. Plain files are taken as
/// given (relative to their parent); directories are walked.
pub fn discover_all(
    paths: &[PathBuf],
    filter: Option<&GlobSet>,
) -> Result<Vec<DiscoveredFile>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(discover_files(path, filter)?);
        } else {
            let absolute_path = path.canonicalize()?;
            let relative_path = absolute_path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| path.clone());
            files.push(DiscoveredFile {
                relative_path,
                absolute_path,
            });
        }
    }
    Ok(files)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            walk_dir(root, &entry.path(), results)?;
        } else if file_type.is_symlink() {
            let Ok(resolved) = entry.path().canonicalize() else {
                continue;
            };
            // Directory links back into the root would loop.
            if resolved.starts_with(root) && resolved.is_dir() {
                continue;
            }
            if resolved.is_file() && is_supported(&resolved) {
                results.push(make_discovered(root, &entry.path(), resolved));
            }
        } else if file_type.is_file() && is_supported(&entry.path()) {
            let abs = entry.path().canonicalize()?;
            results.push(make_discovered(root, &entry.path(), abs));
        }
    }

    Ok(())
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        })
}

fn make_discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: PathBuf,
) -> DiscoveredFile {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();
    DiscoveredFile {
        relative_path,
        absolute_path,
    }
}
