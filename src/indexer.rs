//! Corpus indexer.
//!
//! Walks the corpus root, applies include/exclude globs and optional
//! subdirectory filters, and numbers the surviving documents by
//! `(category, filename)`. Files that are not valid UTF-8 are skipped and
//! reported as [`IndexWarning`]s. Document text is never kept in the index;
//! see [`Document::load_text`].

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::error::{QaError, Result};
use crate::models::{path_to_slash, Document};

/// Category assigned to files directly under the corpus root.
pub const ROOT_CATEGORY: &str = "root";

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
    /// Restrict the walk to these subdirectories of the root. Empty means all.
    pub subdirs: Vec<String>,
}

impl IndexOptions {
    pub fn from_config(corpus: &CorpusConfig) -> Self {
        Self {
            include_globs: corpus.include_globs.clone(),
            exclude_globs: corpus.exclude_globs.clone(),
            follow_symlinks: corpus.follow_symlinks,
            subdirs: Vec::new(),
        }
    }

    pub fn with_subdirs(mut self, subdirs: Vec<String>) -> Self {
        self.subdirs = subdirs;
        self
    }
}

/// A file that was seen but not indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexWarning {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorpusStats {
    pub document_count: usize,
    pub per_category_counts: BTreeMap<String, usize>,
    pub total_bytes: u64,
}

/// Result of one indexing pass.
#[derive(Debug, Clone)]
pub struct CorpusIndex {
    root: PathBuf,
    documents: Vec<Document>,
    warnings: Vec<IndexWarning>,
}

impl CorpusIndex {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn into_documents(self) -> Vec<Document> {
        self.documents
    }

    pub fn warnings(&self) -> &[IndexWarning] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == id)
    }

    /// Look a document up by ID (`7` or `007`), relative path, or file stem.
    pub fn find(&self, query: &str) -> Option<&Document> {
        if let Ok(id) = query.parse::<u32>() {
            if let Some(doc) = self.get(id) {
                return Some(doc);
            }
        }
        let normalized = query.replace('\\', "/");
        self.documents
            .iter()
            .find(|d| d.relative_path == normalized)
            .or_else(|| self.documents.iter().find(|d| d.name == query))
    }

    /// Summary derived from this pass. Never touches the filesystem.
    pub fn stats(&self) -> CorpusStats {
        let mut per_category_counts = BTreeMap::new();
        let mut total_bytes = 0u64;
        for doc in &self.documents {
            *per_category_counts.entry(doc.category.clone()).or_insert(0) += 1;
            total_bytes += doc.size;
        }
        CorpusStats {
            document_count: self.documents.len(),
            per_category_counts,
            total_bytes,
        }
    }
}

/// Walk `root` and build a numbered index.
pub fn index_corpus(root: &Path, options: &IndexOptions) -> Result<CorpusIndex> {
    if !root.is_dir() {
        return Err(QaError::storage(
            root,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "corpus root does not exist or is not a directory",
            ),
        ));
    }

    let include_set = build_globset(&options.include_globs)?;
    let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
    default_excludes.extend(options.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let subdirs: Vec<Vec<String>> = options
        .subdirs
        .iter()
        .map(|s| split_components(Path::new(s)))
        .collect();

    let mut documents = Vec::new();
    let mut warnings = Vec::new();

    let walker = WalkDir::new(root).follow_links(options.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                warn!(path = %path.display(), "skipping unreadable entry: {}", e);
                warnings.push(IndexWarning {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = path_to_slash(relative);

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        if !subdirs.is_empty() {
            let components = split_components(relative);
            if !subdirs.iter().any(|s| components.starts_with(s)) {
                continue;
            }
        }

        match describe_file(path, relative) {
            Ok(doc) => documents.push(doc),
            Err(reason) => {
                warn!(path = %path.display(), "skipping document: {}", reason);
                warnings.push(IndexWarning {
                    path: path.to_path_buf(),
                    reason,
                });
            }
        }
    }

    documents.sort_by(|a, b| {
        (a.category.as_str(), file_name(&a.path), a.relative_path.as_str()).cmp(&(
            b.category.as_str(),
            file_name(&b.path),
            b.relative_path.as_str(),
        ))
    });
    for (i, doc) in documents.iter_mut().enumerate() {
        doc.id = i as u32 + 1;
    }

    debug!(
        root = %root.display(),
        documents = documents.len(),
        warnings = warnings.len(),
        "indexed corpus"
    );

    Ok(CorpusIndex {
        root: root.to_path_buf(),
        documents,
        warnings,
    })
}

/// Describe one file outside of an index pass, as document 1.
///
/// Used by single-document QA when the argument is a path rather than an
/// indexed ID.
pub fn document_from_path(path: &Path) -> Result<Document> {
    let relative = path.file_name().map(Path::new).unwrap_or(path);
    let mut doc = describe_file(path, relative).map_err(|reason| {
        QaError::storage(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, reason),
        )
    })?;
    if let Some(parent) = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
    {
        doc.category = parent;
    }
    doc.id = 1;
    Ok(doc)
}

fn describe_file(path: &Path, relative: &Path) -> std::result::Result<Document, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    if std::str::from_utf8(&bytes).is_err() {
        return Err("not valid UTF-8 text".to_string());
    }

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let hash = format!("{:x}", hasher.finalize());

    let category = relative
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| ROOT_CATEGORY.to_string());
    let name = path
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(Document {
        id: 0,
        path: path.to_path_buf(),
        relative_path: path_to_slash(relative),
        category,
        name,
        size: bytes.len() as u64,
        hash: hash[..8].to_string(),
    })
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

fn split_components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| QaError::config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| QaError::config(format!("invalid glob set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> IndexOptions {
        IndexOptions {
            include_globs: vec!["**/*.txt".into()],
            ..Default::default()
        }
    }

    fn corpus() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("空家")).unwrap();
        std::fs::create_dir_all(root.join("補助金")).unwrap();
        std::fs::write(root.join("空家/b.txt"), "管理不全空家等とは").unwrap();
        std::fs::write(root.join("空家/a.txt"), "空家等対策").unwrap();
        std::fs::write(root.join("補助金/z.txt"), "補助金交付要綱").unwrap();
        std::fs::write(root.join("readme.txt"), "top level").unwrap();
        std::fs::write(root.join("notes.md"), "not included").unwrap();
        tmp
    }

    #[test]
    fn test_sorted_by_category_then_filename() {
        let tmp = corpus();
        let index = index_corpus(tmp.path(), &options()).unwrap();
        let order: Vec<_> = index
            .documents()
            .iter()
            .map(|d| (d.id, d.relative_path.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (1, "readme.txt"),
                (2, "空家/a.txt"),
                (3, "空家/b.txt"),
                (4, "補助金/z.txt"),
            ]
        );
        assert_eq!(index.documents()[0].category, ROOT_CATEGORY);
    }

    #[test]
    fn test_reindex_is_deterministic() {
        let tmp = corpus();
        let first = index_corpus(tmp.path(), &options()).unwrap();
        let second = index_corpus(tmp.path(), &options()).unwrap();
        assert_eq!(first.documents(), second.documents());
    }

    #[test]
    fn test_subdir_filter_numbers_after_filtering() {
        let tmp = corpus();
        let opts = options().with_subdirs(vec!["補助金".into()]);
        let index = index_corpus(tmp.path(), &opts).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.documents()[0].id, 1);
        assert_eq!(index.documents()[0].name, "z");
    }

    #[test]
    fn test_multiple_subdirs() {
        let tmp = corpus();
        let opts = options().with_subdirs(vec!["補助金".into(), "空家".into()]);
        let index = index_corpus(tmp.path(), &opts).unwrap();
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_non_utf8_becomes_warning() {
        let tmp = corpus();
        std::fs::write(tmp.path().join("空家/sjis.txt"), [0x82, 0xa0, 0xff, 0xfe]).unwrap();
        let index = index_corpus(tmp.path(), &options()).unwrap();
        assert_eq!(index.len(), 4);
        assert_eq!(index.warnings().len(), 1);
        assert!(index.warnings()[0].path.ends_with("sjis.txt"));
    }

    #[test]
    fn test_stats() {
        let tmp = corpus();
        let index = index_corpus(tmp.path(), &options()).unwrap();
        let stats = index.stats();
        assert_eq!(stats.document_count, 4);
        assert_eq!(stats.per_category_counts.get("空家"), Some(&2));
        assert_eq!(stats.per_category_counts.get(ROOT_CATEGORY), Some(&1));
        let expected: u64 = index.documents().iter().map(|d| d.size).sum();
        assert_eq!(stats.total_bytes, expected);
    }

    #[test]
    fn test_find_by_id_path_and_stem() {
        let tmp = corpus();
        let index = index_corpus(tmp.path(), &options()).unwrap();
        assert_eq!(index.find("003").unwrap().name, "b");
        assert_eq!(index.find("補助金/z.txt").unwrap().id, 4);
        assert_eq!(index.find("readme").unwrap().id, 1);
        assert!(index.find("missing").is_none());
    }

    #[test]
    fn test_hash_is_short_prefix() {
        let tmp = corpus();
        let index = index_corpus(tmp.path(), &options()).unwrap();
        let doc = &index.documents()[0];
        assert_eq!(doc.hash.len(), 8);
        assert!(doc.hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_missing_root() {
        let tmp = TempDir::new().unwrap();
        let err = index_corpus(&tmp.path().join("nope"), &options()).unwrap_err();
        assert_eq!(err.kind(), "storage_failure");
    }
}
