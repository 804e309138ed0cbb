//! In-memory file sets
//!
//! Paths are POSIX-style and relative to a project root regardless of host OS.

use crate::util::normalize_path;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Files larger than this are not loaded into a file set
const MAX_FILE_BYTES: u64 = 1_000_000;

const SKIP_DIRS: &[&str] = &["node_modules", "target", "dist", "build", "vendor"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// Ordered collection of `{path, content}` pairs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    files: Vec<SourceFile>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, P, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let mut set = Self::new();
        for (path, content) in pairs {
            set.upsert(path, content);
        }
        set
    }

    /// Load every UTF-8 text file under `root`, skipping hidden and build directories.
    pub fn load_dir(root: &Path) -> anyhow::Result<Self> {
        let mut set = Self::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0 || !(name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()))
            });

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                // Binary or non-UTF-8
                continue;
            };
            let relative = entry.path().strip_prefix(root)?;
            set.upsert(relative.to_string_lossy(), content);
        }

        Ok(set)
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        let path = normalize_path(path);
        self.files
            .iter()
            .find(|f| f.path == path)
            .map(|f| f.content.as_str())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Replace the content of `path`, appending it if it is new.
    pub fn upsert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        let path = normalize_path(&path.into());
        let content = content.into();
        match self.files.iter_mut().find(|f| f.path == path) {
            Some(existing) => existing.content = content,
            None => self.files.push(SourceFile { path, content }),
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<String> {
        let path = normalize_path(path);
        let idx = self.files.iter().position(|f| f.path == path)?;
        Some(self.files.remove(idx).content)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceFile> {
        self.files.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
