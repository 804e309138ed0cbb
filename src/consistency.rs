//! Cross-file consistency checks for a batch of patches
//!
//! The whole batch is applied in memory first, then every import that points
//! at a touched file is checked against that file's post-batch exports. Nothing
//! is written to disk here, so a broken batch can be rejected as a unit.

use crate::cache::{content_checksum, ContentCache};
use crate::files::FileSet;
use crate::graph::ImportResolver;
use crate::patch::{self, Patch};
use crate::symbols::{self, FileSymbols};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// An imported name the exporting file no longer provides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub importer: String,
    pub exporter: String,
    pub symbol: String,
    /// Line of the import statement in the importer
    pub line: usize,
}

impl fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} imports '{}' from {}, which does not export it",
            self.importer, self.line, self.symbol, self.exporter
        )
    }
}

/// A patch that could not be applied in memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyFailure {
    pub file_path: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("batch rejected: {} broken import(s), first: {}", .issues.len(), first_issue(.issues))]
    BatchRejected { issues: Vec<ConsistencyIssue> },
    #[error("batch rejected: {} patch(es) failed to apply ({})", .failures.len(), failed_paths(.failures))]
    ApplyFailed { failures: Vec<ApplyFailure> },
}

fn first_issue(issues: &[ConsistencyIssue]) -> String {
    issues.first().map(|i| i.to_string()).unwrap_or_default()
}

fn failed_paths(failures: &[ApplyFailure]) -> String {
    failures
        .iter()
        .map(|f| f.file_path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Default)]
pub struct ConsistencyReport {
    pub issues: Vec<ConsistencyIssue>,
    pub apply_failures: Vec<ApplyFailure>,
    /// Post-batch content of every successfully patched file
    pub contents: BTreeMap<String, String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty() && self.apply_failures.is_empty()
    }

    /// Accept the batch (yielding the patched contents) or reject it whole.
    pub fn into_result(self) -> Result<BTreeMap<String, String>, ConsistencyError> {
        if !self.apply_failures.is_empty() {
            return Err(ConsistencyError::ApplyFailed {
                failures: self.apply_failures,
            });
        }
        if !self.issues.is_empty() {
            return Err(ConsistencyError::BatchRejected {
                issues: self.issues,
            });
        }
        Ok(self.contents)
    }
}

pub struct ConsistencyChecker {
    resolver: ImportResolver,
    cache: Arc<ContentCache<FileSymbols>>,
}

impl ConsistencyChecker {
    pub fn new(resolver: ImportResolver) -> Self {
        Self::with_cache(resolver, Arc::new(ContentCache::new()))
    }

    /// Share a symbol cache with other components of the same session
    pub fn with_cache(resolver: ImportResolver, cache: Arc<ContentCache<FileSymbols>>) -> Self {
        Self { resolver, cache }
    }

    pub fn resolver(&self) -> &ImportResolver {
        &self.resolver
    }

    pub fn symbols(&self, content: &str) -> Arc<FileSymbols> {
        self.cache
            .get_or_insert_with(content_checksum(content), || symbols::extract(content))
    }

    /// Apply `patches` to `files` in memory and cross-check the result.
    ///
    /// Patches are applied in order, so two patches on one file compose. A
    /// patch with any failed hunk is left out of the post-batch state and
    /// reported in `apply_failures`.
    pub fn check_batch(&self, patches: &[Patch], files: &FileSet) -> ConsistencyReport {
        let mut post = files.clone();
        let mut touched = BTreeSet::new();
        let mut report = ConsistencyReport::default();

        for p in patches {
            let current = post.get(&p.file_path).unwrap_or("");
            let result = patch::apply(p, current);
            if result.success {
                post.upsert(p.file_path.clone(), result.new_content);
                touched.insert(p.file_path.clone());
            } else {
                tracing::debug!(
                    file = %p.file_path,
                    failed = result.hunks_failed,
                    "patch failed during consistency pre-apply"
                );
                report.apply_failures.push(ApplyFailure {
                    file_path: p.file_path.clone(),
                    errors: result.errors,
                });
            }
        }

        report.issues = self.check_exporters(&post, &touched);
        for path in touched {
            if let Some(content) = post.get(&path) {
                report.contents.insert(path, content.to_string());
            }
        }

        tracing::debug!(
            patches = patches.len(),
            issues = report.issues.len(),
            failures = report.apply_failures.len(),
            "consistency check finished"
        );
        report
    }

    /// Check current imports of `touched` files across a file set that is
    /// already in its final state.
    pub fn check_touched(&self, files: &FileSet, touched: &[String]) -> Vec<ConsistencyIssue> {
        let touched: BTreeSet<String> = touched.iter().cloned().collect();
        self.check_exporters(files, &touched)
    }

    /// Exported names present in `original` but gone from `patched`
    pub fn removed_exports(&self, original: &str, patched: &str) -> BTreeSet<String> {
        let before = self.symbols(original);
        let after = self.symbols(patched);
        if !after.exports.wildcard_sources.is_empty() {
            return BTreeSet::new();
        }
        before
            .exports
            .names
            .difference(&after.exports.names)
            .cloned()
            .collect()
    }

    /// Imports elsewhere in `files` that break when `file_path` changes from
    /// `original` to `patched`. Only names this change removed are reported.
    pub fn broken_by_change(
        &self,
        file_path: &str,
        original: &str,
        patched: &str,
        files: &FileSet,
    ) -> Vec<ConsistencyIssue> {
        let removed = self.removed_exports(original, patched);
        if removed.is_empty() {
            return Vec::new();
        }

        let mut post = files.clone();
        post.upsert(file_path, patched);
        let exporter = crate::util::normalize_path(file_path);
        self.check_exporters(&post, &BTreeSet::from([exporter]))
            .into_iter()
            .filter(|issue| removed.contains(&issue.symbol))
            .collect()
    }

    fn check_exporters(&self, files: &FileSet, exporters: &BTreeSet<String>) -> Vec<ConsistencyIssue> {
        if exporters.is_empty() {
            return Vec::new();
        }
        let known: HashSet<&str> = files.paths().collect();
        let mut issues = Vec::new();

        for file in files.iter().filter(|f| symbols::is_script_module(&f.path)) {
            let importer = self.symbols(&file.content);
            for decl in &importer.imports {
                let Some(target) = self
                    .resolver
                    .resolve(&file.path, &decl.source, |p| known.contains(p))
                else {
                    continue;
                };
                if target == file.path || !exporters.contains(&target) {
                    continue;
                }
                let Some(target_content) = files.get(&target) else {
                    continue;
                };
                let exports = &self.symbols(target_content).exports;
                for name in &decl.named {
                    if name.imported == "default" || exports.provides(&name.imported) {
                        continue;
                    }
                    issues.push(ConsistencyIssue {
                        importer: file.path.clone(),
                        exporter: target.clone(),
                        symbol: name.imported.clone(),
                        line: decl.line,
                    });
                }
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Hunk;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn base_files() -> FileSet {
        FileSet::from_pairs([
            ("a.ts", "export function foo() {}\nexport const bar = 1;\n"),
            ("b.ts", "import { bar } from './a';\n\nconsole.log(bar);\n"),
        ])
    }

    #[test]
    fn test_removed_export_still_imported() {
        let files = base_files();
        let remove_foo = Patch::new(
            "a.ts",
            "drop foo",
            vec![Hunk::new(1, lines(&["export function foo() {}"]), vec![])],
        );
        let import_foo = Patch::new(
            "b.ts",
            "use foo",
            vec![Hunk::new(
                1,
                lines(&["import { bar } from './a';"]),
                lines(&["import { bar, foo } from './a';"]),
            )],
        );

        let checker = ConsistencyChecker::new(ImportResolver::default());
        let report = checker.check_batch(&[remove_foo, import_foo], &files);

        assert_eq!(report.issues.len(), 1);
        let issue = &report.issues[0];
        assert_eq!(issue.symbol, "foo");
        assert_eq!(issue.exporter, "a.ts");
        assert_eq!(issue.importer, "b.ts");
        assert!(matches!(
            report.into_result(),
            Err(ConsistencyError::BatchRejected { .. })
        ));
    }

    #[test]
    fn test_consistent_batch_yields_contents() {
        let files = base_files();
        let rename = Patch::new(
            "a.ts",
            "add baz",
            vec![Hunk::new(3, vec![], lines(&["export const baz = 2;"]))],
        );
        let checker = ConsistencyChecker::new(ImportResolver::default());
        let contents = checker
            .check_batch(&[rename], &files)
            .into_result()
            .unwrap();
        assert!(contents["a.ts"].ends_with("export const baz = 2;\n"));
        assert!(!contents.contains_key("b.ts"));
    }

    #[test]
    fn test_wildcard_reexport_satisfies_everything() {
        let files = FileSet::from_pairs([
            ("index.ts", "export const x = 1;\n"),
            ("user.ts", "import { anything } from './index';\n"),
        ]);
        let patch = Patch::new(
            "index.ts",
            "forward",
            vec![Hunk::new(
                1,
                lines(&["export const x = 1;"]),
                lines(&["export * from './impl';"]),
            )],
        );
        let checker = ConsistencyChecker::new(ImportResolver::default());
        assert!(checker.check_batch(&[patch], &files).is_consistent());
    }

    #[test]
    fn test_unappliable_patch_is_reported() {
        let files = base_files();
        let bad = Patch::new(
            "a.ts",
            "bad",
            vec![Hunk::new(1, lines(&["no such line"]), lines(&["x"]))],
        );
        let checker = ConsistencyChecker::new(ImportResolver::default());
        let report = checker.check_batch(&[bad], &files);
        assert_eq!(report.apply_failures.len(), 1);
        assert!(matches!(
            report.into_result(),
            Err(ConsistencyError::ApplyFailed { .. })
        ));
    }

    #[test]
    fn test_broken_by_change_only_reports_removed_names() {
        let files = FileSet::from_pairs([
            ("a.ts", "export const keep = 1;\nexport const gone = 2;\n"),
            ("b.ts", "import { keep, gone, neverExisted } from './a';\n"),
        ]);
        let checker = ConsistencyChecker::new(ImportResolver::default());
        let issues = checker.broken_by_change(
            "a.ts",
            "export const keep = 1;\nexport const gone = 2;\n",
            "export const keep = 1;\n",
            &files,
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].symbol, "gone");
    }
}
