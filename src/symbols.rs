//! Import/export extraction for JavaScript/TypeScript-style modules
//!
//! Regex based on purpose: patched content is frequently mid-edit and not
//! parseable, and only module-level declarations matter here.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// File extensions treated as ES/CommonJS modules
pub const SCRIPT_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "mts", "cts"];

static EXPORT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*export\s+(?:declare\s+)?(?:async\s+)?(?:abstract\s+)?(?:function\*?|class|const|let|var|interface|type|enum|namespace)\s+([A-Za-z_$][\w$]*)",
    )
    .expect("valid export declaration regex")
});
static EXPORT_DEFAULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*export\s+default\b").expect("valid export default regex")
});
static EXPORT_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*export\s+(?:type\s+)?\{([^}]*)\}(?:\s*from\s*['"]([^'"]+)['"])?"#)
        .expect("valid export list regex")
});
static EXPORT_STAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*export\s+\*\s*(?:as\s+([A-Za-z_$][\w$]*)\s+)?from\s*['"]([^'"]+)['"]"#)
        .expect("valid export star regex")
});
static IMPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s+(type\s+)?([^'";]+?)\s+from\s*['"]([^'"]+)['"]"#)
        .expect("valid import regex")
});
static IMPORT_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s*['"]([^'"]+)['"]"#).expect("valid bare import regex")
});
static REQUIRE_OR_DYNAMIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:require|import)\(\s*['"]([^'"]+)['"]\s*\)"#)
        .expect("valid require regex")
});

/// One name brought in by a named import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedName {
    /// Name as exported by the source module
    pub imported: String,
    /// Name bound in the importing module
    pub local: String,
}

/// A single `import ... from '...'` statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDecl {
    pub source: String,
    pub line: usize,
    pub end_line: usize,
    pub default: Option<String>,
    pub namespace: Option<String>,
    pub named: Vec<ImportedName>,
    pub type_only: bool,
}

impl ImportDecl {
    /// Every identifier this statement binds locally
    pub fn local_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        if let Some(d) = &self.default {
            names.push(d);
        }
        if let Some(ns) = &self.namespace {
            names.push(ns);
        }
        names.extend(self.named.iter().map(|n| n.local.as_str()));
        names
    }
}

/// Symbols a module makes available to importers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSet {
    pub names: BTreeSet<String>,
    pub has_default: bool,
    /// Sources of `export * from '...'` re-exports
    pub wildcard_sources: Vec<String>,
}

impl ExportSet {
    /// Whether `name` may be imported from this module.
    ///
    /// A wildcard re-export can forward any name, so it satisfies everything.
    pub fn provides(&self, name: &str) -> bool {
        self.names.contains(name) || !self.wildcard_sources.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && !self.has_default && self.wildcard_sources.is_empty()
    }
}

/// Everything extracted from one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSymbols {
    pub exports: ExportSet,
    pub imports: Vec<ImportDecl>,
}

pub fn extract(content: &str) -> FileSymbols {
    FileSymbols {
        exports: extract_exports(content),
        imports: extract_imports(content),
    }
}

pub fn is_script_module(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| SCRIPT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

pub fn extract_exports(content: &str) -> ExportSet {
    let mut set = ExportSet::default();

    for cap in EXPORT_DECL.captures_iter(content) {
        set.names.insert(cap[1].to_string());
    }
    if EXPORT_DEFAULT.is_match(content) {
        set.has_default = true;
    }
    for cap in EXPORT_LIST.captures_iter(content) {
        for item in split_list(&cap[1]) {
            let exported = match item.split_once(" as ") {
                Some((_, alias)) => alias.trim(),
                None => item,
            };
            if exported == "default" {
                set.has_default = true;
            } else {
                set.names.insert(exported.to_string());
            }
        }
    }
    for cap in EXPORT_STAR.captures_iter(content) {
        match cap.get(1) {
            Some(alias) => {
                set.names.insert(alias.as_str().to_string());
            }
            None => set.wildcard_sources.push(cap[2].to_string()),
        }
    }

    set
}

pub fn extract_imports(content: &str) -> Vec<ImportDecl> {
    let mut imports = Vec::new();

    for cap in IMPORT_FROM.captures_iter(content) {
        let Some(whole) = cap.get(0) else { continue };
        let (default, namespace, named) = parse_import_clause(&cap[2]);
        imports.push(ImportDecl {
            source: cap[3].to_string(),
            line: line_of(content, whole.start()),
            end_line: line_of(content, whole.end()),
            default,
            namespace,
            named,
            type_only: cap.get(1).is_some(),
        });
    }
    for cap in IMPORT_BARE.captures_iter(content) {
        let Some(whole) = cap.get(0) else { continue };
        let line = line_of(content, whole.start());
        imports.push(ImportDecl {
            source: cap[1].to_string(),
            line,
            end_line: line,
            default: None,
            namespace: None,
            named: Vec::new(),
            type_only: false,
        });
    }

    imports.sort_by_key(|i| i.line);
    imports
}

/// Every module specifier the file depends on: static imports, re-exports,
/// `require(...)` and dynamic `import(...)`.
pub fn module_specifiers(content: &str) -> Vec<String> {
    let mut specs: Vec<String> = extract_imports(content)
        .into_iter()
        .map(|i| i.source)
        .collect();
    specs.extend(
        EXPORT_LIST
            .captures_iter(content)
            .filter_map(|c| c.get(2).map(|m| m.as_str().to_string())),
    );
    specs.extend(EXPORT_STAR.captures_iter(content).map(|c| c[2].to_string()));
    specs.extend(
        REQUIRE_OR_DYNAMIC
            .captures_iter(content)
            .map(|c| c[1].to_string()),
    );
    specs.sort();
    specs.dedup();
    specs
}

fn parse_import_clause(clause: &str) -> (Option<String>, Option<String>, Vec<ImportedName>) {
    let clause = clause.trim();
    let mut default = None;
    let mut namespace = None;
    let mut named = Vec::new();

    let (head, braces) = match clause.find('{') {
        Some(open) => {
            let close = clause.rfind('}').unwrap_or(clause.len()).max(open + 1);
            (&clause[..open], Some(&clause[open + 1..close]))
        }
        None => (clause, None),
    };

    for part in split_list(head) {
        if let Some(rest) = part.strip_prefix('*') {
            let name = rest.trim().trim_start_matches("as").trim();
            if !name.is_empty() {
                namespace = Some(name.to_string());
            }
        } else if is_identifier(part) {
            default = Some(part.to_string());
        }
    }

    if let Some(list) = braces {
        for item in split_list(list) {
            let (imported, local) = match item.split_once(" as ") {
                Some((imported, local)) => (imported.trim(), local.trim()),
                None => (item, item),
            };
            if is_identifier(imported) && is_identifier(local) {
                named.push(ImportedName {
                    imported: imported.to_string(),
                    local: local.to_string(),
                });
            }
        }
    }

    (default, namespace, named)
}

/// Split a comma list, dropping blanks and inline `type` modifiers
fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',')
        .map(|item| {
            let item = item.trim();
            item.strip_prefix("type ").map(str::trim).unwrap_or(item)
        })
        .filter(|item| !item.is_empty())
}

pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// 1-based line number of a byte offset
pub fn line_of(content: &str, offset: usize) -> usize {
    content[..offset.min(content.len())].matches('\n').count() + 1
}
