//! Dependency graph across a file set
//!
//! Nodes are file paths; an edge `a -> b` means `a` imports a specifier that
//! resolves to `b` inside the set. External packages and unresolvable
//! specifiers are dropped.

use crate::files::FileSet;
use crate::symbols;
use crate::util::{normalize_path, parent_dir};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Extensions tried when a specifier omits one
pub const DEFAULT_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];

/// Default line count above which a file is reported as an anomaly
pub const DEFAULT_LONG_FILE_LINES: usize = 500;

/// Maps import specifiers to paths in a file set.
///
/// Only relative specifiers (`./`, `../`) are resolved unless alias prefixes
/// are configured, e.g. `@/` -> `src/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResolver {
    extensions: Vec<String>,
    aliases: Vec<(String, String)>,
}

impl Default for ImportResolver {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            aliases: Vec::new(),
        }
    }
}

impl ImportResolver {
    pub fn new(extensions: Vec<String>, aliases: BTreeMap<String, String>) -> Self {
        let extensions = if extensions.is_empty() {
            DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
        } else {
            extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect()
        };
        // Longest prefix first so `@/lib/` beats `@/`
        let mut aliases: Vec<(String, String)> = aliases.into_iter().collect();
        aliases.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { extensions, aliases }
    }

    /// Resolve `specifier` imported from `from_file` to a path for which
    /// `exists` returns true.
    pub fn resolve(
        &self,
        from_file: &str,
        specifier: &str,
        exists: impl Fn(&str) -> bool,
    ) -> Option<String> {
        let base = if specifier.starts_with("./") || specifier.starts_with("../") {
            let dir = parent_dir(from_file);
            normalize_path(&format!("{}/{}", dir, specifier))
        } else {
            let (prefix, target) = self
                .aliases
                .iter()
                .find(|(prefix, _)| specifier.starts_with(prefix.as_str()))?;
            normalize_path(&format!("{}/{}", target, &specifier[prefix.len()..]))
        };
        if base.is_empty() || base.starts_with("../") {
            return None;
        }

        self.candidates(&base).into_iter().find(|c| exists(c))
    }

    fn candidates(&self, base: &str) -> Vec<String> {
        let mut out = vec![base.to_string()];
        for ext in &self.extensions {
            out.push(format!("{}.{}", base, ext));
        }
        for ext in &self.extensions {
            out.push(format!("{}/index.{}", base, ext));
        }
        // ESM TypeScript imports `./x.js` for a `./x.ts` source
        if let Some(stem) = base.strip_suffix(".js").or_else(|| base.strip_suffix(".jsx")) {
            for ext in &self.extensions {
                out.push(format!("{}.{}", stem, ext));
            }
        }
        out
    }
}

/// A file whose size suggests it should be split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongFile {
    pub path: String,
    pub lines: usize,
    pub threshold: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    line_counts: BTreeMap<String, usize>,
}

impl DependencyGraph {
    pub fn build(files: &FileSet, resolver: &ImportResolver) -> Self {
        let known: HashSet<&str> = files.paths().collect();
        let mut graph = Self::default();

        for file in files.iter() {
            graph
                .line_counts
                .insert(file.path.clone(), file.content.lines().count());
            let targets: BTreeSet<String> = symbols::module_specifiers(&file.content)
                .iter()
                .filter_map(|spec| resolver.resolve(&file.path, spec, |p| known.contains(p)))
                .collect();
            graph.edges.insert(file.path.clone(), targets);
        }

        graph
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(|k| k.as_str())
    }

    pub fn dependencies_of(&self, path: &str) -> Vec<&str> {
        self.edges
            .get(path)
            .map(|targets| targets.iter().map(|t| t.as_str()).collect())
            .unwrap_or_default()
    }

    /// Files that import `path`
    pub fn dependents_of(&self, path: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(from, targets)| from.as_str() != path && targets.contains(path))
            .map(|(from, _)| from.as_str())
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|t| t.len()).sum()
    }

    /// Every import cycle, each as the path slice from the revisited node to
    /// the node that closed the loop.
    ///
    /// Iterative DFS with an explicit stack. A node can show up in several
    /// cycles; the same cycle found from different entry points is reported once.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        struct Frame<'a> {
            node: &'a str,
            next: usize,
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut seen: HashSet<Vec<&str>> = HashSet::new();
        let mut cycles = Vec::new();

        for start in self.nodes() {
            if visited.contains(start) {
                continue;
            }

            let mut stack = vec![Frame { node: start, next: 0 }];
            let mut path: Vec<&str> = vec![start];
            let mut on_path: HashMap<&str, usize> = HashMap::from([(start, 0)]);
            visited.insert(start);

            loop {
                let Some(frame) = stack.last_mut() else { break };
                let neighbors = self.edges.get(frame.node);
                let next = neighbors.and_then(|n| n.iter().nth(frame.next));
                frame.next += 1;

                match next {
                    Some(next) => {
                        let next = next.as_str();
                        if let Some(&pos) = on_path.get(next) {
                            let cycle = path[pos..].to_vec();
                            if seen.insert(canonical_rotation(&cycle)) {
                                cycles.push(cycle.iter().map(|s| s.to_string()).collect());
                            }
                        } else if visited.insert(next) {
                            on_path.insert(next, path.len());
                            path.push(next);
                            stack.push(Frame { node: next, next: 0 });
                        }
                    }
                    None => {
                        if let Some(done) = stack.pop() {
                            on_path.remove(done.node);
                            path.pop();
                        }
                    }
                }
            }
        }

        cycles
    }

    /// Files over `threshold` lines, longest first
    pub fn long_files(&self, threshold: usize) -> Vec<LongFile> {
        let mut out: Vec<LongFile> = self
            .line_counts
            .iter()
            .filter(|(_, &lines)| lines > threshold)
            .map(|(path, &lines)| LongFile {
                path: path.clone(),
                lines,
                threshold,
            })
            .collect();
        out.sort_by(|a, b| b.lines.cmp(&a.lines).then_with(|| a.path.cmp(&b.path)));
        out
    }
}

/// Rotate a cycle so its smallest node comes first
fn canonical_rotation<'a>(cycle: &[&'a str]) -> Vec<&'a str> {
    let Some(min_idx) = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, n)| **n)
        .map(|(i, _)| i)
    else {
        return Vec::new();
    };
    cycle[min_idx..]
        .iter()
        .chain(&cycle[..min_idx])
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(pairs: &[(&str, &str)]) -> DependencyGraph {
        DependencyGraph::build(&FileSet::from_pairs(pairs.iter().copied()), &ImportResolver::default())
    }

    #[test]
    fn test_three_file_cycle() {
        let g = graph(&[
            ("src/a.ts", "import { b } from './b';\n"),
            ("src/b.ts", "import { c } from './c';\n"),
            ("src/c.ts", "import { a } from './a';\n"),
        ]);
        let cycles = g.find_cycles();
        assert_eq!(cycles.len(), 1);
        let mut members = cycles[0].clone();
        members.sort();
        assert_eq!(members, vec!["src/a.ts", "src/b.ts", "src/c.ts"]);
    }

    #[test]
    fn test_node_on_two_cycles_and_disjoint_cycle() {
        let g = graph(&[
            ("a.ts", "import './b';\nimport './c';\n"),
            ("b.ts", "import './a';\n"),
            ("c.ts", "import './a';\n"),
            ("x.ts", "import './y';\n"),
            ("y.ts", "import './x';\n"),
            ("z.ts", "import './x';\n"),
        ]);
        let cycles = g.find_cycles();
        assert_eq!(cycles.len(), 3);
        assert!(cycles.contains(&vec!["a.ts".to_string(), "b.ts".to_string()]));
        assert!(cycles.contains(&vec!["a.ts".to_string(), "c.ts".to_string()]));
        assert!(cycles.contains(&vec!["x.ts".to_string(), "y.ts".to_string()]));
    }

    #[test]
    fn test_acyclic_graph_has_no_cycles() {
        let g = graph(&[
            ("a.ts", "import './b';\n"),
            ("b.ts", "import './c';\n"),
            ("c.ts", "export const c = 1;\n"),
        ]);
        assert!(g.find_cycles().is_empty());
        assert_eq!(g.dependents_of("c.ts"), vec!["b.ts"]);
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn test_resolution_rules() {
        let files = FileSet::from_pairs([
            ("src/app.ts", ""),
            ("src/lib/index.ts", ""),
            ("src/lib/math.ts", ""),
            ("src/ui/button.tsx", ""),
        ]);
        let exists = |p: &str| files.contains(p);
        let resolver = ImportResolver::default();

        assert_eq!(resolver.resolve("src/app.ts", "./lib", exists).as_deref(), Some("src/lib/index.ts"));
        assert_eq!(resolver.resolve("src/app.ts", "./lib/math.js", exists).as_deref(), Some("src/lib/math.ts"));
        assert_eq!(resolver.resolve("src/lib/math.ts", "../ui/button", exists).as_deref(), Some("src/ui/button.tsx"));
        assert_eq!(resolver.resolve("src/app.ts", "react", exists), None);
        assert_eq!(resolver.resolve("src/app.ts", "@/lib/math", exists), None);

        let aliased = ImportResolver::new(
            Vec::new(),
            BTreeMap::from([("@/".to_string(), "src/".to_string())]),
        );
        assert_eq!(aliased.resolve("src/app.ts", "@/lib/math", exists).as_deref(), Some("src/lib/math.ts"));
    }

    #[test]
    fn test_long_files() {
        let long: String = "x\n".repeat(12);
        let g = graph(&[("big.ts", long.as_str()), ("small.ts", "x\n")]);
        let found = g.long_files(10);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "big.ts");
        assert_eq!(found[0].lines, 12);
    }
}
