//! Local heuristic passes
//!
//! Whole-file checks run on both the original and the patched content; a
//! finding that already existed before the patch is reported at info severity.
//! Checks over added lines only ever see what the patch introduced.

use super::scan::{self, AddedLine};
use super::{IssueKind, Pass, ReflectionIssue, Severity};
use crate::symbols;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Modules with more non-blank lines than this are expected to export something
const EXPORTLESS_MODULE_LINES: usize = 20;

static EMPTY_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^=!<>+\-*/%&|^])=\s*;").expect("valid empty assignment regex")
});
static TRAILING_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^=!<>+\-*/%&|^])=\s*$").expect("valid trailing assignment regex")
});
static STATEMENT_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:const|let|var|function|class|interface|return|export|import|if|else|for|while|do|switch|throw|try)\b|\})",
    )
    .expect("valid statement start regex")
});
static EMPTY_CONDITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|while|switch)\s*\(\s*\)").expect("valid empty condition regex")
});
static DANGLING_OPERATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:&&|\|\||\?\?|[^+\-]\+|[^+\-]-|[*/%&|^=<>?,.]|=>)\s*$")
        .expect("valid dangling operator regex")
});
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?://|/\*|\*|#|<!--)\s*)?(?:\.{3}|…)\s*(?:\(?\s*(?:existing|rest of|remaining|unchanged|same as before|previous|other|more)\b.*)?$|(?i)(?://|/\*|#)\s*(?:\.{3}\s*)?(?:rest of (?:the )?(?:code|file|implementation|function)|existing code|remaining code|unchanged code)",
    )
    .expect("valid placeholder regex")
});

/// Identifiers that are always in scope
const BUILTINS: &[&str] = &[
    "Array", "ArrayBuffer", "BigInt", "Boolean", "DataView", "Date", "Error", "EvalError",
    "Float32Array", "Float64Array", "Function", "Infinity", "Int8Array", "Int16Array",
    "Int32Array", "Intl", "JSON", "Map", "Math", "NaN", "Number", "Object", "Promise", "Proxy",
    "RangeError", "ReferenceError", "Reflect", "RegExp", "Set", "String", "Symbol", "SyntaxError",
    "TypeError", "URIError", "URL", "URLSearchParams", "Uint8Array", "Uint8ClampedArray",
    "Uint16Array", "Uint32Array", "WeakMap", "WeakSet", "WeakRef", "AbortController", "Blob",
    "Buffer", "Event", "EventTarget", "FormData", "Headers", "Request", "Response", "TextDecoder",
    "TextEncoder", "Worker", "HTMLElement", "HTMLInputElement", "Element", "Node", "Document",
    "Window", "NodeJS", "Partial", "Required", "Readonly", "Record", "Pick", "Omit", "Exclude",
    "Extract", "NonNullable", "ReturnType", "Parameters", "InstanceType", "Awaited", "Iterable",
    "Iterator", "AsyncIterable", "PromiseLike", "ArrayLike", "Generator", "AsyncGenerator",
];

/// Precomputed views of one file before and after a patch
pub struct PassInput {
    pub file_path: String,
    pub original: FileView,
    pub patched: FileView,
    pub added: Vec<AddedLine>,
}

pub struct FileView {
    pub content: String,
    pub raw: Vec<String>,
    pub masked: Vec<String>,
}

impl FileView {
    fn new(content: &str) -> Self {
        Self {
            content: content.to_string(),
            raw: content.lines().map(str::to_string).collect(),
            masked: scan::mask_code(content),
        }
    }
}

impl PassInput {
    pub fn new(file_path: &str, original: &str, patched: &str) -> Self {
        Self {
            file_path: file_path.to_string(),
            original: FileView::new(original),
            patched: FileView::new(patched),
            added: scan::added_lines(original, patched),
        }
    }

    fn is_script(&self) -> bool {
        symbols::is_script_module(&self.file_path)
    }

    fn masked_added(&self, added: &AddedLine) -> &str {
        self.patched
            .masked
            .get(added.line - 1)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// A finding before severity is decided
#[derive(Debug, Clone)]
struct Finding {
    line: usize,
    message: String,
}

/// Run one local pass. Collaborator and cross-file passes yield nothing here.
pub fn run(pass: Pass, input: &PassInput) -> Vec<ReflectionIssue> {
    match pass {
        Pass::Syntax => syntax(input),
        Pass::Imports if input.is_script() => imports(input),
        Pass::Exports if input.is_script() => exports(input),
        Pass::UnusedSymbols if input.is_script() => unused_symbols(input),
        Pass::Style => style(input),
        _ => Vec::new(),
    }
}

/// Pair patched findings with identical original ones (by message)
fn split_preexisting(original: Vec<Finding>, patched: Vec<Finding>) -> (Vec<Finding>, Vec<Finding>) {
    let mut remaining: HashMap<String, usize> = HashMap::new();
    for f in original {
        *remaining.entry(f.message).or_default() += 1;
    }
    let mut introduced = Vec::new();
    let mut preexisting = Vec::new();
    for f in patched {
        match remaining.get_mut(&f.message) {
            Some(n) if *n > 0 => {
                *n -= 1;
                preexisting.push(f);
            }
            _ => introduced.push(f),
        }
    }
    (introduced, preexisting)
}

fn to_issues(
    input: &PassInput,
    kind: IssueKind,
    severity: Severity,
    findings: Vec<Finding>,
) -> impl Iterator<Item = ReflectionIssue> + '_ {
    findings.into_iter().map(move |f| {
        ReflectionIssue::new(kind, severity, f.message).at(input.file_path.clone(), Some(f.line))
    })
}

pub fn syntax(input: &PassInput) -> Vec<ReflectionIssue> {
    let original = delimiter_findings(&input.original.masked);
    let original_unbalanced = !original.is_empty();
    let patched = delimiter_findings(&input.patched.masked);
    let (introduced, preexisting) = split_preexisting(original, patched);

    let severity = if original_unbalanced {
        Severity::Warning
    } else {
        Severity::Error
    };
    let mut issues: Vec<ReflectionIssue> = to_issues(input, IssueKind::Syntax, severity, introduced)
        .chain(to_issues(input, IssueKind::Syntax, Severity::Info, preexisting))
        .collect();

    for added in &input.added {
        let code = input.masked_added(added);
        let mut push = |message: &str, fix: &str| {
            issues.push(
                ReflectionIssue::new(IssueKind::Syntax, Severity::Error, message)
                    .at(input.file_path.clone(), Some(added.line))
                    .with_fix(fix),
            );
        };
        if PLACEHOLDER.is_match(&added.text) {
            push(
                "Placeholder left in place of real code",
                "write out the full code instead of eliding it",
            );
        }
        let value_missing = EMPTY_ASSIGNMENT.is_match(code)
            || (TRAILING_ASSIGNMENT.is_match(code) && !value_continues(input, added.line));
        if value_missing {
            push("Assignment has no value", "complete the right-hand side");
        }
        if EMPTY_CONDITION.is_match(code) {
            push("Condition is empty", "add the missing condition");
        }
    }

    // Only the final statement can be checked for a dangling operator without parsing
    let last_code = input
        .patched
        .masked
        .iter()
        .enumerate()
        .rev()
        .find(|(_, l)| !l.trim().is_empty());
    if let Some((idx, code)) = last_code {
        let line = idx + 1;
        if input.added.iter().any(|a| a.line == line) && DANGLING_OPERATOR.is_match(code) {
            issues.push(
                ReflectionIssue::new(
                    IssueKind::Syntax,
                    Severity::Error,
                    "File ends with an incomplete expression",
                )
                .at(input.file_path.clone(), Some(line)),
            );
        }
    }

    issues
}

/// Whether the code after a line ending in `=` reads as the assigned value
/// rather than a new statement.
fn value_continues(input: &PassInput, line: usize) -> bool {
    input
        .patched
        .masked
        .iter()
        .skip(line)
        .find(|l| !l.trim().is_empty())
        .is_some_and(|next| !STATEMENT_START.is_match(next))
}

/// Unbalanced `{}`, `()` and `[]` in masked code
fn delimiter_findings(masked: &[String]) -> Vec<Finding> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut findings = Vec::new();

    for (idx, line) in masked.iter().enumerate() {
        for c in line.chars() {
            match c {
                '{' | '(' | '[' => stack.push((c, idx + 1)),
                '}' | ')' | ']' => {
                    let expected = match c {
                        '}' => '{',
                        ')' => '(',
                        _ => '[',
                    };
                    match stack.last() {
                        Some(&(open, _)) if open == expected => {
                            stack.pop();
                        }
                        Some(&(open, _)) => {
                            findings.push(Finding {
                                line: idx + 1,
                                message: format!("Mismatched '{}' closes '{}'", c, open),
                            });
                            stack.pop();
                        }
                        None => findings.push(Finding {
                            line: idx + 1,
                            message: format!("Unmatched closing '{}'", c),
                        }),
                    }
                }
                _ => {}
            }
        }
    }

    findings.extend(stack.into_iter().map(|(open, line)| Finding {
        line,
        message: format!("Unclosed '{}'", open),
    }));
    findings
}

pub fn imports(input: &PassInput) -> Vec<ReflectionIssue> {
    let original = unused_import_findings(&input.original);
    let patched = unused_import_findings(&input.patched);
    let (introduced, preexisting) = split_preexisting(original, patched);
    let mut issues: Vec<ReflectionIssue> = to_issues(input, IssueKind::Import, Severity::Warning, introduced)
        .chain(to_issues(input, IssueKind::Import, Severity::Info, preexisting))
        .collect();

    let mut known = scan::declared_names(&input.patched.masked);
    for decl in symbols::extract_imports(&input.patched.content) {
        known.extend(decl.local_names().into_iter().map(str::to_string));
    }
    let builtins: HashSet<&str> = BUILTINS.iter().copied().collect();
    let mut reported: HashSet<String> = HashSet::new();

    for added in &input.added {
        let code = input.masked_added(added);
        for (offset, name) in scan::identifiers(code) {
            if !is_candidate_type_name(name)
                || known.contains(name)
                || builtins.contains(name)
                || reported.contains(name)
            {
                continue;
            }
            let before = code[..offset].trim_end();
            let after = code[offset + name.len()..].trim_start();
            // Member access and object keys are not references
            if before.ends_with('.') || (after.starts_with(':') && !before.ends_with('?')) {
                continue;
            }
            reported.insert(name.to_string());
            issues.push(
                ReflectionIssue::new(
                    IssueKind::Import,
                    Severity::Warning,
                    format!("'{}' is used but never declared or imported", name),
                )
                .at(input.file_path.clone(), Some(added.line))
                .with_fix(format!("import or declare '{}'", name)),
            );
        }
    }

    issues
}

fn is_candidate_type_name(name: &str) -> bool {
    name.len() > 1
        && name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        // SCREAMING_CASE constants are usually globals or env-provided
        && name.chars().any(|c| c.is_ascii_lowercase())
}

fn unused_import_findings(view: &FileView) -> Vec<Finding> {
    let mut findings = Vec::new();
    for decl in symbols::extract_imports(&view.content) {
        let import_lines = decl.line..=decl.end_line;
        for name in decl.local_names() {
            let used = view
                .masked
                .iter()
                .enumerate()
                .filter(|(idx, _)| !import_lines.contains(&(idx + 1)))
                .any(|(_, line)| scan::identifiers(line).any(|(_, id)| id == name));
            if !used {
                findings.push(Finding {
                    line: decl.line,
                    message: format!("Unused import '{}' from '{}'", name, decl.source),
                });
            }
        }
    }
    findings
}

pub fn exports(input: &PassInput) -> Vec<ReflectionIssue> {
    let non_blank = input.patched.raw.iter().filter(|l| !l.trim().is_empty()).count();
    if non_blank <= EXPORTLESS_MODULE_LINES {
        return Vec::new();
    }
    if !symbols::extract_exports(&input.patched.content).is_empty() {
        return Vec::new();
    }

    let had_exports = !symbols::extract_exports(&input.original.content).is_empty();
    let issue = if had_exports {
        ReflectionIssue::new(
            IssueKind::Export,
            Severity::Warning,
            "Patch removed every export from this module",
        )
        .with_fix("restore the exports other modules rely on")
    } else {
        ReflectionIssue::new(IssueKind::Export, Severity::Info, "Module has no exports")
    };
    vec![issue.at(input.file_path.clone(), None)]
}

pub fn unused_symbols(input: &PassInput) -> Vec<ReflectionIssue> {
    let original = unused_symbol_findings(&input.original);
    let patched = unused_symbol_findings(&input.patched);
    let (introduced, preexisting) = split_preexisting(original, patched);
    to_issues(input, IssueKind::Unused, Severity::Warning, introduced)
        .chain(to_issues(input, IssueKind::Unused, Severity::Info, preexisting))
        .collect()
}

fn unused_symbol_findings(view: &FileView) -> Vec<Finding> {
    scan::declarations(&view.masked)
        .into_iter()
        .filter(|(_, name, exported)| !exported && !name.starts_with('_'))
        .filter(|(_, name, _)| scan::count_identifier(&view.masked, name) == 1)
        .map(|(line, name, _)| Finding {
            line,
            message: format!("'{}' is declared but never used", name),
        })
        .collect()
}

pub fn style(input: &PassInput) -> Vec<ReflectionIssue> {
    let mut issues = Vec::new();
    if input.added.is_empty() {
        return issues;
    }

    // Indentation character
    let (tabs, spaces) = input
        .original
        .raw
        .iter()
        .map(|l| scan::leading_whitespace(l))
        .fold((0usize, 0usize), |(t, s), ws| match ws.chars().next() {
            Some('\t') => (t + 1, s),
            Some(' ') => (t, s + 1),
            _ => (t, s),
        });
    if tabs + spaces > 0 {
        let (other, other_name, expected_name) = if tabs > spaces {
            (' ', "spaces", "tabs")
        } else {
            ('\t', "tabs", "spaces")
        };
        let drifting: Vec<&AddedLine> = input
            .added
            .iter()
            .filter(|a| scan::leading_whitespace(&a.text).starts_with(other))
            .collect();
        if let Some(first) = drifting.first() {
            issues.push(
                ReflectionIssue::new(
                    IssueKind::Style,
                    Severity::Warning,
                    format!(
                        "{} added line(s) indent with {}; the file uses {}",
                        drifting.len(),
                        other_name,
                        expected_name
                    ),
                )
                .at(input.file_path.clone(), Some(first.line)),
            );
        }
    }

    // Quote style
    let (single, double) = input
        .original
        .masked
        .iter()
        .fold((0usize, 0usize), |(s, d), l| {
            (s + l.matches('\'').count() / 2, d + l.matches('"').count() / 2)
        });
    let dominant = if single >= 2 && single >= double * 2 {
        Some(('\'', '"', "single"))
    } else if double >= 2 && double >= single * 2 {
        Some(('"', '\'', "double"))
    } else {
        None
    };
    if let Some((_, other, name)) = dominant {
        if let Some(first) = input
            .added
            .iter()
            .find(|a| input.masked_added(a).matches(other).count() >= 2)
        {
            issues.push(
                ReflectionIssue::new(
                    IssueKind::Style,
                    Severity::Info,
                    format!("Added code changes quote style; the file uses {} quotes", name),
                )
                .at(input.file_path.clone(), Some(first.line)),
            );
        }
    }

    // Semicolons
    let statements: Vec<bool> = input
        .original
        .masked
        .iter()
        .filter_map(|l| statement_terminator(l))
        .collect();
    if statements.len() >= 3 {
        let with_semi = statements.iter().filter(|s| **s).count();
        let ratio = with_semi as f64 / statements.len() as f64;
        let expects = if ratio >= 0.8 {
            Some(true)
        } else if ratio <= 0.2 {
            Some(false)
        } else {
            None
        };
        if let Some(expects) = expects {
            let first = input.added.iter().find(|a| {
                statement_terminator(input.masked_added(a)).is_some_and(|has| has != expects)
            });
            if let Some(first) = first {
                let message = if expects {
                    "Added statement omits the semicolon the file uses"
                } else {
                    "Added statement ends with a semicolon; the file omits them"
                };
                issues.push(
                    ReflectionIssue::new(IssueKind::Style, Severity::Info, message)
                        .at(input.file_path.clone(), Some(first.line)),
                );
            }
        }
    }

    issues
}

/// Whether a line that looks like a complete statement ends with `;`.
/// `None` for blank lines, block delimiters and continuation lines.
fn statement_terminator(line: &str) -> Option<bool> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let last = trimmed.chars().next_back()?;
    if matches!(last, '{' | '}' | '(' | '[' | ',' | ':' | '>' | '+' | '-' | '&' | '|' | '=' | '.' | '?' | '`') {
        return None;
    }
    let first = trimmed.chars().next()?;
    if matches!(first, '.' | '}' | ')' | ']' | '@' | '*') {
        return None;
    }
    Some(last == ';')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn severities(issues: &[ReflectionIssue]) -> Vec<(Severity, &str)> {
        issues.iter().map(|i| (i.severity, i.message.as_str())).collect()
    }

    #[test]
    fn test_unclosed_brace_is_error() {
        let input = PassInput::new(
            "a.ts",
            "function f() {\n  return 1;\n}\n",
            "function f() {\n  if (x) {\n  return 1;\n}\n",
        );
        let issues = syntax(&input);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Error);
        assert_eq!(issues[0].message, "Unclosed '{'");
        assert_eq!(issues[0].line(), Some(1));
    }

    #[test]
    fn test_preexisting_imbalance_is_info() {
        let broken = "function f() {\n  return [1;\n}\n";
        let input = PassInput::new("a.ts", broken, &format!("{}const y = 2;\n", broken));
        let issues = syntax(&input);
        assert!(!issues.is_empty());
        assert!(issues.iter().all(|i| i.severity == Severity::Info));
    }

    #[test]
    fn test_delimiters_in_strings_and_comments_are_ignored() {
        let input = PassInput::new(
            "a.ts",
            "const a = 1;\n",
            "const a = 1;\nconst s = \"{(\"; // )]\n/* { */\n",
        );
        assert!(syntax(&input).is_empty());
    }

    #[test]
    fn test_incomplete_statements_and_placeholders() {
        let input = PassInput::new(
            "a.ts",
            "let a = 1;\n",
            "let a = 1;\nlet b = ;\nif () {}\n// ... existing code ...\nconst c = a +\n",
        );
        let messages: Vec<String> = syntax(&input).into_iter().map(|i| i.message).collect();
        assert!(messages.contains(&"Assignment has no value".to_string()));
        assert!(messages.contains(&"Condition is empty".to_string()));
        assert!(messages.contains(&"Placeholder left in place of real code".to_string()));
        assert!(messages.contains(&"File ends with an incomplete expression".to_string()));
    }

    #[test]
    fn test_arrow_and_comparison_are_not_empty_assignments() {
        let input = PassInput::new(
            "a.ts",
            "",
            "const f = () =>\n  1;\nif (a == b) {}\nx += 1;\n",
        );
        let messages: Vec<String> = syntax(&input).into_iter().map(|i| i.message).collect();
        assert!(!messages.contains(&"Assignment has no value".to_string()));
    }

    #[test]
    fn test_value_on_next_line_is_not_empty_assignment() {
        let input = PassInput::new(
            "a.ts",
            "function sum(a: number, b: number) {\n  return a + b;\n}\n",
            "function sum(a: number, b: number) {\n  const total =\n    a + b;\n  return total;\n}\ntype Shape =\n  | Circle\n  | Square;\n",
        );
        let messages: Vec<String> = syntax(&input).into_iter().map(|i| i.message).collect();
        assert!(!messages.contains(&"Assignment has no value".to_string()), "{:?}", messages);
    }

    #[test]
    fn test_trailing_assignment_before_new_statement() {
        let input = PassInput::new(
            "a.ts",
            "let a = 1;\n",
            "let a = 1;\nlet b =\nreturn b;\n",
        );
        let flagged: Vec<usize> = syntax(&input)
            .into_iter()
            .filter(|i| i.message == "Assignment has no value")
            .filter_map(|i| i.line())
            .collect();
        assert_eq!(flagged, vec![2]);
    }

    #[test]
    fn test_unused_and_undeclared_imports() {
        let original = "import { used } from './u';\n\nused();\n";
        let patched = "import { used } from './u';\nimport { Extra } from './e';\n\nused();\nconst w = new Widget();\nconst d = new Date();\n";
        let input = PassInput::new("a.ts", original, patched);
        let issues = imports(&input);
        assert_eq!(
            severities(&issues),
            vec![
                (Severity::Warning, "Unused import 'Extra' from './e'"),
                (Severity::Warning, "'Widget' is used but never declared or imported"),
            ]
        );
    }

    #[test]
    fn test_object_keys_and_members_are_not_undeclared() {
        let input = PassInput::new("a.ts", "", "const o = { Key: 1 };\nconst v = o.Value;\n");
        assert!(imports(&input).is_empty());
    }

    #[test]
    fn test_exports_removed() {
        let body: String = (0..21).map(|i| format!("const v{} = {};\n", i, i)).collect();
        let original = format!("export const keep = 1;\n{}", body);
        let input = PassInput::new("a.ts", &original, &body);
        let issues = exports(&input);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);

        let input = PassInput::new("a.ts", &body, &format!("{}const more = 1;\n", body));
        assert_eq!(exports(&input)[0].severity, Severity::Info);
    }

    #[test]
    fn test_unused_symbols() {
        let original = "const used = 1;\nexport const out = used;\n";
        let patched = "const used = 1;\nconst orphan = 2;\nexport const out = used;\n";
        let issues = unused_symbols(&PassInput::new("a.ts", original, patched));
        assert_eq!(
            severities(&issues),
            vec![(Severity::Warning, "'orphan' is declared but never used")]
        );
    }

    #[test]
    fn test_style_drift() {
        let original = "function f() {\n  const a = 'x';\n  const b = 'y';\n  return a + b;\n}\n";
        let patched = "function f() {\n  const a = 'x';\n  const b = 'y';\n\tconst c = \"z\"\n  return a + b;\n}\n";
        let issues = style(&PassInput::new("a.ts", original, patched));
        let kinds: Vec<(Severity, usize)> = issues
            .iter()
            .map(|i| (i.severity, i.line().unwrap_or(0)))
            .collect();
        assert_eq!(
            kinds,
            vec![(Severity::Warning, 4), (Severity::Info, 4), (Severity::Info, 4)]
        );
    }

    #[test]
    fn test_non_script_files_skip_module_passes() {
        let input = PassInput::new("README.md", "", "import { X } from './x';\n");
        assert!(run(Pass::Imports, &input).is_empty());
        assert!(run(Pass::UnusedSymbols, &input).is_empty());
    }
}
