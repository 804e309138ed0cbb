//! Line-level lexical helpers shared by the reflection passes

use regex::Regex;
use similar::{ChangeTag, TextDiff};
use std::collections::HashSet;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_$][\w$]*").expect("valid identifier regex"));
static DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:const|let|var|function\*?|class|interface|type|enum|namespace)\s+([A-Za-z_$][\w$]*)",
    )
    .expect("valid declaration regex")
});
static DESTRUCTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:const|let|var)\s*[{\[]([^}\]]*)[}\]]").expect("valid destructuring regex")
});

/// A line present in the patched content but not in the original
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedLine {
    /// 1-based line in the patched content
    pub line: usize,
    pub text: String,
}

pub fn added_lines(original: &str, patched: &str) -> Vec<AddedLine> {
    let diff = TextDiff::from_lines(original, patched);
    diff.iter_all_changes()
        .filter(|change| change.tag() == ChangeTag::Insert)
        .filter_map(|change| {
            change.new_index().map(|idx| AddedLine {
                line: idx + 1,
                text: change.value().trim_end_matches(['\r', '\n']).to_string(),
            })
        })
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    BlockComment,
    Quoted(char),
}

/// Per-line code with comments removed and string literal bodies blanked.
///
/// Quote characters are kept so quote style stays measurable. Template
/// literals and block comments may span lines; plain strings end at the line.
pub fn mask_code(content: &str) -> Vec<String> {
    let mut state = Lex::Code;
    let mut out = Vec::new();

    for line in content.lines() {
        let mut masked = String::with_capacity(line.len());
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match state {
                Lex::Code => match c {
                    '/' if chars.peek() == Some(&'/') => break,
                    '/' if chars.peek() == Some(&'*') => {
                        chars.next();
                        masked.push(' ');
                        state = Lex::BlockComment;
                    }
                    '"' | '\'' | '`' => {
                        masked.push(c);
                        state = Lex::Quoted(c);
                    }
                    _ => masked.push(c),
                },
                Lex::BlockComment => {
                    if c == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        state = Lex::Code;
                    }
                }
                Lex::Quoted(quote) => {
                    if c == '\\' {
                        chars.next();
                    } else if c == quote {
                        masked.push(c);
                        state = Lex::Code;
                    }
                }
            }
        }
        if matches!(state, Lex::Quoted(q) if q != '`') {
            state = Lex::Code;
        }
        out.push(masked);
    }

    out
}

/// Identifiers in a masked line with their byte offsets
pub fn identifiers(line: &str) -> impl Iterator<Item = (usize, &str)> {
    IDENTIFIER.find_iter(line).filter_map(move |m| {
        let preceded_by_digit = line[..m.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_digit());
        (!preceded_by_digit).then_some((m.start(), m.as_str()))
    })
}

/// Whole-word occurrences of `name` across masked lines
pub fn count_identifier(masked: &[String], name: &str) -> usize {
    masked
        .iter()
        .map(|line| identifiers(line).filter(|(_, id)| *id == name).count())
        .sum()
}

/// Names introduced by declarations, including simple destructuring
pub fn declared_names(masked: &[String]) -> HashSet<String> {
    let mut names = HashSet::new();
    for line in masked {
        for cap in DECLARATION.captures_iter(line) {
            names.insert(cap[1].to_string());
        }
        for cap in DESTRUCTURE.captures_iter(line) {
            for part in cap[1].split(',') {
                let binding = part
                    .split_once(':')
                    .map(|(_, alias)| alias)
                    .unwrap_or(part);
                let binding = binding.split('=').next().unwrap_or("").trim();
                let binding = binding.trim_start_matches("...");
                if !binding.is_empty() {
                    names.insert(binding.to_string());
                }
            }
        }
    }
    names
}

/// Declarations per line: `(1-based line, name, exported)`
pub fn declarations(masked: &[String]) -> Vec<(usize, String, bool)> {
    let mut out = Vec::new();
    for (idx, line) in masked.iter().enumerate() {
        let exported = line.trim_start().starts_with("export ");
        for cap in DECLARATION.captures_iter(line) {
            out.push((idx + 1, cap[1].to_string(), exported));
        }
    }
    out
}

pub fn leading_whitespace(line: &str) -> &str {
    let end = line.len() - line.trim_start().len();
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_strips_comments_and_string_bodies() {
        let masked = mask_code("const a = \"{(\"; // }\n/* {\n ] */ call('x');\nconst t = `a\n}`;\n");
        assert_eq!(masked[0], "const a = \"\"; ");
        assert_eq!(masked[1], " ");
        assert_eq!(masked[2], " call('');");
        assert_eq!(masked[3], "const t = `");
        assert_eq!(masked[4], "`;");
    }

    #[test]
    fn test_added_lines_are_one_based() {
        let added = added_lines("a\nb\nc\n", "a\nx\nb\nc\ny\n");
        let lines: Vec<(usize, &str)> = added.iter().map(|a| (a.line, a.text.as_str())).collect();
        assert_eq!(lines, vec![(2, "x"), (5, "y")]);
    }

    #[test]
    fn test_declared_names() {
        let masked = mask_code("const { A, b: C, ...rest } = x;\nclass Widget {}\nfunction* gen() {}\n");
        let names = declared_names(&masked);
        for name in ["A", "C", "rest", "Widget", "gen"] {
            assert!(names.contains(name), "missing {}", name);
        }
        assert!(!names.contains("b"));
    }

    #[test]
    fn test_count_identifier_is_whole_word() {
        let masked = mask_code("const foo = 1;\nconst foobar = foo + 2;\nlet x = 'foo';\n");
        assert_eq!(count_identifier(&masked, "foo"), 2);
    }
}
