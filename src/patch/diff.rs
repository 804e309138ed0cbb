//! Unified diff rendering and parsing
//!
//! Converts between the [`Patch`] model and standard unified diff text.
//! Hunk ids are not representable in a diff and are regenerated on parse.

use super::{Hunk, Patch};

const DEV_NULL: &str = "/dev/null";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffParseError {
    #[error("diff too short")]
    TooShort,
    #[error("could not find file paths in diff")]
    MissingPaths,
    #[error("invalid hunk header: {0}")]
    InvalidHeader(String),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("no hunks found in diff for {0}")]
    NoHunks(String),
    #[error("expected a single-file diff, found {0} files")]
    MultipleFiles(usize),
}

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) | DiffLine::Add(s) | DiffLine::Remove(s) => s,
        }
    }
}

/// Render a patch as unified diff text.
pub fn to_unified_diff(patch: &Patch) -> String {
    let mut out = format!("--- a/{}\n+++ b/{}\n", patch.file_path, patch.file_path);
    let mut delta: isize = 0;

    for hunk in patch.sorted_hunks() {
        let before = hunk.context_before.len();
        let after = hunk.context_after.len();
        let old_len = before + hunk.old_lines.len() + after;
        let new_len = before + hunk.new_lines.len() + after;

        let first_line = hunk.start_line.saturating_sub(before);
        // Zero-length ranges name the line *after which* the change sits
        let old_start = if old_len == 0 {
            hunk.start_line.saturating_sub(1)
        } else {
            first_line
        };
        let shifted = (first_line as isize + delta).max(0) as usize;
        let new_start = if new_len == 0 {
            shifted.saturating_sub(1)
        } else {
            shifted
        };

        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_start, old_len, new_start, new_len
        ));
        for line in &hunk.context_before {
            out.push_str(&format!(" {}\n", line));
        }
        for line in &hunk.old_lines {
            out.push_str(&format!("-{}\n", line));
        }
        for line in &hunk.new_lines {
            out.push_str(&format!("+{}\n", line));
        }
        for line in &hunk.context_after {
            out.push_str(&format!(" {}\n", line));
        }

        delta += hunk.line_delta();
    }

    out
}

/// Parse a single-file unified diff into a patch.
pub fn from_unified_diff(diff: &str) -> Result<Patch, DiffParseError> {
    let mut patches = from_unified_diff_multi(diff)?;
    match patches.len() {
        1 => Ok(patches.remove(0)),
        n => Err(DiffParseError::MultipleFiles(n)),
    }
}

/// Parse a unified diff that may touch several files (one patch per file).
pub fn from_unified_diff_multi(diff: &str) -> Result<Vec<Patch>, DiffParseError> {
    let lines: Vec<&str> = diff.lines().collect();

    if lines.len() < 3 {
        return Err(DiffParseError::TooShort);
    }

    let mut patches = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let next_is_new_path = lines.get(i + 1).is_some_and(|l| l.starts_with("+++ "));
        if !(line.starts_with("--- ") && next_is_new_path) {
            i += 1;
            continue;
        }

        let old_path = header_path(&line[4..], "a/");
        let new_path = header_path(&lines[i + 1][4..], "b/");
        let path = if new_path == DEV_NULL { old_path } else { new_path };
        if path.is_empty() || path == DEV_NULL {
            return Err(DiffParseError::MissingPaths);
        }
        i += 2;

        let mut hunks = Vec::new();
        while i < lines.len() && !lines[i].starts_with("--- ") && !lines[i].starts_with("diff ") {
            if lines[i].starts_with("@@ ") {
                if let Some(hunk) = parse_hunk(&lines, &mut i)? {
                    hunks.push(hunk);
                }
            } else {
                i += 1;
            }
        }

        if hunks.is_empty() {
            return Err(DiffParseError::NoHunks(path));
        }
        patches.push(Patch::new(path, "Parsed from unified diff", hunks));
    }

    if patches.is_empty() {
        return Err(DiffParseError::MissingPaths);
    }
    Ok(patches)
}

fn header_path(raw: &str, prefix: &str) -> String {
    // Handle timestamp suffix
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == DEV_NULL {
        return DEV_NULL.to_string();
    }
    crate::util::normalize_path(raw.strip_prefix(prefix).unwrap_or(raw))
}

/// Parse one hunk; returns `None` for hunks without any change lines.
fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<Option<Hunk>, DiffParseError> {
    let header = lines[*idx];

    // Parse @@ -old_start,old_count +new_start,new_count @@
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" || !parts[1].starts_with('-') || !parts[2].starts_with('+') {
        return Err(DiffParseError::InvalidHeader(header.to_string()));
    }

    let (old_start, old_count) = parse_range(&parts[1][1..])?;
    let (_, new_count) = parse_range(&parts[2][1..])?;

    *idx += 1;
    let mut diff_lines = Vec::new();
    let mut old_seen = 0;
    let mut new_seen = 0;

    // Bounded by the header counts so removed lines that look like
    // `--- ` headers are still read as content.
    while *idx < lines.len() && (old_seen < old_count || new_seen < new_count) {
        let line = lines[*idx];
        if line.starts_with("@@ ") {
            break;
        }
        if let Some(rest) = line.strip_prefix('+') {
            diff_lines.push(DiffLine::Add(rest.to_string()));
            new_seen += 1;
        } else if let Some(rest) = line.strip_prefix('-') {
            diff_lines.push(DiffLine::Remove(rest.to_string()));
            old_seen += 1;
        } else if let Some(rest) = line.strip_prefix(' ') {
            diff_lines.push(DiffLine::Context(rest.to_string()));
            old_seen += 1;
            new_seen += 1;
        } else if line.is_empty() {
            diff_lines.push(DiffLine::Context(String::new()));
            old_seen += 1;
            new_seen += 1;
        } else if !line.starts_with('\\') {
            break;
        }
        // Skip other lines (like "\ No newline at end of file")
        *idx += 1;
    }
    while *idx < lines.len() && lines[*idx].starts_with('\\') {
        *idx += 1;
    }

    let is_change = |l: &DiffLine| !matches!(l, DiffLine::Context(_));
    let (Some(first), Some(last)) = (
        diff_lines.iter().position(is_change),
        diff_lines.iter().rposition(is_change),
    ) else {
        return Ok(None);
    };

    let collect = |slice: &[DiffLine]| -> Vec<String> {
        slice.iter().map(|l| l.content().to_string()).collect()
    };
    let before = collect(&diff_lines[..first]);
    let after = collect(&diff_lines[last + 1..]);
    let middle = &diff_lines[first..=last];

    let old_lines: Vec<String> = middle
        .iter()
        .filter(|l| !matches!(l, DiffLine::Add(_)))
        .map(|l| l.content().to_string())
        .collect();
    let new_lines: Vec<String> = middle
        .iter()
        .filter(|l| !matches!(l, DiffLine::Remove(_)))
        .map(|l| l.content().to_string())
        .collect();

    let start_line = if old_count == 0 {
        old_start + 1
    } else {
        old_start + before.len()
    };

    Ok(Some(
        Hunk::new(start_line, old_lines, new_lines).with_context(before, after),
    ))
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Result<(usize, usize), DiffParseError> {
    let invalid = || DiffParseError::InvalidRange(s.to_string());
    if let Some((start, count)) = s.split_once(',') {
        let start: usize = start.parse().map_err(|_| invalid())?;
        let count: usize = count.parse().map_err(|_| invalid())?;
        Ok((start, count))
    } else {
        let start: usize = s.parse().map_err(|_| invalid())?;
        Ok((start, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::apply;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_simple_diff() {
        let diff = r#"--- a/src/example.ts
+++ b/src/example.ts
@@ -1,5 +1,6 @@
 function hello() {
-  console.log("old");
+  console.log("new");
+  console.log("extra");
   return true;
 }

"#;
        let patch = from_unified_diff(diff).unwrap();
        assert_eq!(patch.file_path, "src/example.ts");
        assert_eq!(patch.hunks.len(), 1);
        assert_eq!(patch.stats(), (2, 1));

        let hunk = &patch.hunks[0];
        assert_eq!(hunk.start_line, 2);
        assert_eq!(hunk.end_line, 2);
        assert_eq!(hunk.context_before, lines(&["function hello() {"]));
        assert_eq!(hunk.context_after, lines(&["  return true;", "}", ""]));
    }

    #[test]
    fn test_apply_parsed_diff() {
        let original = "function hello() {\n  console.log(\"old\");\n  return true;\n}\n";
        let diff = r#"--- a/test.ts
+++ b/test.ts
@@ -1,4 +1,5 @@
 function hello() {
-  console.log("old");
+  console.log("new");
+  console.log("extra");
   return true;
 }
"#;
        let patch = from_unified_diff(diff).unwrap();
        let result = apply(&patch, original);

        assert!(result.success);
        assert!(result.new_content.contains("console.log(\"new\")"));
        assert!(result.new_content.contains("console.log(\"extra\")"));
        assert!(!result.new_content.contains("console.log(\"old\")"));
    }

    #[test]
    fn test_round_trip_matches_direct_apply() {
        let original: String = (1..=20).map(|i| format!("row {}\n", i)).collect();
        let patch = Patch::new(
            "data/rows.txt",
            "mixed edits",
            vec![
                Hunk::new(1, Vec::new(), lines(&["header"])),
                Hunk::new(4, lines(&["row 4", "row 5"]), lines(&["four-five"]))
                    .with_context(lines(&["row 2", "row 3"]), lines(&["row 6"])),
                Hunk::new(10, lines(&["row 10"]), Vec::new()),
                Hunk::new(15, lines(&["row 15"]), lines(&["fifteen", "fifteen again"]))
                    .with_context(lines(&["row 14"]), lines(&["row 16", "row 17"])),
            ],
        );

        let text = to_unified_diff(&patch);
        let parsed = from_unified_diff(&text).unwrap();
        assert_eq!(parsed.file_path, patch.file_path);
        assert_eq!(parsed.hunks.len(), patch.hunks.len());
        for (a, b) in parsed.hunks.iter().zip(&patch.hunks) {
            assert_eq!(a.start_line, b.start_line);
            assert_eq!(a.old_lines, b.old_lines);
            assert_eq!(a.new_lines, b.new_lines);
        }

        let direct = apply(&patch, &original);
        let via_diff = apply(&parsed, &original);
        assert!(direct.success);
        assert_eq!(direct.new_content, via_diff.new_content);
    }

    #[test]
    fn test_render_headers() {
        let patch = Patch::new(
            "foo.ts",
            "x",
            vec![Hunk::new(5, lines(&["x", "y"]), lines(&["z"]))],
        );
        let text = to_unified_diff(&patch);
        assert!(text.starts_with("--- a/foo.ts\n+++ b/foo.ts\n@@ -5,2 +5,1 @@\n"));

        let insert = Patch::new("n.ts", "x", vec![Hunk::new(1, Vec::new(), lines(&["a"]))]);
        assert!(to_unified_diff(&insert).contains("@@ -0,0 +1,1 @@"));
    }

    #[test]
    fn test_removed_line_that_looks_like_header() {
        let diff = "--- a/q.sql\n+++ b/q.sql\n@@ -1,2 +1,1 @@\n--- comment\n select 1;\n";
        let patch = from_unified_diff(diff).unwrap();
        assert_eq!(patch.hunks[0].old_lines, lines(&["-- comment"]));
        assert_eq!(patch.hunks[0].context_after, lines(&["select 1;"]));
    }

    #[test]
    fn test_multi_file_diff() {
        let diff = "\
diff --git a/a.ts b/a.ts
--- a/a.ts
+++ b/a.ts
@@ -1,1 +1,1 @@
-export const foo = 1;
+export const bar = 1;
diff --git a/b.ts b/b.ts
--- /dev/null
+++ b/b.ts
@@ -0,0 +1,1 @@
+export const baz = 2;
";
        let patches = from_unified_diff_multi(diff).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].file_path, "a.ts");
        assert_eq!(patches[1].file_path, "b.ts");
        assert!(patches[1].hunks[0].is_insertion());
        assert!(matches!(
            from_unified_diff(diff),
            Err(DiffParseError::MultipleFiles(2))
        ));
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(from_unified_diff("x"), Err(DiffParseError::TooShort));
        assert!(matches!(
            from_unified_diff("--- a/x\n+++ b/x\n@@ -a,1 +1,1 @@\n-x\n+y\n"),
            Err(DiffParseError::InvalidRange(_))
        ));
        assert!(matches!(
            from_unified_diff("--- a/x\n+++ b/x\nnothing here\n"),
            Err(DiffParseError::NoHunks(_))
        ));
    }
}
