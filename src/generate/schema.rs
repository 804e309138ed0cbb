//! Strict parsing of generator responses
//!
//! Models wrap JSON in fences or prose; both are tolerated. The JSON itself is
//! not: unknown fields, missing required fields and impossible line numbers
//! are all rejected as [`GenerationError::InvalidResponse`].

use super::GenerationError;
use crate::patch::{self, Hunk, Patch};
use crate::reflection::{IssueKind, ReflectionIssue, Severity};
use crate::util::truncate;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchJson {
    #[serde(default)]
    description: String,
    #[serde(default)]
    hunks: Option<Vec<HunkJson>>,
    #[serde(default)]
    diff: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HunkJson {
    start_line: usize,
    #[serde(default)]
    old_lines: Vec<String>,
    #[serde(default)]
    new_lines: Vec<String>,
    #[serde(default)]
    context_before: Vec<String>,
    #[serde(default)]
    context_after: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FindingsJson {
    issues: Vec<FindingJson>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FindingJson {
    #[serde(default)]
    kind: Option<IssueKind>,
    severity: Severity,
    #[serde(default)]
    line: Option<usize>,
    message: String,
    #[serde(default)]
    suggested_fix: Option<String>,
}

/// Strip markdown code fences from a response
pub(crate) fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
pub(crate) fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

fn json_body(response: &str) -> Result<&str, GenerationError> {
    let clean = strip_markdown_fences(response);
    extract_json_fragment(clean, '{', '}').ok_or_else(|| {
        GenerationError::InvalidResponse(format!(
            "no JSON object in response: {}",
            truncate(clean, 200)
        ))
    })
}

/// Parse a patch proposal for `file_path`.
///
/// The response carries either structured `hunks` or a unified `diff`, never
/// both. A diff naming another file is rejected.
pub fn parse_patch_response(response: &str, file_path: &str) -> Result<Patch, GenerationError> {
    let body = json_body(response)?;
    let parsed: PatchJson = serde_json::from_str(body)
        .map_err(|e| GenerationError::InvalidResponse(format!("patch schema: {}", e)))?;

    match (parsed.hunks, parsed.diff) {
        (Some(_), Some(_)) => Err(GenerationError::InvalidResponse(
            "response has both 'hunks' and 'diff'".into(),
        )),
        (None, None) => Err(GenerationError::InvalidResponse(
            "response has neither 'hunks' nor 'diff'".into(),
        )),
        (Some(hunks), None) => {
            if hunks.is_empty() {
                return Err(GenerationError::InvalidResponse("'hunks' is empty".into()));
            }
            let hunks = hunks
                .into_iter()
                .enumerate()
                .map(|(idx, h)| {
                    if h.start_line == 0 {
                        return Err(GenerationError::InvalidResponse(format!(
                            "hunk {} has start_line 0 (lines are 1-based)",
                            idx + 1
                        )));
                    }
                    if h.old_lines.is_empty() && h.new_lines.is_empty() {
                        return Err(GenerationError::InvalidResponse(format!(
                            "hunk {} changes nothing",
                            idx + 1
                        )));
                    }
                    Ok(Hunk::new(h.start_line, h.old_lines, h.new_lines)
                        .with_context(h.context_before, h.context_after))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Patch::new(file_path, parsed.description, hunks))
        }
        (None, Some(diff)) => {
            let mut parsed_patch = patch::from_unified_diff(&diff)
                .map_err(|e| GenerationError::InvalidResponse(format!("diff: {}", e)))?;
            let expected = crate::util::normalize_path(file_path);
            if parsed_patch.file_path != expected {
                return Err(GenerationError::InvalidResponse(format!(
                    "diff targets {} instead of {}",
                    parsed_patch.file_path, expected
                )));
            }
            if !parsed.description.is_empty() {
                parsed_patch.description = parsed.description;
            }
            Ok(parsed_patch)
        }
    }
}

/// Parse reflection findings; `default_kind` applies when an item omits `kind`.
pub fn parse_findings(
    response: &str,
    file_path: &str,
    default_kind: IssueKind,
) -> Result<Vec<ReflectionIssue>, GenerationError> {
    let body = json_body(response)?;
    let parsed: FindingsJson = serde_json::from_str(body)
        .map_err(|e| GenerationError::InvalidResponse(format!("findings schema: {}", e)))?;

    Ok(parsed
        .issues
        .into_iter()
        .map(|f| {
            let mut issue = ReflectionIssue::new(f.kind.unwrap_or(default_kind), f.severity, f.message)
                .at(file_path, f.line);
            issue.suggested_fix = f.suggested_fix;
            issue
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_hunks_in_fences() {
        let response = r#"```json
{"description": "rename", "hunks": [
  {"start_line": 3, "old_lines": ["let a = 1;"], "new_lines": ["let b = 1;"],
   "context_before": ["x", "y", "z", "w"]}
]}
```"#;
        let patch = parse_patch_response(response, "./src/a.ts").unwrap();
        assert_eq!(patch.file_path, "src/a.ts");
        assert_eq!(patch.description, "rename");
        assert_eq!(patch.hunks.len(), 1);
        assert_eq!(patch.hunks[0].end_line, 3);
        assert_eq!(patch.hunks[0].context_before, vec!["y", "z", "w"]);
    }

    #[test]
    fn test_parse_diff_variant() {
        let diff = "--- a/src/a.ts\n+++ b/src/a.ts\n@@ -1,1 +1,1 @@\n-old\n+new\n";
        let response = serde_json::json!({ "diff": diff }).to_string();
        let patch = parse_patch_response(&format!("Here you go:\n{}", response), "src/a.ts").unwrap();
        assert_eq!(patch.hunks[0].new_lines, vec!["new"]);

        let err = parse_patch_response(&response, "src/other.ts").unwrap_err();
        assert!(matches!(err, GenerationError::InvalidResponse(_)));
    }

    #[test]
    fn test_rejects_schema_violations() {
        let cases = [
            "no json here",
            r#"{"hunks": []}"#,
            r#"{"hunks": [{"start_line": 0, "new_lines": ["x"]}]}"#,
            r#"{"hunks": [{"start_line": 1, "new_lines": ["x"], "extra": true}]}"#,
            r#"{"hunks": [{"start_line": 1}]}"#,
            r#"{"description": "nothing"}"#,
        ];
        for case in cases {
            assert!(
                matches!(
                    parse_patch_response(case, "a.ts"),
                    Err(GenerationError::InvalidResponse(_))
                ),
                "accepted: {}",
                case
            );
        }
    }

    #[test]
    fn test_parse_findings() {
        let response = r#"{"issues": [
            {"severity": "warning", "line": 4, "message": "off by one"},
            {"kind": "goal_mismatch", "severity": "error", "message": "wrong function", "suggested_fix": "edit parse()"}
        ]}"#;
        let issues = parse_findings(response, "a.ts", IssueKind::Logic).unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].kind, IssueKind::Logic);
        assert_eq!(issues[0].line(), Some(4));
        assert_eq!(issues[1].kind, IssueKind::GoalMismatch);
        assert_eq!(issues[1].suggested_fix.as_deref(), Some("edit parse()"));

        assert!(parse_findings(r#"{"issues": [{"severity": "fatal", "message": "x"}]}"#, "a.ts", IssueKind::Logic).is_err());
    }
}
