use super::{FixRequest, PatchRequest};
use crate::reflection::ReflectionIssue;

pub const PATCH_SYSTEM: &str = r#"You are a senior developer making a small, targeted edit to one file.

OUTPUT FORMAT (JSON, nothing else):
{
  "description": "1-2 sentence summary of the change",
  "hunks": [
    {
      "start_line": 12,
      "old_lines": ["exact lines being replaced"],
      "new_lines": ["replacement lines"],
      "context_before": ["up to 3 unchanged lines above"],
      "context_after": ["up to 3 unchanged lines below"]
    }
  ]
}

RULES:
- Line numbers are 1-based and refer to the numbered file you were given
- old_lines must be EXACT copies of lines start_line..start_line+len-1
- To insert without replacing, leave old_lines empty; new lines go before start_line
- Hunks must not overlap
- Preserve indentation, quote style and semicolon usage of the file
- Never write placeholders such as "// ... existing code ..."; write the real lines
- Make the smallest change that achieves the request"#;

pub const FIX_SYSTEM: &str = r#"You are a senior developer correcting a patch that failed review.

You get the original file, the previous patch as a unified diff, and the review issues.
Produce a NEW patch against the ORIGINAL file (not against the previous patch's result)
that achieves the same objective and resolves every listed issue.

Use exactly the same JSON format as before:
{"description": "...", "hunks": [{"start_line": N, "old_lines": [...], "new_lines": [...], "context_before": [...], "context_after": [...]}]}"#;

pub const GOAL_SYSTEM: &str = r#"You check whether a code change achieves its stated objective.

OUTPUT FORMAT (JSON):
{"issues": [{"severity": "error|warning|info", "line": 12, "message": "...", "suggested_fix": "..."}]}

Report an error only when the diff clearly fails to do what was asked or changes the wrong thing.
Return {"issues": []} when the change matches the objective."#;

pub const LOGIC_SYSTEM: &str = r#"You review a code change for logic errors: wrong conditions, off-by-one mistakes,
unhandled errors, broken control flow, or behavior changes outside the edited lines.

OUTPUT FORMAT (JSON):
{"issues": [{"severity": "error|warning|info", "line": 12, "message": "...", "suggested_fix": "..."}]}

Line numbers refer to the new side of the diff. Return {"issues": []} when nothing is wrong.
Do not report style preferences."#;

/// File content with 1-based line numbers, the way hunks address it
pub fn numbered(content: &str) -> String {
    if content.is_empty() {
        return "(empty file)".to_string();
    }
    let width = content.lines().count().to_string().len();
    content
        .lines()
        .enumerate()
        .map(|(idx, line)| format!("{:>width$} | {}", idx + 1, line, width = width))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn patch_user_prompt(request: &PatchRequest) -> String {
    let mut prompt = format!(
        "FILE: {}\n\nREQUEST:\n{}\n",
        request.file_path, request.change_description
    );
    if !request.line_hints.is_empty() {
        let hints: Vec<String> = request.line_hints.iter().map(|l| l.to_string()).collect();
        prompt.push_str(&format!("\nRelevant lines: {}\n", hints.join(", ")));
    }
    if !request.symbol_hints.is_empty() {
        prompt.push_str(&format!(
            "\nRelevant symbols: {}\n",
            request.symbol_hints.join(", ")
        ));
    }
    prompt.push_str(&format!("\nCONTENT:\n{}\n", numbered(&request.content)));
    prompt
}

pub fn fix_user_prompt(request: &FixRequest, previous_diff: &str) -> String {
    format!(
        "FILE: {}\n\nOBJECTIVE:\n{}\n\nREVIEW ISSUES:\n{}\n\nPREVIOUS PATCH:\n{}\nORIGINAL CONTENT:\n{}\n",
        request.file_path,
        request.objective,
        format_issues(&request.issues),
        previous_diff,
        numbered(&request.original)
    )
}

pub fn goal_user_prompt(objective: &str, file_path: &str, diff: &str) -> String {
    format!("OBJECTIVE:\n{}\n\nFILE: {}\n\nDIFF:\n{}", objective, file_path, diff)
}

pub fn logic_user_prompt(file_path: &str, diff: &str) -> String {
    format!("FILE: {}\n\nDIFF:\n{}", file_path, diff)
}

fn format_issues(issues: &[ReflectionIssue]) -> String {
    if issues.is_empty() {
        return "(none listed)".to_string();
    }
    issues
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_pads_to_widest_line_number() {
        let content: String = (1..=10).map(|i| format!("l{}\n", i)).collect();
        let out = numbered(&content);
        assert!(out.starts_with(" 1 | l1\n"));
        assert!(out.ends_with("10 | l10"));
        assert_eq!(numbered(""), "(empty file)");
    }

    #[test]
    fn test_patch_prompt_includes_hints() {
        let request = PatchRequest {
            file_path: "a.ts".into(),
            content: "x\n".into(),
            change_description: "rename x".into(),
            line_hints: vec![1],
            symbol_hints: vec!["x".into()],
        };
        let prompt = patch_user_prompt(&request);
        assert!(prompt.contains("Relevant lines: 1"));
        assert!(prompt.contains("Relevant symbols: x"));
        assert!(prompt.contains("1 | x"));
    }
}
