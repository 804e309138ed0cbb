//! Patch model
//!
//! A [`Patch`] is an ordered set of [`Hunk`]s against one file. Line numbers
//! are 1-based and inclusive, and always refer to the *original* content the
//! patch was authored against.

pub mod apply;
pub mod diff;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use apply::{apply, create_rollback_patch, find_by_context, verify};
pub use diff::{from_unified_diff, from_unified_diff_multi, to_unified_diff, DiffParseError};

/// Maximum number of context lines kept on either side of a hunk
pub const MAX_CONTEXT_LINES: usize = 3;

/// A contiguous line-range replacement within one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub id: String,
    pub start_line: usize,
    pub end_line: usize,
    pub old_lines: Vec<String>,
    pub new_lines: Vec<String>,
    #[serde(default)]
    pub context_before: Vec<String>,
    #[serde(default)]
    pub context_after: Vec<String>,
}

impl Hunk {
    /// Replace `old_lines` starting at `start_line` with `new_lines`.
    ///
    /// With empty `old_lines` this is a pure insertion before `start_line`
    /// (and `end_line` becomes `start_line - 1`).
    pub fn new(start_line: usize, old_lines: Vec<String>, new_lines: Vec<String>) -> Self {
        let end_line = (start_line + old_lines.len()).saturating_sub(1);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            start_line,
            end_line,
            old_lines,
            new_lines,
            context_before: Vec::new(),
            context_after: Vec::new(),
        }
    }

    /// Attach surrounding context, keeping only the lines nearest the hunk.
    pub fn with_context(mut self, before: Vec<String>, after: Vec<String>) -> Self {
        let skip = before.len().saturating_sub(MAX_CONTEXT_LINES);
        self.context_before = before.into_iter().skip(skip).collect();
        self.context_after = after.into_iter().take(MAX_CONTEXT_LINES).collect();
        self
    }

    pub fn is_insertion(&self) -> bool {
        self.old_lines.is_empty()
    }

    /// Net change in line count once applied
    pub fn line_delta(&self) -> isize {
        self.new_lines.len() as isize - self.old_lines.len() as isize
    }

    /// Half-open `[start, end)` range of original lines this hunk claims.
    fn claimed_range(&self) -> (usize, usize) {
        (self.start_line, self.start_line + self.old_lines.len())
    }

    /// Whether two hunks touch the same original lines.
    ///
    /// Insertions only conflict with a replacement that strictly contains
    /// their insertion point, or with another insertion at the same line.
    pub fn overlaps(&self, other: &Hunk) -> bool {
        let (a_start, a_end) = self.claimed_range();
        let (b_start, b_end) = other.claimed_range();
        match (self.is_insertion(), other.is_insertion()) {
            (true, true) => a_start == b_start,
            (true, false) => b_start < a_start && a_start < b_end,
            (false, true) => a_start < b_start && b_start < a_end,
            (false, false) => a_start < b_end && b_start < a_end,
        }
    }

    /// Check the line-count invariant between the declared range and `old_lines`.
    pub fn check_invariant(&self) -> Result<(), String> {
        if self.old_lines.is_empty() {
            if self.end_line + 1 != self.start_line {
                return Err(format!(
                    "insertion hunk must have end_line = start_line - 1 (got {}-{})",
                    self.start_line, self.end_line
                ));
            }
            return Ok(());
        }
        if self.end_line < self.start_line {
            return Err(format!(
                "end_line {} is before start_line {}",
                self.end_line, self.start_line
            ));
        }
        let declared = self.end_line - self.start_line + 1;
        if declared != self.old_lines.len() {
            return Err(format!(
                "range {}-{} covers {} lines but old_lines has {}",
                self.start_line,
                self.end_line,
                declared,
                self.old_lines.len()
            ));
        }
        Ok(())
    }

    /// Short `start-end` label used in messages
    pub fn range_label(&self) -> String {
        if self.is_insertion() {
            format!("insert@{}", self.start_line)
        } else {
            format!("{}-{}", self.start_line, self.end_line)
        }
    }
}

/// An ordered set of hunks for one file plus metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    pub file_path: String,
    pub hunks: Vec<Hunk>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub applied: bool,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
}

impl Patch {
    pub fn new(file_path: impl Into<String>, description: impl Into<String>, hunks: Vec<Hunk>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: crate::util::normalize_path(&file_path.into()),
            hunks,
            description: description.into(),
            verified: false,
            applied: false,
            applied_at: None,
        }
    }

    /// Patch that creates `file_path` with `content`.
    pub fn create_file(file_path: impl Into<String>, description: impl Into<String>, content: &str) -> Self {
        let lines = LineBuffer::from_content(content).lines;
        Self::new(file_path, description, vec![Hunk::new(1, Vec::new(), lines)])
    }

    pub fn mark_applied(&mut self) {
        self.applied = true;
        self.applied_at = Some(Utc::now());
    }

    /// Total (additions, deletions) across hunks
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            (acc.0 + h.new_lines.len(), acc.1 + h.old_lines.len())
        })
    }

    /// Hunks ordered by ascending start line (stable for ties)
    pub fn sorted_hunks(&self) -> Vec<&Hunk> {
        let mut hunks: Vec<&Hunk> = self.hunks.iter().collect();
        hunks.sort_by_key(|h| h.start_line);
        hunks
    }
}

/// Outcome of checking a patch against current file content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Outcome of applying a patch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub success: bool,
    pub new_content: String,
    pub hunks_applied: usize,
    pub hunks_failed: usize,
    pub errors: Vec<String>,
}

/// File content split into lines, remembering how to join them back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBuffer {
    pub lines: Vec<String>,
    crlf: bool,
    trailing_newline: bool,
}

impl LineBuffer {
    pub fn from_content(content: &str) -> Self {
        let crlf = content.contains("\r\n");
        // New files get a trailing newline
        let trailing_newline = content.is_empty() || content.ends_with('\n');
        let lines = content.lines().map(|l| l.to_string()).collect();
        Self {
            lines,
            crlf,
            trailing_newline,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_content(self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let eol = if self.crlf { "\r\n" } else { "\n" };
        let mut out = self.lines.join(eol);
        if self.trailing_newline {
            out.push_str(eol);
        }
        out
    }
}

/// Number of lines in `content` as the applier counts them
pub fn line_count(content: &str) -> usize {
    content.lines().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hunk_new_computes_end_line() {
        let h = Hunk::new(5, lines(&["x", "y"]), lines(&["z"]));
        assert_eq!(h.end_line, 6);
        assert!(h.check_invariant().is_ok());

        let ins = Hunk::new(3, Vec::new(), lines(&["a"]));
        assert_eq!(ins.end_line, 2);
        assert!(ins.is_insertion());
        assert!(ins.check_invariant().is_ok());
    }

    #[test]
    fn test_invariant_rejects_wrong_range() {
        let mut h = Hunk::new(5, lines(&["x", "y"]), lines(&["z"]));
        h.end_line = 9;
        assert!(h.check_invariant().is_err());
    }

    #[test]
    fn test_context_is_capped_to_nearest_lines() {
        let h = Hunk::new(10, lines(&["x"]), lines(&["y"]))
            .with_context(lines(&["1", "2", "3", "4", "5"]), lines(&["6", "7", "8", "9"]));
        assert_eq!(h.context_before, lines(&["3", "4", "5"]));
        assert_eq!(h.context_after, lines(&["6", "7", "8"]));
    }

    #[test]
    fn test_overlap_rules() {
        let a = Hunk::new(3, lines(&["a", "b", "c"]), Vec::new());
        let b = Hunk::new(5, lines(&["c", "d"]), Vec::new());
        let c = Hunk::new(6, lines(&["e"]), Vec::new());
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));

        let ins_edge = Hunk::new(3, Vec::new(), lines(&["new"]));
        let ins_inside = Hunk::new(4, Vec::new(), lines(&["new"]));
        assert!(!a.overlaps(&ins_edge));
        assert!(a.overlaps(&ins_inside));
        assert!(ins_edge.overlaps(&Hunk::new(3, Vec::new(), lines(&["other"]))));
    }

    #[test]
    fn test_line_buffer_round_trip_preserves_endings() {
        for content in ["a\nb\n", "a\nb", "a\r\nb\r\n", ""] {
            assert_eq!(LineBuffer::from_content(content).into_content(), content);
        }
    }

    #[test]
    fn test_patch_path_is_normalized() {
        let p = Patch::new("./src\\a.ts", "x", Vec::new());
        assert_eq!(p.file_path, "src/a.ts");
    }
}
