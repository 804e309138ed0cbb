//! Patch verification and application
//!
//! Hunks are applied back-to-front so that replacing one region never shifts
//! the line numbers of hunks that have not been applied yet. When a hunk's
//! recorded position no longer matches (the file drifted since the patch was
//! authored), the hunk is relocated by searching for its context.

use super::{ApplyResult, Hunk, LineBuffer, Patch, VerificationResult};
use std::cmp::Reverse;

/// Check a patch against the current content without modifying anything.
///
/// The result is advisory: hunks that can be relocated by context search are
/// reported as suggestions, and `apply` will still attempt them.
pub fn verify(patch: &Patch, content: &str) -> VerificationResult {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let mut issues = Vec::new();
    let mut suggestions = Vec::new();

    if patch.hunks.is_empty() {
        issues.push("Patch contains no hunks".to_string());
    }

    for (i, hunk) in patch.hunks.iter().enumerate() {
        let label = format!("Hunk {} ({})", i + 1, hunk.range_label());

        if let Err(e) = hunk.check_invariant() {
            issues.push(format!("{}: {}", label, e));
            continue;
        }
        if hunk.start_line < 1 {
            issues.push(format!("{}: start_line must be at least 1", label));
            continue;
        }

        let in_range = if hunk.is_insertion() {
            hunk.start_line <= total + 1
        } else {
            hunk.end_line <= total
        };

        let matches = in_range && {
            let at = hunk.start_line - 1;
            if hunk.is_insertion() {
                context_precedes(&lines, at, &hunk.context_before, |a, b| a == b)
            } else {
                lines[at..=hunk.end_line - 1]
                    .iter()
                    .zip(&hunk.old_lines)
                    .all(|(actual, expected)| *actual == expected.as_str())
            }
        };
        if matches {
            continue;
        }

        let problem = if in_range {
            format!("{}: lines do not match the current file content", label)
        } else {
            format!(
                "{}: targets line {} but the file has {} lines",
                label,
                hunk.end_line.max(hunk.start_line),
                total
            )
        };

        match find_by_context(&lines, &hunk.context_before, &hunk.old_lines) {
            Some(idx) => {
                let found = idx + hunk.context_before.len() + 1;
                suggestions.push(format!(
                    "{}: matching content found at line {} (offset {:+})",
                    label,
                    found,
                    found as isize - hunk.start_line as isize
                ));
            }
            None => issues.push(problem),
        }
    }

    let sorted = patch.sorted_hunks();
    for (i, a) in sorted.iter().enumerate() {
        for b in sorted.iter().skip(i + 1) {
            if a.overlaps(b) {
                issues.push(format!(
                    "Hunks {} and {} overlap (lines {} and {})",
                    a.id,
                    b.id,
                    a.range_label(),
                    b.range_label()
                ));
            }
        }
    }

    VerificationResult {
        valid: issues.is_empty(),
        issues,
        suggestions,
    }
}

/// Apply every hunk that can be placed; report the ones that cannot.
///
/// Partial application is allowed: `success` is only true when no hunk
/// failed, and `hunks_applied + hunks_failed` always equals the hunk count.
pub fn apply(patch: &Patch, content: &str) -> ApplyResult {
    let mut buffer = LineBuffer::from_content(content);
    let mut errors = Vec::new();
    let mut hunks_applied = 0;
    let mut hunks_failed = 0;

    // Back-to-front; at equal start lines replacements go before insertions
    let mut order: Vec<&Hunk> = patch.hunks.iter().collect();
    order.sort_by_key(|h| (Reverse(h.start_line), h.is_insertion()));

    for hunk in order {
        match locate(&buffer.lines, hunk) {
            Some(at) => {
                let end = at + hunk.old_lines.len();
                buffer.lines.splice(at..end, hunk.new_lines.iter().cloned());
                hunks_applied += 1;
            }
            None => {
                hunks_failed += 1;
                errors.push(format!(
                    "Hunk {} (lines {}): could not locate target lines in {}",
                    hunk.id,
                    hunk.range_label(),
                    patch.file_path
                ));
            }
        }
    }

    ApplyResult {
        success: hunks_failed == 0,
        new_content: buffer.into_content(),
        hunks_applied,
        hunks_failed,
        errors,
    }
}

/// Find where a hunk's lines currently live.
fn locate(lines: &[String], hunk: &Hunk) -> Option<usize> {
    if hunk.start_line >= 1 && matches_at(lines, hunk.start_line - 1, hunk) {
        return Some(hunk.start_line - 1);
    }
    find_by_context(lines, &hunk.context_before, &hunk.old_lines)
        .map(|idx| idx + hunk.context_before.len())
}

fn matches_at(lines: &[String], at: usize, hunk: &Hunk) -> bool {
    if hunk.is_insertion() {
        return at <= lines.len()
            && context_precedes(lines, at, &hunk.context_before, |a, b| a.trim() == b.trim());
    }
    let end = at + hunk.old_lines.len();
    end <= lines.len()
        && lines[at..end]
            .iter()
            .zip(&hunk.old_lines)
            .all(|(actual, expected)| actual.trim() == expected.trim())
}

fn context_precedes<S: AsRef<str>>(
    lines: &[S],
    at: usize,
    context: &[String],
    eq: impl Fn(&str, &str) -> bool,
) -> bool {
    if context.is_empty() {
        return true;
    }
    if context.len() > at || at > lines.len() {
        return false;
    }
    lines[at - context.len()..at]
        .iter()
        .zip(context)
        .all(|(actual, expected)| eq(actual.as_ref(), expected.as_str()))
}

/// Locate `context_before + old_lines` in `lines` by whitespace-insensitive
/// comparison. Returns the index of the first line of the matched window
/// (i.e. where `context_before` starts).
///
/// A window whose normalized text equals the needle wins; otherwise the first
/// window that contains the needle, or is contained in it, is returned.
pub fn find_by_context<S: AsRef<str>>(
    lines: &[S],
    context_before: &[String],
    old_lines: &[String],
) -> Option<usize> {
    let window = context_before.len() + old_lines.len();
    if window == 0 || window > lines.len() {
        return None;
    }

    let needle = normalize_block(context_before.iter().chain(old_lines));
    if needle.trim().is_empty() {
        return None;
    }

    let candidates: Vec<String> = (0..=lines.len() - window)
        .map(|start| normalize_block(&lines[start..start + window]))
        .collect();

    if let Some(idx) = candidates.iter().position(|c| *c == needle) {
        return Some(idx);
    }
    candidates.iter().position(|candidate| {
        !candidate.trim().is_empty() && (candidate.contains(&needle) || needle.contains(candidate.as_str()))
    })
}

fn normalize_block<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .map(|l| l.as_ref().trim().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the patch that undoes `patch`.
///
/// Old and new lines are swapped and every hunk is re-based onto the line
/// numbers of the patched content, so applying the result to the output of
/// `apply(patch, c)` yields `c` again.
pub fn create_rollback_patch(patch: &Patch) -> Patch {
    let mut delta: isize = 0;
    let mut hunks = Vec::with_capacity(patch.hunks.len());

    for hunk in patch.sorted_hunks() {
        let start = (hunk.start_line as isize + delta).max(1) as usize;
        let mut reversed = Hunk::new(start, hunk.new_lines.clone(), hunk.old_lines.clone());
        reversed.context_before = hunk.context_before.clone();
        reversed.context_after = hunk.context_after.clone();
        delta += hunk.line_delta();
        hunks.push(reversed);
    }

    let description = if patch.description.is_empty() {
        format!("Rollback of {}", patch.id)
    } else {
        format!("Rollback of {}: {}", patch.id, patch.description)
    };
    Patch::new(patch.file_path.clone(), description, hunks)
}
