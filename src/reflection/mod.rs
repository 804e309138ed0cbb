//! Multi-pass reflection over a patched file
//!
//! A fixed sequence of passes inspects `(original, patched, patch, all_files)`
//! and produces [`ReflectionIssue`]s. Two passes delegate to the generation
//! collaborator; the rest are local heuristics whose results are cached by
//! content checksum for the lifetime of the engine's cache.

pub mod passes;
pub mod scan;

use crate::cache::{checksum_parts, ContentCache};
use crate::consistency::ConsistencyChecker;
use crate::files::FileSet;
use crate::generate::{FixRequest, PatchGenerator};
use crate::patch::{self, Patch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_MAX_ITERATIONS: usize = 5;
pub const DEFAULT_PASS_THRESHOLD: u32 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Syntax,
    Import,
    Export,
    Unused,
    Style,
    Logic,
    Consistency,
    GoalMismatch,
}

impl IssueKind {
    pub fn label(&self) -> &'static str {
        match self {
            IssueKind::Syntax => "syntax",
            IssueKind::Import => "import",
            IssueKind::Export => "export",
            IssueKind::Unused => "unused",
            IssueKind::Style => "style",
            IssueKind::Logic => "logic",
            IssueKind::Consistency => "consistency",
            IssueKind::GoalMismatch => "goal_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLocation {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<IssueLocation>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

impl ReflectionIssue {
    pub fn new(kind: IssueKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            location: None,
            message: message.into(),
            suggested_fix: None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: Option<usize>) -> Self {
        self.location = Some(IssueLocation {
            file: file.into(),
            line,
        });
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }

    pub fn line(&self) -> Option<usize> {
        self.location.as_ref().and_then(|l| l.line)
    }
}

impl fmt::Display for ReflectionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.severity.label(), self.kind.label())?;
        if let Some(loc) = &self.location {
            match loc.line {
                Some(line) => write!(f, " {}:{}", loc.file, line)?,
                None => write!(f, " {}", loc.file)?,
            }
        }
        write!(f, " {}", self.message)?;
        if let Some(fix) = &self.suggested_fix {
            write!(f, " (fix: {})", fix)?;
        }
        Ok(())
    }
}

/// Reflection passes, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    GoalAlignment,
    Syntax,
    Imports,
    Exports,
    UnusedSymbols,
    Style,
    LogicReview,
    CrossFile,
}

impl Pass {
    pub const ALL: [Pass; 8] = [
        Pass::GoalAlignment,
        Pass::Syntax,
        Pass::Imports,
        Pass::Exports,
        Pass::UnusedSymbols,
        Pass::Style,
        Pass::LogicReview,
        Pass::CrossFile,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Pass::GoalAlignment => "goal_alignment",
            Pass::Syntax => "syntax",
            Pass::Imports => "imports",
            Pass::Exports => "exports",
            Pass::UnusedSymbols => "unused_symbols",
            Pass::Style => "style",
            Pass::LogicReview => "logic_review",
            Pass::CrossFile => "cross_file",
        }
    }

    /// Passes answered by the generation collaborator
    pub fn is_collaborative(&self) -> bool {
        matches!(self, Pass::GoalAlignment | Pass::LogicReview)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionSettings {
    pub max_iterations: usize,
    pub pass_threshold: u32,
    pub disabled_passes: Vec<Pass>,
}

impl Default for ReflectionSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            disabled_passes: Vec::new(),
        }
    }
}

impl ReflectionSettings {
    pub fn is_enabled(&self, pass: Pass) -> bool {
        !self.disabled_passes.contains(&pass)
    }
}

/// Everything one reflection round looks at
#[derive(Debug, Clone, Copy)]
pub struct ReflectionContext<'a> {
    pub objective: &'a str,
    pub file_path: &'a str,
    pub original: &'a str,
    pub patched: &'a str,
    pub patch: &'a Patch,
    pub all_files: &'a FileSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionReport {
    pub issues: Vec<ReflectionIssue>,
    pub score: u32,
    pub passed: bool,
    pub requires_revision: bool,
    pub passes_run: Vec<Pass>,
}

impl ReflectionReport {
    /// Score and classify a set of issues.
    ///
    /// `score = 100 - 20*errors - 5*warnings - infos`, floored at 0.
    pub fn from_issues(issues: Vec<ReflectionIssue>, threshold: u32) -> Self {
        let (errors, warnings, infos) = count_by_severity(&issues);
        let penalty = 20 * errors + 5 * warnings + infos;
        let score = 100usize.saturating_sub(penalty) as u32;
        Self {
            passed: errors == 0 && score >= threshold,
            requires_revision: errors > 0 || warnings > 3 || score < threshold,
            score,
            issues,
            passes_run: Vec::new(),
        }
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        count_by_severity(&self.issues)
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    /// Issues a fix request should address: every error, or every warning
    /// when there are no errors.
    pub fn revision_targets(&self) -> Vec<ReflectionIssue> {
        let wanted = if self.has_errors() {
            Severity::Error
        } else {
            Severity::Warning
        };
        self.issues
            .iter()
            .filter(|i| i.severity == wanted)
            .cloned()
            .collect()
    }
}

fn count_by_severity(issues: &[ReflectionIssue]) -> (usize, usize, usize) {
    issues
        .iter()
        .fold((0, 0, 0), |(e, w, i), issue| match issue.severity {
            Severity::Error => (e + 1, w, i),
            Severity::Warning => (e, w + 1, i),
            Severity::Info => (e, w, i + 1),
        })
}

/// Result of a reflect-and-fix loop
#[derive(Debug, Clone)]
pub struct ReflectionOutcome {
    /// Report of the last round
    pub report: ReflectionReport,
    /// The patch the last round reflected on
    pub patch: Patch,
    /// Original content with `patch` applied
    pub patched: String,
    /// Reflection rounds run
    pub iterations: usize,
    pub fixes_requested: usize,
    pub history: Vec<ReflectionReport>,
}

pub struct ReflectionEngine {
    generator: Arc<dyn PatchGenerator>,
    checker: Arc<ConsistencyChecker>,
    settings: ReflectionSettings,
    cache: Arc<ContentCache<Vec<ReflectionIssue>>>,
}

impl ReflectionEngine {
    pub fn new(
        generator: Arc<dyn PatchGenerator>,
        checker: Arc<ConsistencyChecker>,
        settings: ReflectionSettings,
    ) -> Self {
        Self {
            generator,
            checker,
            settings,
            cache: Arc::new(ContentCache::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ContentCache<Vec<ReflectionIssue>>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn settings(&self) -> &ReflectionSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ContentCache<Vec<ReflectionIssue>> {
        &self.cache
    }

    /// Run every enabled pass, collaborator passes included.
    pub async fn reflect(&self, ctx: &ReflectionContext<'_>) -> ReflectionReport {
        let mut local = self.local_issues(ctx);
        let mut issues = Vec::new();
        let mut passes_run = Vec::new();

        for pass in Pass::ALL {
            if !self.settings.is_enabled(pass) {
                continue;
            }
            passes_run.push(pass);
            match pass {
                Pass::GoalAlignment => issues.extend(self.goal_alignment(ctx).await),
                Pass::LogicReview => issues.extend(self.logic_review(ctx).await),
                _ => {
                    if let Some(pos) = local.iter().position(|(p, _)| *p == pass) {
                        issues.extend(local.swap_remove(pos).1);
                    }
                }
            }
        }

        let mut report = ReflectionReport::from_issues(issues, self.settings.pass_threshold);
        report.passes_run = passes_run;
        report
    }

    /// Run only the local passes; no collaborator calls.
    pub fn reflect_local(&self, ctx: &ReflectionContext<'_>) -> ReflectionReport {
        let local = self.local_issues(ctx);
        let passes_run = local.iter().map(|(p, _)| *p).collect();
        let issues = local.into_iter().flat_map(|(_, issues)| issues).collect();
        let mut report = ReflectionReport::from_issues(issues, self.settings.pass_threshold);
        report.passes_run = passes_run;
        report
    }

    /// Reflect, and while the result needs revision ask the collaborator for
    /// a corrected patch, for at most `max_iterations` reflection rounds.
    ///
    /// Each fix request carries the round's error-severity issues. A round
    /// with no errors that still needs revision (more than three warnings or a
    /// score under the threshold) sends its warnings instead; see
    /// [`ReflectionReport::revision_targets`].
    ///
    /// Fixes are applied to the original content. A failed fix request or a
    /// fix that does not apply cleanly still uses up its round; the previous
    /// patch is kept.
    pub async fn reflect_and_fix(
        &self,
        ctx: &ReflectionContext<'_>,
        max_iterations: usize,
    ) -> ReflectionOutcome {
        let max_iterations = max_iterations.max(1);
        let mut current_patch = ctx.patch.clone();
        let mut current_patched = ctx.patched.to_string();
        let mut history: Vec<ReflectionReport> = Vec::new();
        let mut fixes_requested = 0;

        for round in 1..=max_iterations {
            let round_ctx = ReflectionContext {
                patch: &current_patch,
                patched: &current_patched,
                ..*ctx
            };
            let report = self.reflect(&round_ctx).await;
            let (errors, warnings, infos) = report.counts();
            tracing::info!(
                file = %ctx.file_path,
                round,
                score = report.score,
                errors,
                warnings,
                infos,
                passed = report.passed,
                "reflection round"
            );

            let done = report.passed || !report.requires_revision || round == max_iterations;
            let targets = report.revision_targets();
            history.push(report);
            if done {
                break;
            }

            fixes_requested += 1;
            let request = FixRequest {
                objective: ctx.objective.to_string(),
                file_path: ctx.file_path.to_string(),
                original: ctx.original.to_string(),
                patch: current_patch.clone(),
                issues: targets,
            };
            match self.generator.generate_fix(&request).await {
                Ok(fix) => {
                    let applied = patch::apply(&fix, ctx.original);
                    if applied.success {
                        current_patch = fix;
                        current_patched = applied.new_content;
                    } else {
                        tracing::warn!(
                            file = %ctx.file_path,
                            round,
                            failed = applied.hunks_failed,
                            "proposed fix does not apply; keeping previous patch"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(file = %ctx.file_path, round, error = %e, "fix request failed");
                }
            }
        }

        let iterations = history.len();
        let report = history.last().cloned().unwrap_or_default();
        ReflectionOutcome {
            report,
            patch: current_patch,
            patched: current_patched,
            iterations,
            fixes_requested,
            history,
        }
    }

    fn local_issues(&self, ctx: &ReflectionContext<'_>) -> Vec<(Pass, Vec<ReflectionIssue>)> {
        let mut input: Option<passes::PassInput> = None;
        let mut out = Vec::new();

        for pass in Pass::ALL {
            if pass.is_collaborative() || !self.settings.is_enabled(pass) {
                continue;
            }
            let issues = match pass {
                Pass::CrossFile => self.cross_file(ctx),
                _ => {
                    let key = checksum_parts(&[pass.name(), ctx.file_path, ctx.original, ctx.patched]);
                    let cached = self.cache.get_or_insert_with(key, || {
                        let input = input.get_or_insert_with(|| {
                            passes::PassInput::new(ctx.file_path, ctx.original, ctx.patched)
                        });
                        passes::run(pass, input)
                    });
                    cached.as_ref().clone()
                }
            };
            out.push((pass, issues));
        }

        out
    }

    fn cross_file(&self, ctx: &ReflectionContext<'_>) -> Vec<ReflectionIssue> {
        self.checker
            .broken_by_change(ctx.file_path, ctx.original, ctx.patched, ctx.all_files)
            .into_iter()
            .map(|issue| {
                ReflectionIssue::new(IssueKind::Consistency, Severity::Error, issue.to_string())
                    .at(issue.importer.clone(), Some(issue.line))
                    .with_fix(format!(
                        "keep exporting '{}' from {} or update {}",
                        issue.symbol, issue.exporter, issue.importer
                    ))
            })
            .collect()
    }

    async fn goal_alignment(&self, ctx: &ReflectionContext<'_>) -> Vec<ReflectionIssue> {
        let diff = patch::to_unified_diff(ctx.patch);
        match self.generator.check_goal(ctx.objective, ctx.file_path, &diff).await {
            Ok(issues) => issues,
            Err(e) => {
                tracing::warn!(file = %ctx.file_path, error = %e, "goal alignment check failed");
                Vec::new()
            }
        }
    }

    async fn logic_review(&self, ctx: &ReflectionContext<'_>) -> Vec<ReflectionIssue> {
        let diff = patch::to_unified_diff(ctx.patch);
        match self.generator.review_logic(ctx.file_path, &diff).await {
            Ok(issues) => issues,
            Err(e) => {
                tracing::warn!(file = %ctx.file_path, error = %e, "logic review failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::{GenerationError, PatchRequest};
    use crate::graph::ImportResolver;
    use crate::patch::Hunk;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always proposes the same broken fix
    struct StubbornGenerator {
        fixes: AtomicUsize,
    }

    impl PatchGenerator for StubbornGenerator {
        fn generate_patch<'a>(
            &'a self,
            _request: &'a PatchRequest,
        ) -> BoxFuture<'a, Result<Patch, GenerationError>> {
            Box::pin(async { Err(GenerationError::Unavailable("stub".into())) })
        }

        fn generate_fix<'a>(
            &'a self,
            request: &'a FixRequest,
        ) -> BoxFuture<'a, Result<Patch, GenerationError>> {
            self.fixes.fetch_add(1, Ordering::SeqCst);
            let patch = request.patch.clone();
            Box::pin(async move { Ok(patch) })
        }
    }

    fn issue(severity: Severity) -> ReflectionIssue {
        ReflectionIssue::new(IssueKind::Style, severity, "x")
    }

    #[test]
    fn test_score_and_flags() {
        let report = ReflectionReport::from_issues(vec![issue(Severity::Error)], 70);
        assert_eq!(report.score, 80);
        assert!(!report.passed);
        assert!(report.requires_revision);

        let warnings = (0..4).map(|_| issue(Severity::Warning)).collect();
        let report = ReflectionReport::from_issues(warnings, 70);
        assert_eq!(report.score, 80);
        assert!(report.passed);
        assert!(report.requires_revision);

        let many = (0..8).map(|_| issue(Severity::Error)).collect();
        assert_eq!(ReflectionReport::from_issues(many, 70).score, 0);

        let clean = ReflectionReport::from_issues(vec![issue(Severity::Info)], 70);
        assert_eq!(clean.score, 99);
        assert!(clean.passed && !clean.requires_revision);
    }

    #[test]
    fn test_revision_targets_prefer_errors() {
        let report = ReflectionReport::from_issues(
            vec![issue(Severity::Warning), issue(Severity::Error), issue(Severity::Info)],
            70,
        );
        let targets = report.revision_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].severity, Severity::Error);

        let report = ReflectionReport::from_issues(vec![issue(Severity::Warning), issue(Severity::Info)], 70);
        assert_eq!(report.revision_targets().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_stops_after_max_iterations() {
        let original = "function ok() {\n  return 1;\n}\n";
        let patch = Patch::new(
            "src/a.ts",
            "break it",
            vec![Hunk::new(
                2,
                vec!["  return 1;".to_string()],
                vec!["  return (1;".to_string()],
            )],
        );
        let patched = patch::apply(&patch, original).new_content;
        let files = FileSet::from_pairs([("src/a.ts", original)]);

        let generator = Arc::new(StubbornGenerator {
            fixes: AtomicUsize::new(0),
        });
        let engine = ReflectionEngine::new(
            generator.clone(),
            Arc::new(ConsistencyChecker::new(ImportResolver::default())),
            ReflectionSettings::default(),
        );
        let ctx = ReflectionContext {
            objective: "keep it working",
            file_path: "src/a.ts",
            original,
            patched: &patched,
            patch: &patch,
            all_files: &files,
        };

        let outcome = engine.reflect_and_fix(&ctx, 3).await;
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(outcome.fixes_requested, 2);
        assert_eq!(generator.fixes.load(Ordering::SeqCst), 2);
        assert!(outcome.report.has_errors());
        assert!(engine.cache().stats().hits > 0);
    }

    #[tokio::test]
    async fn test_clean_patch_passes_first_round() {
        let original = "export function ok() {\n  return 1;\n}\n";
        let patch = Patch::new(
            "src/a.ts",
            "bump",
            vec![Hunk::new(
                2,
                vec!["  return 1;".to_string()],
                vec!["  return 2;".to_string()],
            )],
        );
        let patched = patch::apply(&patch, original).new_content;
        let files = FileSet::from_pairs([("src/a.ts", original)]);
        let engine = ReflectionEngine::new(
            Arc::new(StubbornGenerator {
                fixes: AtomicUsize::new(0),
            }),
            Arc::new(ConsistencyChecker::new(ImportResolver::default())),
            ReflectionSettings::default(),
        );
        let ctx = ReflectionContext {
            objective: "bump",
            file_path: "src/a.ts",
            original,
            patched: &patched,
            patch: &patch,
            all_files: &files,
        };
        let outcome = engine.reflect_and_fix(&ctx, 5).await;
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.fixes_requested, 0);
        assert!(outcome.report.passed);
        assert_eq!(outcome.report.passes_run.len(), 8);
    }
}
