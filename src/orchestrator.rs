//! Step orchestration
//!
//! A plan is an ordered list of steps, each touching one file. Steps run one
//! at a time in dependency order against an in-memory file set owned by the
//! run, so later steps always see what earlier steps committed. A failed step
//! never stops the run; steps depending on it are skipped with a reason.

use crate::cache::ContentCache;
use crate::config::Config;
use crate::consistency::{ConsistencyChecker, ConsistencyError, ConsistencyIssue};
use crate::files::FileSet;
use crate::generate::{PatchGenerator, PatchRequest};
use crate::graph::DependencyGraph;
use crate::patch::{self, Patch};
use crate::reflection::{
    ReflectionContext, ReflectionEngine, ReflectionIssue, ReflectionReport, ReflectionSettings,
};
use crate::util::{normalize_path, CancelFlag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Modify,
    Create,
    Delete,
    Inspect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub file_path: String,
    pub description: String,
    pub action_type: ActionType,
    /// Higher runs first among steps that are ready at the same time
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub line_hints: Vec<usize>,
    #[serde(default)]
    pub symbol_hints: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub objective: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid JSON plan: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid TOML plan: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Plan {
    pub fn from_json(text: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml(text: &str) -> Result<Self, PlanError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a plan file; `.toml` is parsed as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOpKind {
    Create,
    Modify,
    Delete,
}

/// One file change a run produced, in execution order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    pub kind: FileOpKind,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    /// Skip reason or last error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<ReflectionReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            attempts: 0,
            reason: None,
            notes: Vec::new(),
            reflection: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTelemetry {
    pub runs: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub attempts: u64,
    pub retries: u64,
    pub hunks_applied: u64,
    pub hunks_failed: u64,
    pub reflection_rounds: u64,
    pub fixes_requested: u64,
}

impl RunTelemetry {
    fn absorb(&mut self, other: &RunTelemetry) {
        self.runs += other.runs;
        self.steps_completed += other.steps_completed;
        self.steps_failed += other.steps_failed;
        self.steps_skipped += other.steps_skipped;
        self.attempts += other.attempts;
        self.retries += other.retries;
        self.hunks_applied += other.hunks_applied;
        self.hunks_failed += other.hunks_failed;
        self.reflection_rounds += other.reflection_rounds;
        self.fixes_requested += other.fixes_requested;
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    /// One record per step, in execution order
    pub records: Vec<StepRecord>,
    pub operations: Vec<FileOperation>,
    /// File set after every committed step
    pub files: FileSet,
    pub consistency_issues: Vec<ConsistencyIssue>,
    pub telemetry: RunTelemetry,
    pub cancelled: bool,
}

impl RunReport {
    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.records.iter().find(|r| r.step_id == step_id)
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.record(step_id).map(|r| r.status)
    }

    pub fn is_consistent(&self) -> bool {
        self.consistency_issues.is_empty()
    }

    /// Accept the run's operations as one batch, or reject them all when the
    /// final cross-file check found broken imports.
    pub fn ensure_consistent(&self) -> Result<(), ConsistencyError> {
        if self.is_consistent() {
            Ok(())
        } else {
            Err(ConsistencyError::BatchRejected {
                issues: self.consistency_issues.clone(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    StepStarted {
        step_id: String,
        attempt: u32,
    },
    StepRetrying {
        step_id: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    StepFinished {
        step_id: String,
        status: StepStatus,
        reason: Option<String>,
    },
    RunFinished {
        telemetry: RunTelemetry,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub max_retries_per_step: u32,
    pub backoff_base: Duration,
    pub long_file_lines: usize,
    pub reflection: ReflectionSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries_per_step: config.orchestrator.max_retries_per_step,
            backoff_base: Duration::from_millis(config.orchestrator.backoff_base_ms),
            long_file_lines: config.reflection.long_file_lines,
            reflection: config.reflection.settings(),
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Why one attempt at a step failed
enum AttemptError {
    /// Worth retrying: generation, application or reflection failed
    Retryable(anyhow::Error),
    /// A precondition that another attempt cannot change
    Fatal(anyhow::Error),
}

fn fatal(msg: String) -> AttemptError {
    AttemptError::Fatal(anyhow::anyhow!(msg))
}

fn retryable(msg: String) -> AttemptError {
    AttemptError::Retryable(anyhow::anyhow!(msg))
}

enum FileChange {
    Upsert(String),
    Remove,
    Unchanged,
}

struct StepSuccess {
    change: FileChange,
    operation: Option<FileOperation>,
    notes: Vec<String>,
    reflection: Option<ReflectionReport>,
}

pub struct Orchestrator {
    generator: Arc<dyn PatchGenerator>,
    checker: Arc<ConsistencyChecker>,
    reflection: ReflectionEngine,
    settings: OrchestratorSettings,
    progress: Option<Sender<ProgressEvent>>,
    cancel: CancelFlag,
    lifetime: Mutex<RunTelemetry>,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn PatchGenerator>,
        checker: Arc<ConsistencyChecker>,
        settings: OrchestratorSettings,
    ) -> Self {
        let reflection = ReflectionEngine::new(
            Arc::clone(&generator),
            Arc::clone(&checker),
            settings.reflection.clone(),
        );
        Self {
            generator,
            checker,
            reflection,
            settings,
            progress: None,
            cancel: CancelFlag::new(),
            lifetime: Mutex::new(RunTelemetry::default()),
        }
    }

    pub fn with_progress(mut self, tx: Sender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Share a reflection result cache across orchestrators of one session
    pub fn with_reflection_cache(mut self, cache: Arc<ContentCache<Vec<ReflectionIssue>>>) -> Self {
        self.reflection = self.reflection.with_cache(cache);
        self
    }

    /// Counters summed over every run of this orchestrator
    pub fn telemetry(&self) -> RunTelemetry {
        *self.lifetime.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }

    pub async fn run(&self, plan: &Plan, files: FileSet) -> Result<RunReport, OrchestrationError> {
        let order = execution_order(&plan.steps)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(run_id = %run_id, steps = order.len(), "orchestration run started");

        let actions: HashMap<&str, ActionType> = plan
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.action_type))
            .collect();
        let mut files = files;
        let mut statuses: HashMap<String, StepStatus> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        let mut records = Vec::new();
        let mut operations = Vec::new();
        let mut touched: Vec<String> = Vec::new();
        let mut telemetry = RunTelemetry {
            runs: 1,
            ..RunTelemetry::default()
        };

        for step in order {
            let mut record = StepRecord::new(&step.id);

            let skip_reason = if self.cancel.is_cancelled() {
                Some("run cancelled".to_string())
            } else {
                unmet_dependency(step, &statuses, &actions)
            };
            if let Some(reason) = skip_reason {
                tracing::info!(step = %step.id, reason = %reason, "step skipped");
                record.status = StepStatus::Skipped;
                record.reason = Some(reason);
                telemetry.steps_skipped += 1;
                self.finish(&mut statuses, &mut records, record);
                continue;
            }

            record.status = StepStatus::InProgress;
            record.started_at = Some(Utc::now());
            statuses.insert(step.id.clone(), StepStatus::InProgress);

            let mut attempt = 0u32;
            let outcome = loop {
                if self.cancel.is_cancelled() {
                    break Err(anyhow::anyhow!("cancelled after {} attempt(s)", attempt));
                }
                self.emit(ProgressEvent::StepStarted {
                    step_id: step.id.clone(),
                    attempt: attempt + 1,
                });
                telemetry.attempts += 1;
                record.attempts = attempt + 1;

                match self.execute(plan, step, &files, &mut telemetry).await {
                    Ok(success) => break Ok(success),
                    Err(AttemptError::Fatal(e)) => break Err(e),
                    Err(AttemptError::Retryable(e)) => {
                        if attempt >= self.settings.max_retries_per_step {
                            break Err(e);
                        }
                        let delay = self.settings.backoff(attempt);
                        tracing::warn!(
                            step = %step.id,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "step attempt failed; retrying"
                        );
                        self.emit(ProgressEvent::StepRetrying {
                            step_id: step.id.clone(),
                            attempt: attempt + 1,
                            delay,
                            error: e.to_string(),
                        });
                        telemetry.retries += 1;
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            };

            match outcome {
                Ok(success) => {
                    let path = normalize_path(&step.file_path);
                    match success.change {
                        FileChange::Upsert(content) => {
                            files.upsert(path.clone(), content);
                            touched.push(path);
                        }
                        FileChange::Remove => {
                            files.remove(&path);
                        }
                        FileChange::Unchanged => {}
                    }
                    operations.extend(success.operation);
                    record.notes = success.notes;
                    record.reflection = success.reflection;
                    record.status = StepStatus::Completed;
                    telemetry.steps_completed += 1;
                    tracing::info!(step = %step.id, attempts = record.attempts, "step completed");
                }
                Err(e) => {
                    record.status = StepStatus::Failed;
                    record.reason = Some(format!("{:#}", e));
                    telemetry.steps_failed += 1;
                    tracing::warn!(step = %step.id, attempts = record.attempts, error = %e, "step failed");
                }
            }
            record.finished_at = Some(Utc::now());
            self.finish(&mut statuses, &mut records, record);
        }

        touched.sort();
        touched.dedup();
        touched.retain(|p| files.contains(p));
        let consistency_issues = self.checker.check_touched(&files, &touched);
        for issue in &consistency_issues {
            tracing::warn!(issue = %issue, "cross-file inconsistency after run");
        }
        if !consistency_issues.is_empty() {
            tracing::warn!(
                run_id = %run_id,
                issues = consistency_issues.len(),
                "run batch rejected"
            );
        }

        self.lifetime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .absorb(&telemetry);
        self.emit(ProgressEvent::RunFinished { telemetry });
        tracing::info!(
            run_id = %run_id,
            completed = telemetry.steps_completed,
            failed = telemetry.steps_failed,
            skipped = telemetry.steps_skipped,
            "orchestration run finished"
        );

        Ok(RunReport {
            run_id,
            records,
            operations,
            files,
            consistency_issues,
            telemetry,
            cancelled: self.cancel.is_cancelled(),
        })
    }

    fn finish(
        &self,
        statuses: &mut HashMap<String, StepStatus>,
        records: &mut Vec<StepRecord>,
        record: StepRecord,
    ) {
        statuses.insert(record.step_id.clone(), record.status);
        self.emit(ProgressEvent::StepFinished {
            step_id: record.step_id.clone(),
            status: record.status,
            reason: record.reason.clone(),
        });
        records.push(record);
    }

    async fn execute(
        &self,
        plan: &Plan,
        step: &Step,
        files: &FileSet,
        telemetry: &mut RunTelemetry,
    ) -> Result<StepSuccess, AttemptError> {
        let path = normalize_path(&step.file_path);
        match step.action_type {
            ActionType::Modify => {
                let current = files
                    .get(&path)
                    .ok_or_else(|| fatal(format!("{} does not exist", path)))?;
                self.generate_and_reflect(plan, step, &path, current, files, telemetry)
                    .await
                    .map(|(patch, content, report)| StepSuccess {
                        operation: Some(FileOperation {
                            kind: FileOpKind::Modify,
                            file_path: path.clone(),
                            content: Some(content.clone()),
                            diff: Some(patch::to_unified_diff(&patch)),
                            explanation: explanation(&patch, step),
                        }),
                        change: FileChange::Upsert(content),
                        notes: Vec::new(),
                        reflection: Some(report),
                    })
            }
            ActionType::Create => {
                if files.contains(&path) {
                    return Err(fatal(format!("{} already exists", path)));
                }
                self.generate_and_reflect(plan, step, &path, "", files, telemetry)
                    .await
                    .map(|(patch, content, report)| StepSuccess {
                        operation: Some(FileOperation {
                            kind: FileOpKind::Create,
                            file_path: path.clone(),
                            content: Some(content.clone()),
                            diff: None,
                            explanation: explanation(&patch, step),
                        }),
                        change: FileChange::Upsert(content),
                        notes: Vec::new(),
                        reflection: Some(report),
                    })
            }
            ActionType::Delete => {
                if !files.contains(&path) {
                    return Err(fatal(format!("{} does not exist", path)));
                }
                let graph = DependencyGraph::build(files, self.checker.resolver());
                let importers = graph.dependents_of(&path);
                if !importers.is_empty() {
                    return Err(fatal(format!(
                        "{} is still imported by {}",
                        path,
                        importers.join(", ")
                    )));
                }
                Ok(StepSuccess {
                    change: FileChange::Remove,
                    operation: Some(FileOperation {
                        kind: FileOpKind::Delete,
                        file_path: path,
                        content: None,
                        diff: None,
                        explanation: step.description.clone(),
                    }),
                    notes: Vec::new(),
                    reflection: None,
                })
            }
            ActionType::Inspect => {
                let content = files
                    .get(&path)
                    .ok_or_else(|| fatal(format!("{} does not exist", path)))?;
                Ok(self.inspect(step, &path, content, files))
            }
        }
    }

    /// Generate, apply and reflect-and-fix one patch. Returns the accepted
    /// patch, the resulting content and the last reflection report.
    async fn generate_and_reflect(
        &self,
        plan: &Plan,
        step: &Step,
        path: &str,
        current: &str,
        files: &FileSet,
        telemetry: &mut RunTelemetry,
    ) -> Result<(Patch, String, ReflectionReport), AttemptError> {
        let request = PatchRequest {
            file_path: path.to_string(),
            content: current.to_string(),
            change_description: step.description.clone(),
            line_hints: step.line_hints.clone(),
            symbol_hints: step.symbol_hints.clone(),
        };
        let patch = self
            .generator
            .generate_patch(&request)
            .await
            .map_err(|e| AttemptError::Retryable(e.into()))?;
        if patch.file_path != path {
            return Err(retryable(format!(
                "generator patched {} instead of {}",
                patch.file_path, path
            )));
        }

        let verification = patch::verify(&patch, current);
        if !verification.valid {
            tracing::debug!(step = %step.id, issues = ?verification.issues, "patch failed verification; trying fuzzy apply");
        }
        for suggestion in &verification.suggestions {
            tracing::debug!(step = %step.id, suggestion = %suggestion, "verification suggestion");
        }

        let applied = patch::apply(&patch, current);
        telemetry.hunks_applied += applied.hunks_applied as u64;
        telemetry.hunks_failed += applied.hunks_failed as u64;
        if !applied.success {
            return Err(retryable(format!(
                "{} of {} hunk(s) failed to apply: {}",
                applied.hunks_failed,
                patch.hunks.len(),
                applied.errors.join("; ")
            )));
        }

        let objective = if plan.objective.is_empty() {
            step.description.clone()
        } else {
            format!("{}\n\nThis step: {}", plan.objective, step.description)
        };
        let ctx = ReflectionContext {
            objective: &objective,
            file_path: path,
            original: current,
            patched: &applied.new_content,
            patch: &patch,
            all_files: files,
        };
        let outcome = self
            .reflection
            .reflect_and_fix(&ctx, self.settings.reflection.max_iterations)
            .await;
        telemetry.reflection_rounds += outcome.iterations as u64;
        telemetry.fixes_requested += outcome.fixes_requested as u64;

        let blocking: Vec<String> = outcome
            .report
            .revision_targets()
            .into_iter()
            .filter(|i| i.severity == crate::reflection::Severity::Error)
            .map(|i| i.to_string())
            .collect();
        if !blocking.is_empty() {
            return Err(retryable(format!(
                "reflection left {} blocking issue(s) after {} round(s): {}",
                blocking.len(),
                outcome.iterations,
                blocking.join("; ")
            )));
        }

        Ok((outcome.patch, outcome.patched, outcome.report))
    }

    fn inspect(&self, step: &Step, path: &str, content: &str, files: &FileSet) -> StepSuccess {
        let unchanged = Patch::new(path, step.description.clone(), Vec::new());
        let ctx = ReflectionContext {
            objective: &step.description,
            file_path: path,
            original: content,
            patched: content,
            patch: &unchanged,
            all_files: files,
        };
        let report = self.reflection.reflect_local(&ctx);
        let mut notes: Vec<String> = report.issues.iter().map(|i| i.to_string()).collect();

        let lines = patch::line_count(content);
        if lines > self.settings.long_file_lines {
            notes.push(format!(
                "{} has {} lines (threshold {}); consider splitting it",
                path, lines, self.settings.long_file_lines
            ));
        }
        let graph = DependencyGraph::build(files, self.checker.resolver());
        for cycle in graph.find_cycles() {
            if cycle.iter().any(|p| p == path) {
                notes.push(format!("import cycle: {}", cycle.join(" -> ")));
            }
        }

        StepSuccess {
            change: FileChange::Unchanged,
            operation: None,
            notes,
            reflection: Some(report),
        }
    }
}

fn explanation(patch: &Patch, step: &Step) -> String {
    if patch.description.trim().is_empty() {
        step.description.clone()
    } else {
        patch.description.clone()
    }
}

/// Reason a step cannot run yet, if any. A failed `inspect` dependency does
/// not block its dependents.
fn unmet_dependency(
    step: &Step,
    statuses: &HashMap<String, StepStatus>,
    actions: &HashMap<&str, ActionType>,
) -> Option<String> {
    step.dependencies.iter().find_map(|dep| {
        let status = statuses.get(dep).copied().unwrap_or(StepStatus::Pending);
        let satisfied = status == StepStatus::Completed
            || (status == StepStatus::Failed && actions.get(dep.as_str()) == Some(&ActionType::Inspect));
        (!satisfied).then(|| {
            format!(
                "dependency '{}' did not complete ({})",
                dep,
                status_label(status)
            )
        })
    })
}

fn status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::InProgress => "in progress",
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
    }
}

/// Validate the plan and order it: a step runs only after all of its
/// dependencies. Among ready steps, higher priority first, then plan order.
pub fn execution_order(steps: &[Step]) -> Result<Vec<&Step>, OrchestrationError> {
    let mut ids = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(OrchestrationError::InvalidPlan("step with empty id".into()));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(OrchestrationError::InvalidPlan(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }
    for step in steps {
        for dep in &step.dependencies {
            if dep == &step.id {
                return Err(OrchestrationError::InvalidPlan(format!(
                    "step '{}' depends on itself",
                    step.id
                )));
            }
            if !ids.contains(dep.as_str()) {
                return Err(OrchestrationError::InvalidPlan(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    let mut done: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(steps.len());
    while order.len() < steps.len() {
        let next = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| !done.contains(s.id.as_str()))
            .filter(|(_, s)| s.dependencies.iter().all(|d| done.contains(d.as_str())))
            .min_by_key(|(idx, s)| (std::cmp::Reverse(s.priority), *idx))
            .map(|(_, s)| s);
        let Some(step) = next else {
            let stuck: Vec<&str> = steps
                .iter()
                .filter(|s| !done.contains(s.id.as_str()))
                .map(|s| s.id.as_str())
                .collect();
            return Err(OrchestrationError::InvalidPlan(format!(
                "dependency cycle among steps: {}",
                stuck.join(", ")
            )));
        };
        done.insert(step.id.as_str());
        order.push(step);
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str], priority: i32) -> Step {
        Step {
            id: id.to_string(),
            file_path: format!("{}.ts", id),
            description: format!("do {}", id),
            action_type: ActionType::Modify,
            priority,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            line_hints: Vec::new(),
            symbol_hints: Vec::new(),
        }
    }

    fn ids(order: &[&Step]) -> Vec<String> {
        order.iter().map(|s| s.id.clone()).collect()
    }

    #[test]
    fn test_order_respects_dependencies_then_priority() {
        let steps = vec![
            step("a", &["c"], 0),
            step("b", &[], 0),
            step("c", &[], 0),
            step("d", &[], 5),
        ];
        let order = execution_order(&steps).unwrap();
        assert_eq!(ids(&order), vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn test_invalid_plans() {
        let dup = vec![step("a", &[], 0), step("a", &[], 0)];
        let unknown = vec![step("a", &["zz"], 0)];
        let cyclic = vec![step("a", &["b"], 0), step("b", &["a"], 0)];
        let selfdep = vec![step("a", &["a"], 0)];
        for plan in [dup, unknown, cyclic, selfdep] {
            assert!(matches!(
                execution_order(&plan),
                Err(OrchestrationError::InvalidPlan(_))
            ));
        }
    }

    #[test]
    fn test_failed_inspect_dependency_is_satisfied() {
        let s = step("b", &["a"], 0);
        let statuses = HashMap::from([("a".to_string(), StepStatus::Failed)]);
        let inspect = HashMap::from([("a", ActionType::Inspect)]);
        assert!(unmet_dependency(&s, &statuses, &inspect).is_none());

        let modify = HashMap::from([("a", ActionType::Modify)]);
        let reason = unmet_dependency(&s, &statuses, &modify).unwrap();
        assert_eq!(reason, "dependency 'a' did not complete (failed)");
    }

    #[test]
    fn test_backoff_doubles() {
        let settings = OrchestratorSettings {
            backoff_base: Duration::from_millis(10),
            ..OrchestratorSettings::default()
        };
        assert_eq!(settings.backoff(0), Duration::from_millis(10));
        assert_eq!(settings.backoff(3), Duration::from_millis(80));
    }

    #[test]
    fn test_plan_formats() {
        let toml = r#"
objective = "rename"

[[steps]]
id = "s1"
file_path = "src/a.ts"
description = "rename foo"
action_type = "modify"

[[steps]]
id = "s2"
file_path = "src/b.ts"
description = "check"
action_type = "inspect"
dependencies = ["s1"]
"#;
        let plan = Plan::from_toml(toml).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].action_type, ActionType::Inspect);

        let json = serde_json::to_string(&plan).unwrap();
        assert_eq!(Plan::from_json(&json).unwrap(), plan);
        assert!(matches!(Plan::from_json("{"), Err(PlanError::Json(_))));
    }
}
