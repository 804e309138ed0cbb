use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use patchloom::config::Config;
use patchloom::consistency::ConsistencyChecker;
use patchloom::files::FileSet;
use patchloom::generate::{OfflineGenerator, OpenRouterGenerator, PatchGenerator};
use patchloom::graph::DependencyGraph;
use patchloom::orchestrator::{
    FileOpKind, Orchestrator, OrchestratorSettings, Plan, ProgressEvent, RunReport, StepStatus,
};
use patchloom::patch::{self, Patch};
use patchloom::queue::{job_handler, JobQueue, JobSpec, JobStatus, QueueSettings};
use patchloom::reflection::{ReflectionContext, ReflectionEngine};
use patchloom::tracing_setup::{init_subscriber, Verbosity};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};

#[derive(Parser, Debug)]
#[command(
    name = "patchloom",
    about = "Verify, apply, reflect on and orchestrate generated source patches",
    version
)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,
    #[arg(long, global = true)]
    no_color: bool,
    /// Config file (defaults to ~/.config/patchloom/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that a unified diff can be applied
    Verify(PatchArgs),
    /// Apply a unified diff
    Apply(ApplyArgs),
    /// Import graph: cycles and long files
    Graph(GraphArgs),
    /// Cross-file export/import consistency of a diff
    Check(PatchArgs),
    /// Run the local reflection passes over a diff
    Reflect(ReflectArgs),
    /// Execute plan files through the job queue
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct PatchArgs {
    /// Unified diff file; may cover several files
    patch: PathBuf,
    /// Project root the diff paths are relative to
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    #[command(flatten)]
    target: PatchArgs,
    /// Write results to disk instead of printing them
    #[arg(long)]
    write: bool,
    /// Save a diff that undoes the applied changes
    #[arg(long)]
    rollback_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GraphArgs {
    #[arg(default_value = ".")]
    root: PathBuf,
    /// Line count above which a file is reported as long
    #[arg(long)]
    long_lines: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ReflectArgs {
    #[command(flatten)]
    target: PatchArgs,
    /// What the change is meant to achieve
    #[arg(long, default_value = "")]
    objective: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Plan files (.json or .toml); each runs as one job
    #[arg(required = true)]
    plans: Vec<PathBuf>,
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Write the resulting file operations to disk
    #[arg(long)]
    write: bool,
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(Verbosity::from_flags(cli.verbose, cli.quiet), cli.no_color);

    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(path);
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
        None => Config::load(),
    };
    tracing::debug!(location = %Config::config_location(), "config loaded");

    match cli.command {
        Commands::Verify(args) => run_verify(args),
        Commands::Apply(args) => run_apply(args),
        Commands::Graph(args) => run_graph(args, &config),
        Commands::Check(args) => run_check(args, &config),
        Commands::Reflect(args) => run_reflect(args, &config),
        Commands::Run(args) => run_plans(args, &config).await,
    }
}

fn load_patches(path: &Path) -> Result<Vec<Patch>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    patch::from_unified_diff_multi(&text)
        .with_context(|| format!("failed to parse {}", path.display()))
}

/// Current content of a patch target; a missing file reads as empty
fn read_target(root: &Path, file_path: &str) -> Result<String> {
    let path = root.join(file_path);
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_verify(args: PatchArgs) -> Result<()> {
    let patches = load_patches(&args.patch)?;
    let mut all_valid = true;
    let mut results = Vec::new();
    for p in &patches {
        let content = read_target(&args.root, &p.file_path)?;
        let result = patch::verify(p, &content);
        all_valid &= result.valid;
        if !args.json {
            let mark = if result.valid { "ok" } else { "FAIL" };
            println!("{} {}", mark, p.file_path);
            for issue in &result.issues {
                println!("    {}", issue);
            }
            for suggestion in &result.suggestions {
                println!("    hint: {}", suggestion);
            }
        }
        results.push((p.file_path.clone(), result));
    }
    if args.json {
        print_json(&results)?;
    }
    if !all_valid {
        bail!("patch does not apply cleanly");
    }
    Ok(())
}

fn run_apply(args: ApplyArgs) -> Result<()> {
    let patches = load_patches(&args.target.patch)?;
    let mut outputs = Vec::new();
    let mut rollbacks = String::new();

    // Nothing is written unless every patch applies
    for p in &patches {
        let content = read_target(&args.target.root, &p.file_path)?;
        let result = patch::apply(p, &content);
        if !result.success {
            for error in &result.errors {
                eprintln!("{}: {}", p.file_path, error);
            }
            bail!(
                "{}: {} of {} hunks failed",
                p.file_path,
                result.hunks_failed,
                p.hunks.len()
            );
        }
        rollbacks.push_str(&patch::to_unified_diff(&patch::create_rollback_patch(p)));
        outputs.push((p.file_path.clone(), result));
    }

    for (file_path, result) in &outputs {
        if args.write {
            let path = args.target.root.join(file_path);
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&path, &result.new_content)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("applied {} ({} hunks)", file_path, result.hunks_applied);
        } else if args.target.json {
            continue;
        } else {
            println!("=== {} ===", file_path);
            print!("{}", result.new_content);
        }
    }
    if args.target.json {
        print_json(&outputs)?;
    }

    if let Some(out) = &args.rollback_out {
        std::fs::write(out, rollbacks)
            .with_context(|| format!("failed to write {}", out.display()))?;
        tracing::info!(path = %out.display(), "rollback diff saved");
    }
    Ok(())
}

fn run_graph(args: GraphArgs, config: &Config) -> Result<()> {
    let files = FileSet::load_dir(&args.root)?;
    let graph = DependencyGraph::build(&files, &config.resolver.resolver());
    let threshold = args.long_lines.unwrap_or(config.reflection.long_file_lines);
    let cycles = graph.find_cycles();
    let long_files = graph.long_files(threshold);

    if args.json {
        return print_json(&serde_json::json!({
            "files": files.len(),
            "edges": graph.edge_count(),
            "cycles": cycles,
            "long_files": long_files,
        }));
    }

    println!("{} files, {} import edges", files.len(), graph.edge_count());
    if cycles.is_empty() {
        println!("no circular imports");
    }
    for cycle in &cycles {
        let mut ring = cycle.clone();
        if let Some(first) = cycle.first() {
            ring.push(first.clone());
        }
        println!("cycle: {}", ring.join(" -> "));
    }
    for long in &long_files {
        println!("long: {} ({} lines > {})", long.path, long.lines, long.threshold);
    }
    Ok(())
}

fn run_check(args: PatchArgs, config: &Config) -> Result<()> {
    let patches = load_patches(&args.patch)?;
    let files = FileSet::load_dir(&args.root)?;
    let checker = ConsistencyChecker::new(config.resolver.resolver());
    let report = checker.check_batch(&patches, &files);

    if args.json {
        print_json(&serde_json::json!({
            "consistent": report.is_consistent(),
            "issues": report.issues,
            "apply_failures": report.apply_failures,
        }))?;
    } else {
        for failure in &report.apply_failures {
            println!("unappliable: {} ({})", failure.file_path, failure.errors.join("; "));
        }
        for issue in &report.issues {
            println!("{}", issue);
        }
        if report.is_consistent() {
            println!("consistent: {} patches", patches.len());
        }
    }
    report.into_result()?;
    Ok(())
}

fn run_reflect(args: ReflectArgs, config: &Config) -> Result<()> {
    let patches = load_patches(&args.target.patch)?;
    let files = FileSet::load_dir(&args.target.root)?;
    let checker = Arc::new(ConsistencyChecker::new(config.resolver.resolver()));
    let engine = ReflectionEngine::new(
        Arc::new(OfflineGenerator),
        checker,
        config.reflection.settings(),
    );

    let mut reports = Vec::new();
    for p in &patches {
        let original = files.get(&p.file_path).unwrap_or_default().to_string();
        let applied = patch::apply(p, &original);
        if !applied.success {
            bail!("{}: {}", p.file_path, applied.errors.join("; "));
        }
        let ctx = ReflectionContext {
            objective: &args.objective,
            file_path: &p.file_path,
            original: &original,
            patched: &applied.new_content,
            patch: p,
            all_files: &files,
        };
        let report = engine.reflect_local(&ctx);
        if !args.target.json {
            let verdict = if report.passed { "passed" } else { "needs revision" };
            println!("{}: score {} ({})", p.file_path, report.score, verdict);
            for issue in &report.issues {
                println!("  {}", issue);
            }
        }
        reports.push((p.file_path.clone(), report));
    }
    if args.target.json {
        print_json(&reports)?;
    }
    Ok(())
}

async fn run_plans(args: RunArgs, config: &Config) -> Result<()> {
    let generator: Arc<dyn PatchGenerator> = Arc::new(OpenRouterGenerator::from_config(config)?);
    let checker = Arc::new(ConsistencyChecker::new(config.resolver.resolver()));
    let settings = OrchestratorSettings::from_config(config);
    let root = args.root.clone();

    let (tx, rx) = mpsc::channel::<ProgressEvent>();
    let progress = std::thread::spawn(move || {
        for event in rx {
            match event {
                ProgressEvent::StepStarted { step_id, attempt } => {
                    eprintln!("[{}] attempt {}", step_id, attempt)
                }
                ProgressEvent::StepRetrying { step_id, delay, error, .. } => {
                    eprintln!("[{}] retrying in {:?}: {}", step_id, delay, error)
                }
                ProgressEvent::StepFinished { step_id, status, reason } => match reason {
                    Some(reason) => eprintln!("[{}] {:?}: {}", step_id, status, reason),
                    None => eprintln!("[{}] {:?}", step_id, status),
                },
                ProgressEvent::RunFinished { .. } => {}
            }
        }
    });

    let queue = JobQueue::new(QueueSettings::from_config(config));
    let reports: Arc<Mutex<Vec<(PathBuf, RunReport)>>> = Arc::new(Mutex::new(Vec::new()));

    for plan_path in &args.plans {
        let plan = Plan::load(plan_path)?;
        let orchestrator = Arc::new(
            Orchestrator::new(Arc::clone(&generator), Arc::clone(&checker), settings.clone())
                .with_progress(tx.clone()),
        );
        let plan = Arc::new(plan);
        let root = root.clone();
        let plan_path = plan_path.clone();
        let reports = Arc::clone(&reports);
        let name = plan_path.display().to_string();

        let handler = job_handler(move |_ctx| {
            let orchestrator = Arc::clone(&orchestrator);
            let plan = Arc::clone(&plan);
            let root = root.clone();
            let plan_path = plan_path.clone();
            let reports = Arc::clone(&reports);
            async move {
                let files = FileSet::load_dir(&root)?;
                let report = orchestrator.run(&plan, files).await?;
                reports
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((plan_path, report));
                Ok::<(), anyhow::Error>(())
            }
        });
        // Plans never retry as a whole; steps retry inside the run
        queue.submit(
            JobSpec {
                max_retries: Some(0),
                ..JobSpec::new(name, 0)
            },
            handler,
        )?;
    }
    drop(tx);

    queue.run_until_idle().await;
    let _ = progress.join();

    for job in queue.jobs() {
        if job.status == JobStatus::Failed {
            eprintln!(
                "{} failed: {}",
                job.name,
                job.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    let reports = std::mem::take(&mut *reports.lock().unwrap_or_else(|e| e.into_inner()));
    let mut failed_steps = 0;
    let mut rejected_plans = 0;
    for (plan_path, report) in &reports {
        failed_steps += report
            .records
            .iter()
            .filter(|r| r.status != StepStatus::Completed)
            .count();
        if args.json {
            print_json(&serde_json::json!({
                "plan": plan_path.display().to_string(),
                "run_id": report.run_id,
                "records": report.records,
                "operations": report.operations,
                "consistency_issues": report.consistency_issues,
                "rejected": !report.is_consistent(),
                "telemetry": report.telemetry,
                "cancelled": report.cancelled,
            }))?;
        } else {
            print_summary(plan_path, report);
        }
        if let Err(e) = report.ensure_consistent() {
            rejected_plans += 1;
            eprintln!("{}: {}; nothing written", plan_path.display(), e);
            continue;
        }
        if args.write {
            write_operations(&args.root, report)?;
        }
    }

    if rejected_plans > 0 {
        bail!("{} plan(s) rejected by the cross-file consistency check", rejected_plans);
    }
    if failed_steps > 0 {
        bail!("{} steps did not complete", failed_steps);
    }
    Ok(())
}

fn print_summary(plan_path: &Path, report: &RunReport) {
    println!("plan {} (run {})", plan_path.display(), report.run_id);
    for record in &report.records {
        let reason = record.reason.as_deref().unwrap_or("");
        println!("  {:<12} {:?} {}", record.step_id, record.status, reason);
    }
    for op in &report.operations {
        println!("  {:?} {}: {}", op.kind, op.file_path, op.explanation);
    }
    for issue in &report.consistency_issues {
        println!("  consistency: {}", issue);
    }
    let t = &report.telemetry;
    println!(
        "  {} completed, {} failed, {} skipped; {} retries, {} reflection rounds",
        t.steps_completed, t.steps_failed, t.steps_skipped, t.retries, t.reflection_rounds
    );
}

/// Write a consistent run's operations under `root`
fn write_operations(root: &Path, report: &RunReport) -> Result<()> {
    report.ensure_consistent()?;
    for op in &report.operations {
        let path = root.join(&op.file_path);
        match op.kind {
            FileOpKind::Create | FileOpKind::Modify => {
                let Some(content) = report.files.get(&op.file_path) else {
                    continue;
                };
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(&path, content)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
            FileOpKind::Delete => {
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("failed to delete {}", path.display()))?;
                }
            }
        }
        tracing::info!(file = %op.file_path, kind = ?op.kind, "written");
    }
    Ok(())
}
