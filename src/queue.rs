//! Priority job queue with a bounded worker pool
//!
//! Jobs run highest priority first, FIFO within a priority. A failed job is
//! put back at the front of its priority with a not-before delay that doubles
//! per retry, until `max_retries` is exhausted. Registries live behind a
//! `std::sync::Mutex` that is never held across an await; idle workers park
//! on a `Notify`.

use crate::config::Config;
use crate::util::CancelFlag;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    #[serde(default)]
    pub child_job_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Handed to a job's handler on every attempt
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub name: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Set when the job is cancelled while running; handlers should check it
    pub cancel: CancelFlag,
}

pub type JobHandler =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`JobHandler`]
pub fn job_handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Parameters for a new job
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub name: String,
    pub priority: i32,
    /// Defaults to the queue's setting
    pub max_retries: Option<u32>,
    pub parent_job_id: Option<String>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("job {id} is {status:?}; cannot {action}")]
    InvalidTransition {
        id: String,
        status: JobStatus,
        action: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub max_concurrent_jobs: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.queue.max_concurrent_jobs.max(1),
            max_retries: config.queue.max_retries,
            backoff_base: Duration::from_millis(config.queue.backoff_base_ms),
        }
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry_count.min(16)))
    }
}

struct Entry {
    job: Job,
    handler: JobHandler,
    cancel: CancelFlag,
    not_before: Option<Instant>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Runnable job ids in scheduling order
    queued: Vec<String>,
    /// Submission order, for listing
    order: Vec<String>,
    running: usize,
}

impl State {
    fn priority_of(&self, id: &str) -> i32 {
        self.entries.get(id).map(|e| e.job.priority).unwrap_or(i32::MIN)
    }

    /// Queue `id` behind (or, with `front`, ahead of) jobs of equal priority
    fn insert_queued(&mut self, id: String, front: bool) {
        let priority = self.priority_of(&id);
        let pos = self
            .queued
            .iter()
            .position(|other| {
                let p = self.priority_of(other);
                if front {
                    p <= priority
                } else {
                    p < priority
                }
            })
            .unwrap_or(self.queued.len());
        self.queued.insert(pos, id);
    }
}

enum Next {
    Run(String, JobHandler, JobContext),
    WaitUntil(Instant),
    Wait,
    Idle,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    settings: QueueSettings,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    pub fn enqueue(&self, name: impl Into<String>, priority: i32, handler: JobHandler) -> String {
        let spec = JobSpec::new(name, priority);
        // Without a parent there is nothing to look up, so this cannot fail
        self.submit(spec, handler).unwrap_or_default()
    }

    /// Enqueue a job linked to `parent_id`. The link is bookkeeping only.
    pub fn enqueue_child(
        &self,
        parent_id: &str,
        name: impl Into<String>,
        priority: i32,
        handler: JobHandler,
    ) -> Result<String, QueueError> {
        let spec = JobSpec {
            parent_job_id: Some(parent_id.to_string()),
            ..JobSpec::new(name, priority)
        };
        self.submit(spec, handler)
    }

    pub fn submit(&self, spec: JobSpec, handler: JobHandler) -> Result<String, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        {
            let mut state = self.inner.lock();
            if let Some(parent) = &spec.parent_job_id {
                let parent_entry = state
                    .entries
                    .get_mut(parent)
                    .ok_or_else(|| QueueError::UnknownJob(parent.clone()))?;
                parent_entry.job.child_job_ids.push(id.clone());
            }
            let job = Job {
                id: id.clone(),
                name: spec.name,
                status: JobStatus::Queued,
                priority: spec.priority,
                retry_count: 0,
                max_retries: spec.max_retries.unwrap_or(self.inner.settings.max_retries),
                parent_job_id: spec.parent_job_id,
                child_job_ids: Vec::new(),
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            tracing::debug!(job = %id, name = %job.name, priority = job.priority, "job queued");
            state.entries.insert(
                id.clone(),
                Entry {
                    job,
                    handler,
                    cancel: CancelFlag::new(),
                    not_before: None,
                },
            );
            state.order.push(id.clone());
            state.insert_queued(id.clone(), false);
        }
        self.inner.notify.notify_waiters();
        Ok(id)
    }

    /// Cancel a job. A queued or paused job is cancelled immediately; a
    /// running job is flagged and its outcome ignored once the handler returns.
    pub fn cancel(&self, id: &str) -> Result<JobStatus, QueueError> {
        let mut state = self.inner.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| QueueError::UnknownJob(id.to_string()))?;
        match entry.job.status {
            JobStatus::Queued | JobStatus::Paused => {
                entry.job.status = JobStatus::Cancelled;
                entry.job.updated_at = Utc::now();
                state.queued.retain(|q| q != id);
                tracing::info!(job = %id, "job cancelled");
                Ok(JobStatus::Cancelled)
            }
            JobStatus::Running => {
                entry.cancel.cancel();
                tracing::info!(job = %id, "cancellation requested for running job");
                Ok(JobStatus::Running)
            }
            status => Err(QueueError::InvalidTransition {
                id: id.to_string(),
                status,
                action: "cancel",
            }),
        }
    }

    /// Hold a queued job out of scheduling
    pub fn pause(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| QueueError::UnknownJob(id.to_string()))?;
        if entry.job.status != JobStatus::Queued {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                status: entry.job.status,
                action: "pause",
            });
        }
        entry.job.status = JobStatus::Paused;
        entry.job.updated_at = Utc::now();
        state.queued.retain(|q| q != id);
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<(), QueueError> {
        {
            let mut state = self.inner.lock();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| QueueError::UnknownJob(id.to_string()))?;
            if entry.job.status != JobStatus::Paused {
                return Err(QueueError::InvalidTransition {
                    id: id.to_string(),
                    status: entry.job.status,
                    action: "resume",
                });
            }
            entry.job.status = JobStatus::Queued;
            entry.job.updated_at = Utc::now();
            state.insert_queued(id.to_string(), false);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.inner.lock().entries.get(id).map(|e| e.job.clone())
    }

    /// Every job, in submission order
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.inner.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id).map(|e| e.job.clone()))
            .collect()
    }

    /// Run workers until nothing runnable is left. Paused jobs do not keep
    /// the pool alive; jobs waiting out a retry delay do.
    pub async fn run_until_idle(&self) {
        let workers = self.inner.settings.max_concurrent_jobs.max(1);
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { worker_loop(inner, worker).await })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "queue worker terminated abnormally");
            }
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize) {
    loop {
        // Registered before inspecting state so a wakeup in between is not lost
        let notified = inner.notify.notified();
        let next = next_job(&inner);
        match next {
            Next::Run(id, handler, ctx) => {
                tracing::debug!(worker, job = %id, attempt = ctx.attempt, "job started");
                let cancel = ctx.cancel.clone();
                let result = match tokio::spawn(handler(ctx)).await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("job panicked: {}", e)),
                };
                finish_job(&inner, &id, &cancel, result);
                inner.notify.notify_waiters();
            }
            Next::WaitUntil(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = notified => {}
                }
            }
            Next::Wait => notified.await,
            Next::Idle => {
                inner.notify.notify_waiters();
                return;
            }
        }
    }
}

fn next_job(inner: &Inner) -> Next {
    let mut state = inner.lock();
    let now = Instant::now();

    let ready = state.queued.iter().position(|id| {
        state
            .entries
            .get(id)
            .is_some_and(|e| e.not_before.is_none_or(|t| t <= now))
    });
    if let Some(pos) = ready {
        let id = state.queued.remove(pos);
        state.running += 1;
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.job.status = JobStatus::Running;
            entry.job.updated_at = Utc::now();
            entry.not_before = None;
            let ctx = JobContext {
                job_id: id.clone(),
                name: entry.job.name.clone(),
                attempt: entry.job.retry_count + 1,
                cancel: entry.cancel.clone(),
            };
            return Next::Run(id, Arc::clone(&entry.handler), ctx);
        }
        state.running -= 1;
        return Next::Wait;
    }

    let earliest = state
        .queued
        .iter()
        .filter_map(|id| state.entries.get(id).and_then(|e| e.not_before))
        .min();
    match earliest {
        Some(deadline) => Next::WaitUntil(deadline),
        None if state.running > 0 => Next::Wait,
        None => Next::Idle,
    }
}

fn finish_job(inner: &Inner, id: &str, cancel: &CancelFlag, result: anyhow::Result<()>) {
    let mut state = inner.lock();
    state.running = state.running.saturating_sub(1);
    let Some(entry) = state.entries.get_mut(id) else {
        return;
    };
    entry.job.updated_at = Utc::now();

    if cancel.is_cancelled() {
        entry.job.status = JobStatus::Cancelled;
        if let Err(e) = result {
            entry.job.last_error = Some(format!("{:#}", e));
        }
        tracing::info!(job = %id, "running job observed cancellation");
        return;
    }

    match result {
        Ok(()) => {
            entry.job.status = JobStatus::Completed;
            tracing::info!(job = %id, name = %entry.job.name, "job completed");
        }
        Err(e) => {
            let message = format!("{:#}", e);
            entry.job.last_error = Some(message.clone());
            if entry.job.retry_count < entry.job.max_retries {
                let delay = inner.settings.backoff(entry.job.retry_count);
                entry.job.retry_count += 1;
                entry.job.status = JobStatus::Queued;
                entry.not_before = Some(Instant::now() + delay);
                tracing::warn!(
                    job = %id,
                    retry = entry.job.retry_count,
                    max = entry.job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "job failed; re-queued"
                );
                state.insert_queued(id.to_string(), true);
            } else {
                entry.job.status = JobStatus::Failed;
                tracing::warn!(job = %id, retries = entry.job.retry_count, error = %message, "job failed permanently");
            }
        }
    }
}
