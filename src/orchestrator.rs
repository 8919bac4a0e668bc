//! # Batch orchestrator
//! Fans one request out into per-source tasks.
//!
//! - Circuit-open sources are marked `skipped` before anything is spawned.
//! - Dispatched tasks share one fetch pool (`max_concurrent_sources` permits)
//!   across every batch run by this orchestrator.
//! - Every task runs under a per-task timeout that covers all of its retries.
//! - A batch deadline cancels whatever is still in flight; the batch still
//!   completes with the results gathered so far.
//!
//! The orchestrator never returns an error for source failures; the task map
//! of the returned [`Batch`] encodes what happened.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BatchError, SourceError};
use crate::health::{Admission, HealthTracker};
use crate::model::{Batch, RawItem, SourceId, TaskStatus};
use crate::retry::{retry_with, RetryPolicy};
use crate::sources::{DynSourceAdapter, SourceRegistry};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "orchestrator_tasks_total",
            "Source tasks reaching a terminal state, by status."
        );
        describe_counter!(
            "orchestrator_items_total",
            "Raw items returned by successful source tasks."
        );
        describe_histogram!(
            "orchestrator_batch_ms",
            "Wall time of the fetch phase of a batch in milliseconds."
        );
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_sources: usize,
    pub per_task_timeout_ms: u64,
    /// Used when a request does not carry its own batch timeout.
    pub default_batch_timeout_ms: u64,
    pub health_probe_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: 4,
            per_task_timeout_ms: 120_000,
            default_batch_timeout_ms: 300_000,
            health_probe_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn sanitized(mut self) -> Self {
        self.max_concurrent_sources = self.max_concurrent_sources.max(1);
        self.per_task_timeout_ms = self.per_task_timeout_ms.max(1);
        self.default_batch_timeout_ms = self.default_batch_timeout_ms.max(1);
        self.health_probe_timeout_ms = self.health_probe_timeout_ms.max(1);
        self.retry = self.retry.sanitized();
        self
    }
}

/// A validated-on-prepare request for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    #[serde(default)]
    pub sources: Vec<SourceId>,
    pub keywords: Vec<String>,
    pub per_source_max_items: usize,
    /// Global batch timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Terminal batch plus the raw items gathered from successful sources.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub batch: Batch,
    pub items: Vec<RawItem>,
}

#[derive(Debug)]
enum TaskEvent {
    Started(SourceId),
    Attempt(SourceId, u32),
}

#[derive(Debug)]
struct TaskOutcome {
    source: SourceId,
    status: TaskStatus,
    attempts: u32,
    items: Vec<RawItem>,
    error: Option<String>,
    /// Ended by the batch token rather than by the source.
    cancelled: bool,
}

impl TaskOutcome {
    fn new(source: SourceId, status: TaskStatus, attempts: u32) -> Self {
        Self {
            source,
            status,
            attempts,
            items: Vec::new(),
            error: None,
            cancelled: false,
        }
    }

    fn with_error(mut self, err: impl Into<String>) -> Self {
        self.error = Some(err.into());
        self
    }

    fn cancelled(mut self) -> Self {
        self.cancelled = true;
        self
    }
}

/// Everything a spawned task needs, cloned per task.
#[derive(Clone)]
struct TaskCtx {
    health: Arc<HealthTracker>,
    pool: Arc<Semaphore>,
    cfg: OrchestratorConfig,
    keywords: Arc<Vec<String>>,
    max_items: usize,
    events: mpsc::UnboundedSender<TaskEvent>,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    registry: SourceRegistry,
    health: Arc<HealthTracker>,
    cfg: OrchestratorConfig,
    pool: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(registry: SourceRegistry, health: Arc<HealthTracker>, cfg: OrchestratorConfig) -> Self {
        let cfg = cfg.sanitized();
        Self {
            registry,
            health,
            pool: Arc::new(Semaphore::new(cfg.max_concurrent_sources)),
            cfg,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.cfg
    }

    /// Validate a request and build its pending batch. This is the only
    /// place a request can be rejected.
    pub fn prepare(&self, req: &FetchRequest) -> Result<Batch, BatchError> {
        let keywords: Vec<String> = req
            .keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(BatchError::EmptyKeywords);
        }
        if req.per_source_max_items == 0 {
            return Err(BatchError::InvalidMaxItems);
        }
        let sources = self.registry.resolve(&req.sources)?;
        Ok(Batch::new(&sources, keywords, req.per_source_max_items))
    }

    pub fn batch_timeout(&self, req: &FetchRequest) -> Duration {
        Duration::from_millis(
            req.timeout_ms
                .unwrap_or(self.cfg.default_batch_timeout_ms)
                .max(1),
        )
    }

    /// Synchronous variant: validate, run to completion, return the terminal batch.
    pub async fn run(&self, req: &FetchRequest) -> Result<FetchReport, BatchError> {
        let batch = self.prepare(req)?;
        let (tx, _rx) = watch::channel(batch.clone());
        Ok(self
            .run_observed(batch, self.batch_timeout(req), &tx, CancellationToken::new())
            .await)
    }

    /// Run a prepared batch, publishing a snapshot on every task transition.
    /// Cancelling `cancel` has the same effect as the batch deadline firing.
    pub async fn run_observed(
        &self,
        mut batch: Batch,
        batch_timeout: Duration,
        observer: &watch::Sender<Batch>,
        cancel: CancellationToken,
    ) -> FetchReport {
        ensure_metrics_described();
        let started = Instant::now();
        let deadline = started + batch_timeout;
        let cancel = cancel.child_token();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let ctx = TaskCtx {
            health: self.health.clone(),
            pool: self.pool.clone(),
            cfg: self.cfg,
            keywords: Arc::new(batch.keywords.clone()),
            max_items: batch.per_source_max_items,
            events: events_tx,
            cancel: cancel.clone(),
        };

        let order: Vec<SourceId> = batch.tasks.keys().cloned().collect();
        let mut trials: HashSet<SourceId> = HashSet::new();
        let mut per_source: BTreeMap<SourceId, Vec<RawItem>> = BTreeMap::new();
        let mut set: JoinSet<TaskOutcome> = JoinSet::new();

        for source in &order {
            let Some(adapter) = self.registry.get(source) else {
                finish_task(
                    &mut batch,
                    &mut per_source,
                    TaskOutcome::new(source.clone(), TaskStatus::Failed, 0)
                        .with_error("source not registered"),
                );
                continue;
            };
            match self.health.admit(source) {
                Admission::Rejected { retry_in } => {
                    tracing::info!(
                        target: "orchestrator",
                        batch = %batch.id,
                        source = %source,
                        retry_in_secs = retry_in.as_secs(),
                        "source circuit open, skipping"
                    );
                    finish_task(
                        &mut batch,
                        &mut per_source,
                        TaskOutcome::new(source.clone(), TaskStatus::Skipped, 0)
                            .with_error(SourceError::Unavailable { retry_in }.to_string()),
                    );
                }
                admission => {
                    let trial = admission == Admission::Trial;
                    if trial {
                        trials.insert(source.clone());
                    }
                    set.spawn(run_source_task(ctx.clone(), source.clone(), adapter, trial));
                }
            }
        }
        // Only spawned tasks hold senders now, so the channel closes with the last one.
        drop(ctx);
        observer.send_replace(batch.clone());

        let deadline_sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline_sleep);
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                Some(ev) = events_rx.recv() => {
                    apply_event(&mut batch, ev);
                    observer.send_replace(batch.clone());
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(mut outcome)) => {
                        if outcome.cancelled && outcome.error.is_none() {
                            outcome.error = Some(if deadline_hit {
                                "batch deadline exceeded".to_string()
                            } else {
                                "batch cancelled".to_string()
                            });
                        }
                        finish_task(&mut batch, &mut per_source, outcome);
                        observer.send_replace(batch.clone());
                    }
                    Some(Err(e)) => {
                        tracing::error!(target: "orchestrator", batch = %batch.id, error = %e, "source task aborted");
                    }
                },
                _ = &mut deadline_sleep, if !deadline_hit => {
                    deadline_hit = true;
                    tracing::warn!(
                        target: "orchestrator",
                        batch = %batch.id,
                        timeout_ms = batch_timeout.as_millis() as u64,
                        "batch deadline reached, cancelling in-flight sources"
                    );
                    cancel.cancel();
                }
            }
        }

        // A task that panicked never reported; close it out and free its trial slot.
        let leftovers: Vec<SourceId> = batch
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.source_id.clone())
            .collect();
        for source in leftovers {
            if trials.contains(&source) {
                self.health.abandon_trial(&source);
            }
            let attempts = batch.tasks.get(&source).map(|t| t.attempt_count).unwrap_or(0);
            finish_task(
                &mut batch,
                &mut per_source,
                TaskOutcome::new(source, TaskStatus::Failed, attempts)
                    .with_error("source task aborted"),
            );
        }

        batch.completed_at = Some(Utc::now());
        observer.send_replace(batch.clone());

        let items: Vec<RawItem> = order
            .iter()
            .filter_map(|s| per_source.remove(s))
            .flatten()
            .collect();

        histogram!("orchestrator_batch_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        tracing::info!(
            target: "orchestrator",
            batch = %batch.id,
            succeeded = batch.count_status(TaskStatus::Succeeded),
            failed = batch.count_status(TaskStatus::Failed),
            timed_out = batch.count_status(TaskStatus::TimedOut),
            skipped = batch.count_status(TaskStatus::Skipped),
            items = items.len(),
            "fetch phase completed"
        );

        FetchReport { batch, items }
    }
}

fn apply_event(batch: &mut Batch, ev: TaskEvent) {
    let (source, attempt) = match ev {
        TaskEvent::Started(s) => (s, None),
        TaskEvent::Attempt(s, n) => (s, Some(n)),
    };
    if let Some(task) = batch.task_mut(&source) {
        // Events can trail the outcome; never move a finished task backwards.
        if task.status.is_terminal() {
            return;
        }
        task.status = TaskStatus::Running;
        if let Some(n) = attempt {
            task.attempt_count = task.attempt_count.max(n);
        }
    }
}

fn finish_task(
    batch: &mut Batch,
    per_source: &mut BTreeMap<SourceId, Vec<RawItem>>,
    outcome: TaskOutcome,
) {
    counter!("orchestrator_tasks_total", "status" => status_label(outcome.status)).increment(1);
    if outcome.status == TaskStatus::Succeeded {
        counter!("orchestrator_items_total").increment(outcome.items.len() as u64);
    }
    if let Some(task) = batch.task_mut(&outcome.source) {
        task.status = outcome.status;
        task.attempt_count = task.attempt_count.max(outcome.attempts);
        task.items_found = outcome.items.len();
        task.error = outcome.error;
    }
    if !outcome.items.is_empty() {
        per_source.insert(outcome.source, outcome.items);
    }
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::TimedOut => "timed_out",
        TaskStatus::Skipped => "skipped",
    }
}

/// Body of one per-source task. Reports to the health tracker exactly once
/// unless the batch token ends it, in which case only a claimed trial slot is
/// given back.
async fn run_source_task(
    ctx: TaskCtx,
    source: SourceId,
    adapter: DynSourceAdapter,
    trial: bool,
) -> TaskOutcome {
    let release_trial = |ctx: &TaskCtx| {
        if trial {
            ctx.health.abandon_trial(&source);
        }
    };

    let _permit = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            release_trial(&ctx);
            return TaskOutcome::new(source.clone(), TaskStatus::Skipped, 0).cancelled();
        }
        permit = ctx.pool.clone().acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => {
                release_trial(&ctx);
                return TaskOutcome::new(source.clone(), TaskStatus::Failed, 0)
                    .with_error("fetch pool closed");
            }
        },
    };
    let _ = ctx.events.send(TaskEvent::Started(source.clone()));

    if trial {
        let probe_timeout = Duration::from_millis(ctx.cfg.health_probe_timeout_ms);
        let healthy = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                release_trial(&ctx);
                return TaskOutcome::new(source.clone(), TaskStatus::TimedOut, 0).cancelled();
            }
            probe = tokio::time::timeout(probe_timeout, adapter.health_probe()) => probe.unwrap_or(false),
        };
        if !healthy {
            ctx.health.record_failure(&source, trial);
            tracing::warn!(target: "orchestrator", source = %source, "health probe failed, source stays disabled");
            return TaskOutcome::new(source.clone(), TaskStatus::Skipped, 0)
                .with_error("health probe failed");
        }
    }

    let attempts = AtomicU32::new(0);
    let per_task = Duration::from_millis(ctx.cfg.per_task_timeout_ms);
    let fetch = retry_with(
        &ctx.cfg.retry,
        |n| {
            attempts.store(n, Ordering::SeqCst);
            let _ = ctx.events.send(TaskEvent::Attempt(source.clone(), n));
        },
        || adapter.search(&ctx.keywords, ctx.max_items),
    );

    let result = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => None,
        r = tokio::time::timeout(per_task, fetch) => Some(r),
    };
    let attempts = attempts.load(Ordering::SeqCst);

    match result {
        None => {
            release_trial(&ctx);
            TaskOutcome::new(source, TaskStatus::TimedOut, attempts).cancelled()
        }
        Some(Ok(Ok(mut items))) => {
            items.truncate(ctx.max_items);
            ctx.health.record_success(&source, trial);
            tracing::debug!(target: "orchestrator", source = %source, items = items.len(), attempts, "source task succeeded");
            let mut out = TaskOutcome::new(source, TaskStatus::Succeeded, attempts);
            out.items = items;
            out
        }
        Some(Ok(Err(e))) => {
            ctx.health.record_failure(&source, trial);
            tracing::warn!(target: "orchestrator", source = %source, error = %e, attempts, "source task failed");
            TaskOutcome::new(source, TaskStatus::Failed, attempts).with_error(e.to_string())
        }
        Some(Err(_elapsed)) => {
            ctx.health.record_failure(&source, trial);
            tracing::warn!(
                target: "orchestrator",
                source = %source,
                timeout_ms = ctx.cfg.per_task_timeout_ms,
                attempts,
                "source task timed out"
            );
            TaskOutcome::new(source, TaskStatus::TimedOut, attempts)
                .with_error(format!("timed out after {}ms", ctx.cfg.per_task_timeout_ms))
        }
    }
}
