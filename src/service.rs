//! # Batch service
//! Owns the batch table and drives each batch through fetch, dedup,
//! enrichment and aggregation.
//!
//! Submitted batches can be observed while they run: the fetch phase
//! publishes task-map snapshots and the later phases publish a [`Stage`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{aggregate, BatchSummary, DedupCounts};
use crate::config::PipelineConfig;
use crate::dedup::store::FingerprintStore;
use crate::dedup::{normalize_for_fingerprint, Deduplicator, UniqueItem};
use crate::enrich::analyzer::build_analyzer;
use crate::enrich::{EnrichmentPipeline, ResultCache};
use crate::error::BatchError;
use crate::health::HealthTracker;
use crate::model::{
    Batch, BatchId, BatchStatus, EnrichmentResult, FingerprintHash, RawItem, SourceHealth,
};
use crate::orchestrator::{FetchRequest, Orchestrator};
use crate::sources::SourceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Finished batches beyond this count are dropped oldest-first.
    pub max_batches: usize,
    /// Age used by the periodic cleanup.
    pub batch_max_age_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_batches: 1_000,
            batch_max_age_secs: 24 * 3600,
            cleanup_interval_secs: 3600,
        }
    }
}

/// Post-fetch progress of a batch.
#[derive(Debug, Clone)]
pub enum Stage {
    Fetching,
    Deduplicating,
    Enriching,
    Finished(Arc<BatchOutcome>),
}

impl Stage {
    fn name(&self) -> StageName {
        match self {
            Stage::Fetching => StageName::Fetching,
            Stage::Deduplicating => StageName::Deduplicating,
            Stage::Enriching => StageName::Enriching,
            Stage::Finished(_) => StageName::Finished,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Fetching,
    Deduplicating,
    Enriching,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub summary: BatchSummary,
    /// Items that survived dedup, in fetch order.
    pub items: Vec<RawItem>,
    pub results: Vec<EnrichmentResult>,
}

/// Everything known about one batch at the time of the call.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub batch: Batch,
    pub stage: StageName,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Arc<BatchOutcome>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchListing {
    pub id: BatchId,
    pub created_at: DateTime<Utc>,
    pub overall_status: BatchStatus,
    pub stage: StageName,
    pub sources: usize,
    pub keywords: Vec<String>,
}

struct Entry {
    created: Instant,
    /// Submission order; ties on `created` are common under a paused clock.
    seq: u64,
    batch: watch::Receiver<Batch>,
    stage: watch::Receiver<Stage>,
    cancel: CancellationToken,
}

impl Entry {
    fn record(&self) -> BatchRecord {
        let stage = self.stage.borrow().clone();
        BatchRecord {
            batch: self.batch.borrow().clone(),
            stage: stage.name(),
            cancelled: self.cancel.is_cancelled(),
            outcome: match stage {
                Stage::Finished(o) => Some(o),
                _ => None,
            },
        }
    }

    fn is_finished(&self) -> bool {
        matches!(*self.stage.borrow(), Stage::Finished(_))
    }
}

/// Publishing ends of one batch, held by whoever executes it.
struct Channels {
    batch: watch::Sender<Batch>,
    stage: watch::Sender<Stage>,
    cancel: CancellationToken,
}

pub struct BatchService {
    orchestrator: Arc<Orchestrator>,
    dedup: Deduplicator,
    enrichment: EnrichmentPipeline,
    retention: RetentionConfig,
    batches: Mutex<HashMap<BatchId, Entry>>,
    next_seq: AtomicU64,
}

impl BatchService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        dedup: Deduplicator,
        enrichment: EnrichmentPipeline,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            orchestrator,
            dedup,
            enrichment,
            retention,
            batches: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Wire every component from configuration.
    pub fn from_config(cfg: &PipelineConfig, registry: SourceRegistry) -> anyhow::Result<Self> {
        let health = Arc::new(HealthTracker::new(cfg.health));
        let orchestrator = Arc::new(Orchestrator::new(registry, health, cfg.orchestrator));
        let store = Arc::new(FingerprintStore::new(cfg.dedup.store));
        let dedup = Deduplicator::new(store, &cfg.dedup);
        let analyzer = build_analyzer(&cfg.ai)?;
        let cache = Arc::new(ResultCache::new(
            Duration::from_secs(cfg.enrichment.result_retention_secs),
            cfg.enrichment.result_capacity,
        ));
        tracing::info!(
            target: "service",
            sources = orchestrator.registry().len(),
            analyzer = analyzer.name(),
            "batch service configured"
        );
        let enrichment = EnrichmentPipeline::new(analyzer, cache, cfg.enrichment);
        Ok(Self::new(orchestrator, dedup, enrichment, cfg.retention))
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn retention(&self) -> &RetentionConfig {
        &self.retention
    }

    pub fn enrichment(&self) -> &EnrichmentPipeline {
        &self.enrichment
    }

    /// Asynchronous submit: validate, start in the background, return the id.
    pub fn submit_batch(self: &Arc<Self>, req: FetchRequest) -> Result<BatchId, BatchError> {
        let batch = self.orchestrator.prepare(&req)?;
        let id = batch.id;
        let timeout = self.orchestrator.batch_timeout(&req);
        let channels = self.register(batch.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(batch, timeout, channels).await;
        });
        Ok(id)
    }

    /// Synchronous submit: runs the batch to its end before returning.
    pub async fn run_batch(&self, req: FetchRequest) -> Result<BatchRecord, BatchError> {
        let batch = self.orchestrator.prepare(&req)?;
        let id = batch.id;
        let timeout = self.orchestrator.batch_timeout(&req);
        let channels = self.register(batch.clone());
        self.execute(batch, timeout, channels).await;
        self.get_batch(id)
    }

    pub fn get_batch(&self, id: BatchId) -> Result<BatchRecord, BatchError> {
        let g = self.batches.lock().expect("batch table poisoned");
        g.get(&id).map(Entry::record).ok_or(BatchError::NotFound(id))
    }

    /// Wait until the batch has a final outcome.
    pub async fn wait_batch(&self, id: BatchId) -> Result<BatchRecord, BatchError> {
        let mut stage = {
            let g = self.batches.lock().expect("batch table poisoned");
            g.get(&id).map(|e| e.stage.clone()).ok_or(BatchError::NotFound(id))?
        };
        // A closed channel means the executor is gone; report whatever is recorded.
        let _ = stage.wait_for(|s| matches!(s, Stage::Finished(_))).await;
        self.get_batch(id)
    }

    /// Newest first.
    pub fn list_batches(&self, limit: usize) -> Vec<BatchListing> {
        let g = self.batches.lock().expect("batch table poisoned");
        let mut rows: Vec<(u64, BatchListing)> = g
            .iter()
            .map(|(id, e)| {
                let b = e.batch.borrow();
                (
                    e.seq,
                    BatchListing {
                        id: *id,
                        created_at: b.created_at,
                        overall_status: b.overall_status(),
                        stage: e.stage.borrow().name(),
                        sources: b.tasks.len(),
                        keywords: b.keywords.clone(),
                    },
                )
            })
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter().take(limit).map(|(_, l)| l).collect()
    }

    /// Request cancellation. Returns `false` when the batch had already finished.
    pub fn cancel_batch(&self, id: BatchId) -> Result<bool, BatchError> {
        let g = self.batches.lock().expect("batch table poisoned");
        let entry = g.get(&id).ok_or(BatchError::NotFound(id))?;
        if entry.is_finished() {
            return Ok(false);
        }
        entry.cancel.cancel();
        tracing::info!(target: "service", batch = %id, "batch cancellation requested");
        Ok(true)
    }

    /// Drop finished batches older than `max_age`; running ones are kept.
    pub fn cleanup_old_batches(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut g = self.batches.lock().expect("batch table poisoned");
        let before = g.len();
        g.retain(|_, e| !e.is_finished() || now.saturating_duration_since(e.created) <= max_age);
        let removed = before - g.len();
        if removed > 0 {
            tracing::info!(target: "service", removed, "old batches cleaned up");
        }
        removed
    }

    /// Circuit state of every registered source, sorted by id. Sources no
    /// batch has touched yet report as healthy.
    pub fn source_health(&self) -> Vec<SourceHealth> {
        let health = self.orchestrator.health();
        let mut rows = health.snapshot_all();
        for id in self.orchestrator.registry().ids().iter() {
            if !rows.iter().any(|h| &h.source_id == id) {
                rows.push(health.snapshot(id));
            }
        }
        rows.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        rows
    }

    /// Periodic cleanup of old batches and expired fingerprints.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(this.retention.cleanup_interval_secs.max(1));
            let max_age = Duration::from_secs(this.retention.batch_max_age_secs);
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately.
            tick.tick().await;
            loop {
                tick.tick().await;
                let batches = this.cleanup_old_batches(max_age);
                let fingerprints = this.dedup.store().purge_expired();
                let results = this.enrichment.cache().purge_expired();
                tracing::debug!(target: "service", batches, fingerprints, results, "maintenance tick");
            }
        })
    }

    fn register(&self, batch: Batch) -> Channels {
        let (batch_tx, batch_rx) = watch::channel(batch.clone());
        let (stage_tx, stage_rx) = watch::channel(Stage::Fetching);
        let cancel = CancellationToken::new();
        let mut g = self.batches.lock().expect("batch table poisoned");
        g.insert(
            batch.id,
            Entry {
                created: Instant::now(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                batch: batch_rx,
                stage: stage_rx,
                cancel: cancel.clone(),
            },
        );
        evict_over_capacity(&mut g, self.retention.max_batches);
        Channels {
            batch: batch_tx,
            stage: stage_tx,
            cancel,
        }
    }

    async fn execute(&self, batch: Batch, timeout: Duration, ch: Channels) {
        let id = batch.id;
        let report = self
            .orchestrator
            .run_observed(batch, timeout, &ch.batch, ch.cancel.clone())
            .await;

        ch.stage.send_replace(Stage::Deduplicating);
        let raw = report.items.len();
        let deduped = self.dedup.filter(id, report.items);
        let counts = DedupCounts::from_outcome(raw, &deduped);

        ch.stage.send_replace(Stage::Enriching);
        // Duplicates of fingerprints committed by another batch get that
        // batch's result. If it is still in flight they wait for it; if it was
        // never produced (cancelled batch) they run the analysis themselves.
        let unique_hashes: HashSet<FingerprintHash> =
            deduped.unique.iter().map(|u| u.fingerprint_hash).collect();
        let mut seen: HashSet<FingerprintHash> = HashSet::new();
        let borrowed: Vec<UniqueItem> = deduped
            .duplicates
            .iter()
            .filter(|d| !unique_hashes.contains(&d.matched) && seen.insert(d.matched))
            .map(|d| UniqueItem {
                fingerprint_hash: d.matched,
                normalized_text: normalize_for_fingerprint(&d.item.text),
                item: d.item.clone(),
            })
            .collect();

        let mut work = deduped.unique.clone();
        work.extend(borrowed.iter().cloned());
        let results = if ch.cancel.is_cancelled() {
            self.cancelled_results(&deduped.unique, &borrowed)
        } else {
            tracing::debug!(
                target: "service",
                batch = %id,
                analyzer = self.enrichment.analyzer_name(),
                unique = deduped.unique.len(),
                borrowed = borrowed.len(),
                "enriching"
            );
            tokio::select! {
                _ = ch.cancel.cancelled() => self.cancelled_results(&deduped.unique, &borrowed),
                r = self.enrichment.enrich(work) => r,
            }
        };

        let summary = aggregate(&report.batch, counts, &results);
        tracing::info!(
            target: "service",
            batch = %id,
            raw = counts.raw,
            unique = counts.unique,
            enriched = summary.enrichment.succeeded,
            reused = summary.enrichment.reused,
            "batch finished"
        );
        let items = deduped.unique.into_iter().map(|u| u.item).collect();
        ch.stage.send_replace(Stage::Finished(Arc::new(BatchOutcome {
            summary,
            items,
            results,
        })));
    }

    /// Unique items of a cancelled batch fail; borrowed fingerprints only
    /// take a result that is already stored. Neither is written to the cache.
    fn cancelled_results(
        &self,
        unique: &[UniqueItem],
        borrowed: &[UniqueItem],
    ) -> Vec<EnrichmentResult> {
        unique
            .iter()
            .map(|u| EnrichmentResult::failed(u.fingerprint_hash, "batch cancelled"))
            .chain(
                borrowed
                    .iter()
                    .filter_map(|b| self.enrichment.lookup(&b.fingerprint_hash)),
            )
            .collect()
    }
}

fn evict_over_capacity(g: &mut HashMap<BatchId, Entry>, max: usize) {
    if g.len() <= max {
        return;
    }
    let mut finished: Vec<(u64, BatchId)> = g
        .iter()
        .filter(|(_, e)| e.is_finished())
        .map(|(id, e)| (e.seq, *id))
        .collect();
    finished.sort();
    let excess = g.len() - max;
    for (_, id) in finished.into_iter().take(excess) {
        g.remove(&id);
    }
}
