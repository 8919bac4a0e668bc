//! # Enrichment pipeline
//! Sends unique items to the analyzer through a bounded pool.
//!
//! Each fingerprint is attempted at most once per retention window: results
//! (failed ones included) land in a shared [`ResultCache`], and concurrent
//! requests for the same fingerprint wait on the single call in flight.

pub mod analyzer;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::dedup::UniqueItem;
use crate::error::EnrichmentError;
use crate::model::{EnrichmentResult, EnrichmentStatus, FingerprintHash};
use crate::retry::{retry_with, RetryPolicy};
use analyzer::{Analysis, DynAnalyzer};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "enrich_calls_total",
            "Analyzer calls that reached a final result, by status."
        );
        describe_counter!(
            "enrich_reused_total",
            "Enrichment results served from cache or a shared in-flight call."
        );
        describe_histogram!(
            "enrich_call_ms",
            "Wall time of one enrichment including retries, in milliseconds."
        );
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub max_concurrent_calls: usize,
    /// Applies to each attempt separately.
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub result_retention_secs: u64,
    pub result_capacity: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 3,
            request_timeout_ms: 30_000,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1_000,
                multiplier: 1.5,
                max_delay_ms: 30_000,
            },
            result_retention_secs: 7 * 24 * 3600,
            result_capacity: 50_000,
        }
    }
}

impl EnrichmentConfig {
    pub fn sanitized(mut self) -> Self {
        self.max_concurrent_calls = self.max_concurrent_calls.max(1);
        self.request_timeout_ms = self.request_timeout_ms.max(1);
        self.retry = self.retry.sanitized();
        self.result_retention_secs = self.result_retention_secs.max(1);
        self.result_capacity = self.result_capacity.max(1);
        self
    }
}

// ------------------------------------------------------------
// Result cache
// ------------------------------------------------------------

#[derive(Debug)]
struct Cached {
    result: EnrichmentResult,
    at: Instant,
    seq: u64,
}

/// `order` holds `(hash, seq)` pairs; a pair whose seq no longer matches the
/// map entry is stale and skipped.
#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<FingerprintHash, Cached>,
    order: VecDeque<(FingerprintHash, u64)>,
    seq: u64,
}

/// Bounded map from fingerprint to its enrichment result. Entries are never
/// rewritten, so insertion order is also age order.
#[derive(Debug)]
pub struct ResultCache {
    retention: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            retention,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, hash: &FingerprintHash) -> Option<EnrichmentResult> {
        let now = Instant::now();
        let mut g = self.inner.lock().expect("result cache poisoned");
        let expired = match g.map.get(hash) {
            Some(c) if now.saturating_duration_since(c.at) <= self.retention => {
                return Some(c.result.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            g.map.remove(hash);
        }
        None
    }

    /// First writer wins; a second insert for the same hash is ignored.
    pub fn insert(&self, result: EnrichmentResult) {
        let now = Instant::now();
        let mut g = self.inner.lock().expect("result cache poisoned");
        let hash = result.fingerprint_hash;
        if g.map.contains_key(&hash) {
            return;
        }
        g.seq += 1;
        let seq = g.seq;
        g.map.insert(
            hash,
            Cached {
                result,
                at: now,
                seq,
            },
        );
        g.order.push_back((hash, seq));
        self.evict(&mut g, now);
    }

    /// Drop expired results; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut g = self.inner.lock().expect("result cache poisoned");
        let before = g.map.len();
        self.evict(&mut g, now);
        before - g.map.len()
    }

    fn evict(&self, g: &mut CacheInner, now: Instant) {
        while let Some(&(front, seq)) = g.order.front() {
            let drop_it = match g.map.get(&front) {
                Some(c) if c.seq == seq => {
                    g.map.len() > self.capacity
                        || now.saturating_duration_since(c.at) > self.retention
                }
                _ => {
                    g.order.pop_front();
                    continue;
                }
            };
            if !drop_it {
                break;
            }
            g.order.pop_front();
            g.map.remove(&front);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("result cache poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ------------------------------------------------------------
// Pipeline
// ------------------------------------------------------------

type Inflight = Mutex<HashMap<FingerprintHash, watch::Receiver<Option<EnrichmentResult>>>>;

/// Removes the in-flight slot when the leading call finishes or is dropped.
struct InflightGuard<'a> {
    inflight: &'a Inflight,
    hash: FingerprintHash,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut g) = self.inflight.lock() {
            g.remove(&self.hash);
        }
    }
}

enum Role {
    Leader(watch::Sender<Option<EnrichmentResult>>),
    Follower(watch::Receiver<Option<EnrichmentResult>>),
}

struct Shared {
    analyzer: DynAnalyzer,
    cache: Arc<ResultCache>,
    cfg: EnrichmentConfig,
    pool: Arc<Semaphore>,
    inflight: Inflight,
}

/// Cheap to clone; clones share the pool, cache and in-flight table.
#[derive(Clone)]
pub struct EnrichmentPipeline {
    shared: Arc<Shared>,
}

impl EnrichmentPipeline {
    pub fn new(analyzer: DynAnalyzer, cache: Arc<ResultCache>, cfg: EnrichmentConfig) -> Self {
        let cfg = cfg.sanitized();
        Self {
            shared: Arc::new(Shared {
                analyzer,
                cache,
                pool: Arc::new(Semaphore::new(cfg.max_concurrent_calls)),
                cfg,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.shared.cache
    }

    pub fn analyzer_name(&self) -> &'static str {
        self.shared.analyzer.name()
    }

    /// Previously stored result for a fingerprint, marked as reused.
    pub fn lookup(&self, hash: &FingerprintHash) -> Option<EnrichmentResult> {
        self.shared.cache.get(hash).map(|mut r| {
            r.reused = true;
            r
        })
    }

    /// Enrich every item; output order follows input order. One item failing
    /// never affects the others.
    pub async fn enrich(&self, items: Vec<UniqueItem>) -> Vec<EnrichmentResult> {
        ensure_metrics_described();
        let hashes: Vec<FingerprintHash> = items.iter().map(|u| u.fingerprint_hash).collect();
        let mut set = JoinSet::new();
        for (idx, unique) in items.into_iter().enumerate() {
            let this = self.clone();
            set.spawn(async move {
                (idx, this.enrich_one(unique.fingerprint_hash, &unique.item.text).await)
            });
        }

        let mut slots: Vec<Option<EnrichmentResult>> = vec![None; hashes.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => tracing::error!(target: "enrich", error = %e, "enrichment task aborted"),
            }
        }
        slots
            .into_iter()
            .zip(hashes)
            .map(|(slot, hash)| {
                slot.unwrap_or_else(|| EnrichmentResult::failed(hash, "enrichment task aborted"))
            })
            .collect()
    }

    /// Same work as [`enrich`](Self::enrich) but yields results as they
    /// complete. Dropping the receiver stops outstanding calls.
    pub fn enrich_stream(&self, items: Vec<UniqueItem>) -> mpsc::Receiver<EnrichmentResult> {
        ensure_metrics_described();
        let (tx, rx) = mpsc::channel(items.len().max(1));
        let this = self.clone();
        tokio::spawn(async move {
            let mut set = JoinSet::new();
            for unique in items {
                let this = this.clone();
                set.spawn(async move {
                    this.enrich_one(unique.fingerprint_hash, &unique.item.text).await
                });
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    joined = set.join_next() => match joined {
                        None => break,
                        Some(Ok(result)) => {
                            if tx.send(result).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!(target: "enrich", error = %e, "enrichment task aborted");
                        }
                    },
                }
            }
        });
        rx
    }

    async fn enrich_one(&self, hash: FingerprintHash, text: &str) -> EnrichmentResult {
        let shared = &self.shared;
        loop {
            if let Some(hit) = self.lookup(&hash) {
                counter!("enrich_reused_total").increment(1);
                return hit;
            }

            let role = {
                let mut g = shared.inflight.lock().expect("inflight table poisoned");
                match g.get(&hash) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        g.insert(hash, rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Follower(mut rx) => {
                    let shared_result = rx.wait_for(Option::is_some).await.ok().and_then(|v| v.clone());
                    match shared_result {
                        Some(mut r) => {
                            counter!("enrich_reused_total").increment(1);
                            r.reused = true;
                            return r;
                        }
                        // Leader was dropped before finishing; take over.
                        None => continue,
                    }
                }
                Role::Leader(tx) => {
                    let _guard = InflightGuard {
                        inflight: &shared.inflight,
                        hash,
                    };
                    let result = self.call(hash, text).await;
                    shared.cache.insert(result.clone());
                    tx.send_replace(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    async fn call(&self, hash: FingerprintHash, text: &str) -> EnrichmentResult {
        let shared = &self.shared;
        let started = Instant::now();
        let _permit = match shared.pool.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return EnrichmentResult::failed(hash, "enrichment pool closed"),
        };

        let attempts = AtomicU32::new(0);
        let per_request = Duration::from_millis(shared.cfg.request_timeout_ms);
        let outcome: Result<Analysis, EnrichmentError> = retry_with(
            &shared.cfg.retry,
            |n| attempts.store(n, Ordering::SeqCst),
            || async {
                tokio::time::timeout(per_request, shared.analyzer.analyze(text))
                    .await
                    .unwrap_or(Err(EnrichmentError::Timeout))
            },
        )
        .await;

        histogram!("enrich_call_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        let attempts = attempts.load(Ordering::SeqCst);
        match outcome {
            Ok(a) => {
                counter!("enrich_calls_total", "status" => "succeeded").increment(1);
                EnrichmentResult {
                    fingerprint_hash: hash,
                    sentiment: a.sentiment,
                    recommendation: a.recommendation,
                    risk_level: a.risk_level,
                    confidence_score: a.confidence_score.clamp(0.0, 1.0),
                    extracted_symbol: a.extracted_symbol,
                    tge_date: a.tge_date,
                    status: EnrichmentStatus::Succeeded,
                    error: None,
                    reused: false,
                }
            }
            Err(e) => {
                counter!("enrich_calls_total", "status" => "failed").increment(1);
                tracing::warn!(target: "enrich", error = %e, attempts, analyzer = shared.analyzer.name(), "enrichment failed");
                EnrichmentResult::failed(hash, e.to_string())
            }
        }
    }
}
