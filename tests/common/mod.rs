// tests/common/mod.rs
//
// Shared fakes for integration tests: scripted sources, a counting analyzer,
// and a helper that wires a BatchService around them.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tge_batch_orchestrator::config::PipelineConfig;
use tge_batch_orchestrator::dedup::store::FingerprintStore;
use tge_batch_orchestrator::dedup::Deduplicator;
use tge_batch_orchestrator::enrich::analyzer::{Analysis, Analyzer, DynAnalyzer, MockAnalyzer};
use tge_batch_orchestrator::enrich::{EnrichmentPipeline, ResultCache};
use tge_batch_orchestrator::error::{EnrichmentError, SourceError};
use tge_batch_orchestrator::health::HealthTracker;
use tge_batch_orchestrator::model::{RawItem, Recommendation, RiskLevel, Sentiment, SourceId};
use tge_batch_orchestrator::orchestrator::{FetchRequest, Orchestrator};
use tge_batch_orchestrator::service::BatchService;
use tge_batch_orchestrator::sources::{SourceAdapter, SourceRegistry};

const WORDS: &[&str] = &[
    "token", "launch", "airdrop", "wallet", "bridge", "staking", "vesting", "cliff", "listing",
    "exchange", "liquidity", "pool", "governance", "snapshot", "whitelist", "presale", "mainnet",
    "testnet", "validator", "oracle", "rollup", "layer", "yield", "farm", "vault", "mint", "burn",
    "supply", "unlock", "roadmap", "audit", "partner", "community", "quest", "points", "season",
    "claim", "deadline", "rumor", "analysis",
];

/// Deterministic pseudo-random text; different (seed, n) pairs are far apart
/// in edit distance.
pub fn distinct_text(seed: &str, n: usize) -> String {
    let mut state: u64 = seed
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3))
        ^ (n as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let mut words = Vec::with_capacity(14);
    for _ in 0..14 {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        words.push(WORDS[(state >> 33) as usize % WORDS.len()]);
    }
    format!("TGE {seed} {n} {}", words.join(" "))
}

pub fn item(source: &str, id: &str, text: &str) -> RawItem {
    RawItem {
        source_id: SourceId::new(source),
        external_id: id.to_string(),
        text: text.to_string(),
        author: "tester".into(),
        published_at: None,
        media_urls: vec![],
        engagement: Default::default(),
        source_specific: Default::default(),
    }
}

pub fn items(source: &str, count: usize) -> Vec<RawItem> {
    (0..count)
        .map(|i| item(source, &format!("{source}-{i}"), &distinct_text(source, i)))
        .collect()
}

type Step = (Option<Duration>, Result<Vec<RawItem>, SourceError>);

/// Source whose answers are scripted call by call; once the script runs out
/// it keeps returning `fallback`. A step picks its own delay or uses the
/// source-wide one.
pub struct FakeSource {
    id: SourceId,
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Result<Vec<RawItem>, SourceError>>,
    delay: Mutex<Duration>,
    probe_ok: AtomicBool,
    pub calls: AtomicU32,
    pub probes: AtomicU32,
}

impl FakeSource {
    pub fn ok(id: &str, items: Vec<RawItem>) -> Self {
        Self::with_fallback(id, Ok(items))
    }

    pub fn failing(id: &str, err: SourceError) -> Self {
        Self::with_fallback(id, Err(err))
    }

    fn with_fallback(id: &str, fallback: Result<Vec<RawItem>, SourceError>) -> Self {
        Self {
            id: SourceId::new(id),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            delay: Mutex::new(Duration::ZERO),
            probe_ok: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            probes: AtomicU32::new(0),
        }
    }

    pub fn then(self, step: Result<Vec<RawItem>, SourceError>) -> Self {
        self.script.lock().unwrap().push_back((None, step));
        self
    }

    pub fn then_after(self, delay: Duration, step: Result<Vec<RawItem>, SourceError>) -> Self {
        self.script.lock().unwrap().push_back((Some(delay), step));
        self
    }

    pub fn with_delay(self, d: Duration) -> Self {
        *self.delay.lock().unwrap() = d;
        self
    }

    pub fn set_fallback(&self, fallback: Result<Vec<RawItem>, SourceError>) {
        *self.fallback.lock().unwrap() = fallback;
    }

    pub fn set_probe(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    async fn search(&self, _keywords: &[String], max_items: usize) -> Result<Vec<RawItem>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (step_delay, next) = match self.script.lock().unwrap().pop_front() {
            Some((d, step)) => (d, Some(step)),
            None => (None, None),
        };
        let delay = step_delay.unwrap_or_else(|| *self.delay.lock().unwrap());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let out = next.unwrap_or_else(|| self.fallback.lock().unwrap().clone());
        out.map(|mut v| {
            v.truncate(max_items);
            v
        })
    }

    async fn health_probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.probe_ok.load(Ordering::SeqCst)
    }
}

/// Analyzer that counts calls and fails permanently on texts containing "poison".
#[derive(Default)]
pub struct CountingAnalyzer {
    pub calls: AtomicU32,
}

impl CountingAnalyzer {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for CountingAnalyzer {
    async fn analyze(&self, text: &str) -> Result<Analysis, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("poison") {
            return Err(EnrichmentError::InvalidResponse("unparseable".into()));
        }
        Ok(Analysis {
            sentiment: Sentiment::Positive,
            recommendation: Recommendation::Watch,
            risk_level: RiskLevel::Medium,
            confidence_score: 0.7,
            extracted_symbol: None,
            tge_date: None,
        })
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

pub fn registry(sources: &[Arc<FakeSource>]) -> SourceRegistry {
    let mut reg = SourceRegistry::new();
    for s in sources {
        reg.register(s.clone());
    }
    reg
}

pub fn service_with(
    cfg: &PipelineConfig,
    registry: SourceRegistry,
    analyzer: DynAnalyzer,
) -> Arc<BatchService> {
    let health = Arc::new(HealthTracker::new(cfg.health));
    let orchestrator = Arc::new(Orchestrator::new(registry, health, cfg.orchestrator));
    let store = Arc::new(FingerprintStore::new(cfg.dedup.store));
    let dedup = Deduplicator::new(store, &cfg.dedup);
    let cache = Arc::new(ResultCache::new(
        Duration::from_secs(cfg.enrichment.result_retention_secs),
        cfg.enrichment.result_capacity,
    ));
    let enrichment = EnrichmentPipeline::new(analyzer, cache, cfg.enrichment);
    Arc::new(BatchService::new(orchestrator, dedup, enrichment, cfg.retention))
}

pub fn mock_service(cfg: &PipelineConfig, registry: SourceRegistry) -> Arc<BatchService> {
    service_with(cfg, registry, Arc::new(MockAnalyzer))
}

pub fn request(sources: &[&str]) -> FetchRequest {
    FetchRequest {
        sources: sources.iter().map(|s| SourceId::new(*s)).collect(),
        keywords: vec!["TGE".into()],
        per_source_max_items: 50,
        timeout_ms: None,
    }
}
