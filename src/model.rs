//! # Data model
//! Records shared by the orchestrator, deduplicator, enrichment pipeline and
//! aggregator. Shapes match what is handed to the persistence layer; on-disk
//! schema is not defined here.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Identifier of a registered source, e.g. `"weibo"` or `"zhihu"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

pub type BatchId = Uuid;

/// SHA-256 of normalized text.
pub type FingerprintHash = [u8; 32];

pub fn hash_hex(h: &FingerprintHash) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(64);
    for b in h {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTask {
    pub source_id: SourceId,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub items_found: usize,
    pub error: Option<String>,
}

impl SourceTask {
    pub fn pending(source_id: SourceId) -> Self {
        Self {
            source_id,
            status: TaskStatus::Pending,
            attempt_count: 0,
            items_found: 0,
            error: None,
        }
    }
}

/// One logical multi-source request and its per-source outcome.
///
/// `overall_status` is never stored: it is derived from the task map on read
/// and on serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub requested_sources: BTreeSet<SourceId>,
    pub keywords: Vec<String>,
    pub per_source_max_items: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: BTreeMap<SourceId, SourceTask>,
}

impl Batch {
    pub fn new(sources: &[SourceId], keywords: Vec<String>, per_source_max_items: usize) -> Self {
        let requested_sources: BTreeSet<SourceId> = sources.iter().cloned().collect();
        let tasks = requested_sources
            .iter()
            .map(|s| (s.clone(), SourceTask::pending(s.clone())))
            .collect();
        Self {
            id: Uuid::new_v4(),
            requested_sources,
            keywords,
            per_source_max_items,
            created_at: Utc::now(),
            completed_at: None,
            tasks,
        }
    }

    pub fn overall_status(&self) -> BatchStatus {
        if self.tasks.values().all(|t| t.status.is_terminal()) {
            BatchStatus::Completed
        } else if self.tasks.values().all(|t| t.status == TaskStatus::Pending) {
            BatchStatus::Pending
        } else {
            BatchStatus::Running
        }
    }

    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn task_mut(&mut self, source: &SourceId) -> Option<&mut SourceTask> {
        self.tasks.get_mut(source)
    }
}

impl Serialize for Batch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("Batch", 8)?;
        st.serialize_field("id", &self.id)?;
        st.serialize_field("requested_sources", &self.requested_sources)?;
        st.serialize_field("keywords", &self.keywords)?;
        st.serialize_field("per_source_max_items", &self.per_source_max_items)?;
        st.serialize_field("created_at", &self.created_at)?;
        st.serialize_field("completed_at", &self.completed_at)?;
        st.serialize_field("overall_status", &self.overall_status())?;
        st.serialize_field("tasks", &self.tasks)?;
        st.end()
    }
}

/// Content item produced by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source_id: SourceId,
    pub external_id: String,
    pub text: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub engagement: HashMap<String, i64>,
    #[serde(default)]
    pub source_specific: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fingerprint {
    #[serde(serialize_with = "ser_hash")]
    pub hash: FingerprintHash,
    pub normalized_text: String,
    pub first_seen_batch: BatchId,
    pub seen_count: u64,
}

fn ser_hash<S: Serializer>(h: &FingerprintHash, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hash_hex(h))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    /// Lenient label parsing; model output is not trusted to follow the enum.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "positive" | "bullish" | "看涨" | "乐观" => Sentiment::Positive,
            "negative" | "bearish" | "看跌" | "悲观" => Sentiment::Negative,
            _ => Sentiment::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "low" | "低" => RiskLevel::Low,
            "high" | "高" => RiskLevel::High,
            _ => RiskLevel::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Recommendation {
    Buy,
    Watch,
    Hold,
    Avoid,
}

impl Recommendation {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "buy" | "strong buy" | "买入" | "推荐" => Recommendation::Buy,
            "watch" | "关注" => Recommendation::Watch,
            "avoid" | "sell" | "回避" | "卖出" => Recommendation::Avoid,
            _ => Recommendation::Hold,
        }
    }

    pub fn is_positive(self) -> bool {
        matches!(self, Recommendation::Buy | Recommendation::Watch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Succeeded,
    Failed,
}

/// Analysis attached to one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentResult {
    #[serde(serialize_with = "ser_hash")]
    pub fingerprint_hash: FingerprintHash,
    pub sentiment: Sentiment,
    pub recommendation: Recommendation,
    pub risk_level: RiskLevel,
    pub confidence_score: f32,
    pub extracted_symbol: Option<String>,
    pub tge_date: Option<String>,
    pub status: EnrichmentStatus,
    pub error: Option<String>,
    /// True when served from a previous run instead of a fresh call.
    pub reused: bool,
}

impl EnrichmentResult {
    /// Neutral placeholder recorded when every attempt failed.
    pub fn failed(fingerprint_hash: FingerprintHash, error: impl Into<String>) -> Self {
        Self {
            fingerprint_hash,
            sentiment: Sentiment::Neutral,
            recommendation: Recommendation::Hold,
            risk_level: RiskLevel::Medium,
            confidence_score: 0.0,
            extracted_symbol: None,
            tge_date: None,
            status: EnrichmentStatus::Failed,
            error: Some(error.into()),
            reused: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == EnrichmentStatus::Succeeded
    }
}

/// Point-in-time view of one source's circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealth {
    pub source_id: SourceId,
    pub consecutive_failures: u32,
    pub disabled: bool,
    pub disabled_until: Option<DateTime<Utc>>,
    pub trips: u32,
}
