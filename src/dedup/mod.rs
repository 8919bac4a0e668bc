// src/dedup/mod.rs
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::model::{BatchId, FingerprintHash, RawItem};
use store::{Check, FingerprintStore};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("dedup_unique_total", "Items that produced a new fingerprint.");
        describe_counter!("dedup_exact_total", "Items dropped as exact duplicates.");
        describe_counter!("dedup_near_total", "Items dropped as near-duplicates.");
        describe_counter!(
            "dedup_project_total",
            "Items dropped because their project was already seen within the window."
        );
        describe_counter!(
            "dedup_filtered_total",
            "Items dropped as too short or off-topic before fingerprinting."
        );
    });
}

/// Normalize text for fingerprinting: decode entities, strip tags, drop
/// punctuation and symbols, collapse whitespace, lowercase cased scripts.
/// Scripts without case (CJK, Thai, ...) pass through unchanged.
pub fn normalize_for_fingerprint(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    let untagged = re_tags.replace_all(&decoded, " ");

    let mut out = String::with_capacity(untagged.len());
    let mut pending_space = false;
    for ch in untagged.chars() {
        if ch.is_whitespace() || is_punct_or_symbol(ch) {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if ch.is_uppercase() {
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn is_punct_or_symbol(ch: char) -> bool {
    static RE_PUNCT: OnceCell<regex::Regex> = OnceCell::new();
    if ch.is_ascii() {
        return ch.is_ascii_punctuation();
    }
    let re = RE_PUNCT.get_or_init(|| regex::Regex::new(r"^[\p{P}\p{S}]$").unwrap());
    let mut buf = [0u8; 4];
    re.is_match(ch.encode_utf8(&mut buf))
}

pub fn fingerprint_hash(normalized: &str) -> FingerprintHash {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.finalize().into()
}

/// Normalized Levenshtein similarity in [0.0, 1.0].
pub fn similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(a, b) as f32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Items whose normalized text is shorter than this are invalid content.
    pub min_text_chars: usize,
    /// When non-empty, items must mention at least one of these terms.
    pub relevance_keywords: Vec<String>,
    pub store: store::StoreConfig,
    pub project_window: ProjectWindowConfig,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            min_text_chars: 10,
            relevance_keywords: Vec::new(),
            store: store::StoreConfig::default(),
            project_window: ProjectWindowConfig::default(),
        }
    }
}

/// Drop posts naming a project that another post already named within
/// `window_secs`, even when the wording differs. Off by default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectWindowConfig {
    pub enabled: bool,
    pub window_secs: u64,
}

impl Default for ProjectWindowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: 24 * 3_600,
        }
    }
}

/// Project name mentioned in the headline (first line) of a post, if any.
/// Matches "Xyz Token/Protocol/Network/Finance/Swap", "Xyz代币/项目/协议/网络"
/// and CamelCase names like "PancakeSwap". Returned lowercased.
pub fn extract_project_name(text: &str) -> Option<String> {
    static RE_PROJECT: OnceCell<Vec<regex::Regex>> = OnceCell::new();
    let patterns = RE_PROJECT.get_or_init(|| {
        [
            r"([A-Za-z]+)\s+(?:Token|Protocol|Network|Finance|Swap)",
            r"([A-Za-z\p{Han}]+?)(?:代币|项目|协议|网络)",
            r"([A-Z][a-z]+[A-Z][a-z]+)",
        ]
        .iter()
        .map(|p| regex::Regex::new(p).unwrap())
        .collect()
    });
    let headline = text.lines().find(|l| !l.trim().is_empty())?;
    patterns
        .iter()
        .find_map(|re| re.captures(headline))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniqueItem {
    pub fingerprint_hash: FingerprintHash,
    pub normalized_text: String,
    pub item: RawItem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateKind {
    Exact,
    Near { score: f32 },
    /// Same project as `matched` within the project window.
    Project { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateItem {
    pub matched: FingerprintHash,
    pub kind: DuplicateKind,
    pub item: RawItem,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub unique: Vec<UniqueItem>,
    pub duplicates: Vec<DuplicateItem>,
    pub filtered: usize,
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    store: Arc<FingerprintStore>,
    min_text_chars: usize,
    relevance_keywords: Vec<String>,
    project_window: Option<Duration>,
    /// project name -> (first seen, fingerprint that claimed it)
    projects: Arc<Mutex<HashMap<String, (Instant, FingerprintHash)>>>,
}

impl Deduplicator {
    pub fn new(store: Arc<FingerprintStore>, cfg: &DedupConfig) -> Self {
        Self {
            store,
            min_text_chars: cfg.min_text_chars,
            relevance_keywords: cfg
                .relevance_keywords
                .iter()
                .map(|k| normalize_for_fingerprint(k))
                .filter(|k| !k.is_empty())
                .collect(),
            project_window: cfg
                .project_window
                .enabled
                .then(|| Duration::from_secs(cfg.project_window.window_secs)),
            projects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<FingerprintStore> {
        &self.store
    }

    /// Keep only items not seen before (in this call or any earlier batch).
    /// Input order is preserved among the survivors.
    pub fn filter(&self, batch: BatchId, items: Vec<RawItem>) -> DedupOutcome {
        ensure_metrics_described();
        let mut out = DedupOutcome::default();

        for item in items {
            let normalized = normalize_for_fingerprint(&item.text);
            if normalized.chars().count() < self.min_text_chars || !self.is_relevant(&normalized) {
                out.filtered += 1;
                continue;
            }
            let hash = fingerprint_hash(&normalized);
            match self.store.check_and_insert(hash, &normalized, batch) {
                Check::New(h) => match self.claim_project(&item.text, h) {
                    Some((matched, name)) => {
                        tracing::debug!(target: "dedup", source = %item.source_id, id = %item.external_id, project = %name, "project already seen in window");
                        out.duplicates.push(DuplicateItem {
                            matched,
                            kind: DuplicateKind::Project { name },
                            item,
                        })
                    }
                    None => out.unique.push(UniqueItem {
                        fingerprint_hash: h,
                        normalized_text: normalized,
                        item,
                    }),
                },
                Check::Exact(matched) => out.duplicates.push(DuplicateItem {
                    matched,
                    kind: DuplicateKind::Exact,
                    item,
                }),
                Check::Near { matched, score } => {
                    tracing::debug!(target: "dedup", source = %item.source_id, id = %item.external_id, score, "near-duplicate dropped");
                    out.duplicates.push(DuplicateItem {
                        matched,
                        kind: DuplicateKind::Near { score },
                        item,
                    })
                }
            }
        }

        let (mut exact, mut near, mut project) = (0u64, 0u64, 0u64);
        for d in &out.duplicates {
            match d.kind {
                DuplicateKind::Exact => exact += 1,
                DuplicateKind::Near { .. } => near += 1,
                DuplicateKind::Project { .. } => project += 1,
            }
        }
        counter!("dedup_unique_total").increment(out.unique.len() as u64);
        counter!("dedup_exact_total").increment(exact);
        counter!("dedup_near_total").increment(near);
        counter!("dedup_project_total").increment(project);
        counter!("dedup_filtered_total").increment(out.filtered as u64);
        tracing::info!(
            target: "dedup",
            batch = %batch,
            unique = out.unique.len(),
            duplicates = out.duplicates.len(),
            filtered = out.filtered,
            "dedup pass finished"
        );
        out
    }

    /// With the project window enabled, returns the fingerprint that already
    /// claimed this item's project within the window. Otherwise the item
    /// claims the project itself.
    fn claim_project(
        &self,
        text: &str,
        hash: FingerprintHash,
    ) -> Option<(FingerprintHash, String)> {
        let window = self.project_window?;
        let name = extract_project_name(text)?;
        let now = Instant::now();
        let mut g = self.projects.lock().expect("project window poisoned");
        g.retain(|_, (at, _)| now.saturating_duration_since(*at) < window);
        match g.get(&name) {
            Some(&(_, matched)) if matched != hash => Some((matched, name)),
            Some(_) => None,
            None => {
                g.insert(name, (now, hash));
                None
            }
        }
    }

    fn is_relevant(&self, normalized: &str) -> bool {
        self.relevance_keywords.is_empty()
            || self
                .relevance_keywords
                .iter()
                .any(|k| normalized.contains(k.as_str()))
    }
}
