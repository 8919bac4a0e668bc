//! Shared fingerprint index.
//!
//! Bounded two ways: entries idle longer than `retention_secs` are dropped, and
//! the least recently seen entries are evicted beyond `max_entries`. Near-dup
//! comparison only looks at the `recent_window` newest fingerprints.
//!
//! Lookup and insert happen under one lock, so two batches submitting the same
//! text at once produce exactly one new fingerprint.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::model::{BatchId, Fingerprint, FingerprintHash};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_entries: usize,
    pub retention_secs: u64,
    pub recent_window: usize,
    pub similarity_threshold: f32,
    /// Texts are compared on at most this many leading chars.
    pub similarity_max_chars: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 50_000,
            retention_secs: 7 * 24 * 3600,
            recent_window: 256,
            similarity_threshold: 0.90,
            similarity_max_chars: 512,
        }
    }
}

impl StoreConfig {
    pub fn sanitized(mut self) -> Self {
        self.max_entries = self.max_entries.max(1);
        self.retention_secs = self.retention_secs.max(1);
        self.similarity_threshold = self.similarity_threshold.clamp(0.0, 1.0);
        self.similarity_max_chars = self.similarity_max_chars.max(1);
        self
    }
}

/// Result of checking one normalized text against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    New(FingerprintHash),
    Exact(FingerprintHash),
    Near { matched: FingerprintHash, score: f32 },
}

#[derive(Debug)]
struct Entry {
    fp: Fingerprint,
    last_seen: Instant,
    touch_seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<FingerprintHash, Entry>,
    /// Touch log ordered oldest-first; stale pairs are skipped lazily.
    lru: VecDeque<(FingerprintHash, u64)>,
    recent: VecDeque<FingerprintHash>,
    seq: u64,
}

#[derive(Debug)]
pub struct FingerprintStore {
    cfg: StoreConfig,
    inner: Mutex<Inner>,
}

impl FingerprintStore {
    pub fn new(cfg: StoreConfig) -> Self {
        Self {
            cfg: cfg.sanitized(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("fingerprint mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, hash: &FingerprintHash) -> Option<Fingerprint> {
        let g = self.inner.lock().expect("fingerprint mutex poisoned");
        g.entries.get(hash).map(|e| e.fp.clone())
    }

    /// Exact lookup, then near-duplicate scan, then insert. Duplicates bump
    /// `seen_count` on the matched fingerprint.
    pub fn check_and_insert(
        &self,
        hash: FingerprintHash,
        normalized: &str,
        batch: BatchId,
    ) -> Check {
        let now = Instant::now();
        let mut g = self.inner.lock().expect("fingerprint mutex poisoned");
        self.evict(&mut g, now);

        if g.entries.contains_key(&hash) {
            touch(&mut g, &hash, now);
            return Check::Exact(hash);
        }

        if let Some((matched, score)) = self.best_near_match(&g, normalized) {
            touch(&mut g, &matched, now);
            return Check::Near { matched, score };
        }

        g.seq += 1;
        let seq = g.seq;
        g.entries.insert(
            hash,
            Entry {
                fp: Fingerprint {
                    hash,
                    normalized_text: normalized.to_string(),
                    first_seen_batch: batch,
                    seen_count: 1,
                },
                last_seen: now,
                touch_seq: seq,
            },
        );
        g.lru.push_back((hash, seq));
        g.recent.push_back(hash);
        while g.recent.len() > self.cfg.recent_window {
            g.recent.pop_front();
        }
        self.evict(&mut g, now);
        Check::New(hash)
    }

    /// Drop expired entries; callable from a maintenance tick.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut g = self.inner.lock().expect("fingerprint mutex poisoned");
        let before = g.entries.len();
        self.evict(&mut g, now);
        before - g.entries.len()
    }

    fn best_near_match(&self, g: &Inner, normalized: &str) -> Option<(FingerprintHash, f32)> {
        let threshold = self.cfg.similarity_threshold;
        let probe: String = normalized.chars().take(self.cfg.similarity_max_chars).collect();
        let probe_len = probe.chars().count();
        let mut best: Option<(FingerprintHash, f32)> = None;

        for h in g.recent.iter().rev() {
            let Some(entry) = g.entries.get(h) else {
                continue;
            };
            let other: String = entry
                .fp
                .normalized_text
                .chars()
                .take(self.cfg.similarity_max_chars)
                .collect();
            // Edit distance is at least the length gap, so short/long pairs can be skipped.
            let other_len = other.chars().count();
            let (lo, hi) = (probe_len.min(other_len), probe_len.max(other_len));
            if hi > 0 && (lo as f32 / hi as f32) < threshold {
                continue;
            }
            let score = super::similarity(&probe, &other);
            if score >= threshold && best.map_or(true, |(_, b)| score > b) {
                best = Some((*h, score));
            }
        }
        best
    }

    fn evict(&self, g: &mut Inner, now: Instant) {
        let retention = Duration::from_secs(self.cfg.retention_secs);
        while let Some(&(hash, seq)) = g.lru.front() {
            let live = match g.entries.get(&hash) {
                Some(e) if e.touch_seq == seq => e,
                _ => {
                    g.lru.pop_front();
                    continue;
                }
            };
            let expired = now.saturating_duration_since(live.last_seen) > retention;
            if expired || g.entries.len() > self.cfg.max_entries {
                g.entries.remove(&hash);
                g.lru.pop_front();
            } else {
                break;
            }
        }
        // Repeated touches leave stale pairs behind; rebuild when they dominate.
        if g.lru.len() > g.entries.len() * 4 + 64 {
            let mut live: Vec<(FingerprintHash, u64)> =
                g.entries.iter().map(|(h, e)| (*h, e.touch_seq)).collect();
            live.sort_by_key(|(_, s)| *s);
            g.lru = live.into_iter().collect();
        }
    }
}

fn touch(g: &mut Inner, hash: &FingerprintHash, now: Instant) {
    g.seq += 1;
    let seq = g.seq;
    if let Some(e) = g.entries.get_mut(hash) {
        e.fp.seen_count += 1;
        e.last_seen = now;
        e.touch_seq = seq;
        g.lru.push_back((*hash, seq));
    }
}
