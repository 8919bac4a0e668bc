//! # Source health tracker
//! Per-source circuit breaker shared by every batch.
//!
//! - Closed: tasks are dispatched; consecutive failures are counted.
//! - Open: reaching `failure_threshold` disables the source until the cooldown
//!   elapses. Tasks for it are skipped without dispatch.
//! - Half-open: after the cooldown exactly one task is admitted as a trial. Its
//!   success closes the breaker; its failure re-opens it with a doubled cooldown.
//!
//! All transitions happen under one mutex, so two batches can never both read
//! "below threshold" for the same failure.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::model::{SourceHealth, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub max_cooldown_secs: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
            max_cooldown_secs: 3_600,
        }
    }
}

impl BreakerPolicy {
    pub fn sanitized(mut self) -> Self {
        self.failure_threshold = self.failure_threshold.max(1);
        self.max_cooldown_secs = self.max_cooldown_secs.max(self.cooldown_secs);
        self
    }

    /// Cooldown for the n-th consecutive trip (1-based).
    pub fn cooldown_for(&self, trips: u32) -> Duration {
        let exp = trips.saturating_sub(1).min(20);
        let secs = self
            .cooldown_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_cooldown_secs);
        Duration::from_secs(secs)
    }
}

/// Dispatch decision for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Closed,
    /// Half-open trial; the caller owns the single trial slot until it
    /// reports an outcome or calls `abandon_trial`.
    Trial,
    Rejected { retry_in: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    consecutive_failures: u32,
    trips: u32,
    state: BreakerState,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            trips: 0,
            state: BreakerState::Closed,
        }
    }
}

#[derive(Debug)]
pub struct HealthTracker {
    policy: BreakerPolicy,
    inner: Mutex<HashMap<SourceId, Entry>>,
}

impl HealthTracker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy: policy.sanitized(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// Non-claiming availability check.
    pub fn is_available(&self, source: &SourceId) -> bool {
        let map = self.inner.lock().expect("health mutex poisoned");
        match map.get(source).map(|e| e.state) {
            None | Some(BreakerState::Closed) => true,
            Some(BreakerState::Open { until }) => Instant::now() >= until,
            Some(BreakerState::HalfOpen { trial_in_flight }) => !trial_in_flight,
        }
    }

    /// Claiming check used at dispatch time.
    pub fn admit(&self, source: &SourceId) -> Admission {
        let now = Instant::now();
        let mut map = self.inner.lock().expect("health mutex poisoned");
        let entry = map.entry(source.clone()).or_default();
        match entry.state {
            BreakerState::Closed => Admission::Closed,
            BreakerState::Open { until } if now >= until => {
                entry.state = BreakerState::HalfOpen {
                    trial_in_flight: true,
                };
                tracing::info!(target: "health", source = %source, "circuit half-open, admitting trial");
                Admission::Trial
            }
            BreakerState::Open { until } => Admission::Rejected {
                retry_in: until - now,
            },
            BreakerState::HalfOpen {
                trial_in_flight: true,
            } => Admission::Rejected {
                retry_in: Duration::ZERO,
            },
            BreakerState::HalfOpen {
                trial_in_flight: false,
            } => {
                entry.state = BreakerState::HalfOpen {
                    trial_in_flight: true,
                };
                Admission::Trial
            }
        }
    }

    /// `trial` says whether the reporting task held the half-open trial slot.
    /// Only the trial may close a breaker that is not already closed; a late
    /// success from an earlier admission just clears the failure streak.
    pub fn record_success(&self, source: &SourceId, trial: bool) {
        let mut map = self.inner.lock().expect("health mutex poisoned");
        let entry = map.entry(source.clone()).or_default();
        match entry.state {
            BreakerState::Closed => *entry = Entry::default(),
            BreakerState::HalfOpen { .. } if trial => {
                tracing::info!(target: "health", source = %source, "circuit closed");
                *entry = Entry::default();
            }
            _ => {
                tracing::debug!(target: "health", source = %source, "late success ignored while circuit is not closed");
                entry.consecutive_failures = 0;
            }
        }
    }

    pub fn record_failure(&self, source: &SourceId, trial: bool) {
        let now = Instant::now();
        let mut map = self.inner.lock().expect("health mutex poisoned");
        let entry = map.entry(source.clone()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        let trip = match entry.state {
            BreakerState::HalfOpen { .. } => trial,
            BreakerState::Closed => entry.consecutive_failures >= self.policy.failure_threshold,
            // Late result of a task admitted before the breaker opened.
            BreakerState::Open { .. } => false,
        };
        if trip {
            entry.trips = entry.trips.saturating_add(1);
            let cooldown = self.policy.cooldown_for(entry.trips);
            entry.state = BreakerState::Open {
                until: now + cooldown,
            };
            counter!("source_circuit_open_total").increment(1);
            tracing::warn!(
                target: "health",
                source = %source,
                failures = entry.consecutive_failures,
                trips = entry.trips,
                cooldown_secs = cooldown.as_secs(),
                "circuit opened"
            );
        }
    }

    /// Give back a trial slot whose task was cancelled before reporting.
    pub fn abandon_trial(&self, source: &SourceId) {
        let mut map = self.inner.lock().expect("health mutex poisoned");
        if let Some(entry) = map.get_mut(source) {
            if entry.state
                == (BreakerState::HalfOpen {
                    trial_in_flight: true,
                })
            {
                entry.state = BreakerState::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }

    pub fn snapshot(&self, source: &SourceId) -> SourceHealth {
        let map = self.inner.lock().expect("health mutex poisoned");
        let entry = map.get(source).copied().unwrap_or_default();
        to_health(source, &entry)
    }

    pub fn snapshot_all(&self) -> Vec<SourceHealth> {
        let map = self.inner.lock().expect("health mutex poisoned");
        let mut out: Vec<SourceHealth> = map.iter().map(|(s, e)| to_health(s, e)).collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        out
    }
}

fn to_health(source: &SourceId, entry: &Entry) -> SourceHealth {
    let (disabled, disabled_until) = match entry.state {
        BreakerState::Closed => (false, None),
        BreakerState::Open { until } => {
            let remaining = until.saturating_duration_since(Instant::now());
            let until_utc = chrono::Duration::from_std(remaining)
                .ok()
                .map(|d| Utc::now() + d);
            (true, until_utc)
        }
        BreakerState::HalfOpen { .. } => (true, None),
    };
    SourceHealth {
        source_id: source.clone(),
        consecutive_failures: entry.consecutive_failures,
        disabled,
        disabled_until,
        trips: entry.trips,
    }
}
