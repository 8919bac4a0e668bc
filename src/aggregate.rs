//! Pure fold of a finished batch into its summary. No I/O.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::dedup::DedupOutcome;
use crate::model::{
    Batch, BatchId, BatchStatus, EnrichmentResult, Recommendation, RiskLevel, Sentiment,
    SourceId, TaskStatus,
};

const MAX_INSIGHTS: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupCounts {
    pub raw: usize,
    pub unique: usize,
    pub duplicates: usize,
    pub filtered: usize,
}

impl DedupCounts {
    pub fn from_outcome(raw: usize, outcome: &DedupOutcome) -> Self {
        Self {
            raw,
            unique: outcome.unique.len(),
            duplicates: outcome.duplicates.len(),
            filtered: outcome.filtered,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub unfinished: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentCounts {
    /// Fresh analyzer calls made for this batch.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reused: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub overall_status: BatchStatus,
    pub tasks: TaskCounts,
    pub items_per_source: BTreeMap<SourceId, usize>,
    pub dedup: DedupCounts,
    pub enrichment: EnrichmentCounts,
    pub sentiment: BTreeMap<Sentiment, usize>,
    pub risk: BTreeMap<RiskLevel, usize>,
    pub recommendation: BTreeMap<Recommendation, usize>,
    pub average_confidence: Option<f32>,
    pub symbols: Vec<String>,
    pub tge_dates: Vec<String>,
    pub key_insights: Vec<String>,
    pub text_summary: String,
}

pub fn aggregate(batch: &Batch, dedup: DedupCounts, results: &[EnrichmentResult]) -> BatchSummary {
    let mut tasks = TaskCounts::default();
    let mut items_per_source = BTreeMap::new();
    for t in batch.tasks.values() {
        match t.status {
            TaskStatus::Succeeded => tasks.succeeded += 1,
            TaskStatus::Failed => tasks.failed += 1,
            TaskStatus::TimedOut => tasks.timed_out += 1,
            TaskStatus::Skipped => tasks.skipped += 1,
            TaskStatus::Pending | TaskStatus::Running => tasks.unfinished += 1,
        }
        items_per_source.insert(t.source_id.clone(), t.items_found);
    }

    let mut enrichment = EnrichmentCounts::default();
    let mut sentiment = BTreeMap::new();
    let mut risk = BTreeMap::new();
    let mut recommendation = BTreeMap::new();
    let mut symbols = BTreeSet::new();
    let mut tge_dates = BTreeSet::new();
    let mut confidence_sum = 0.0f64;

    for r in results {
        if r.reused {
            enrichment.reused += 1;
        } else {
            enrichment.attempted += 1;
        }
        if !r.is_success() {
            enrichment.failed += 1;
            continue;
        }
        enrichment.succeeded += 1;
        *sentiment.entry(r.sentiment).or_insert(0) += 1;
        *risk.entry(r.risk_level).or_insert(0) += 1;
        *recommendation.entry(r.recommendation).or_insert(0) += 1;
        confidence_sum += f64::from(r.confidence_score);
        if let Some(s) = &r.extracted_symbol {
            symbols.insert(s.clone());
        }
        if let Some(d) = &r.tge_date {
            tge_dates.insert(d.clone());
        }
    }

    let average_confidence = (enrichment.succeeded > 0)
        .then(|| (confidence_sum / enrichment.succeeded as f64) as f32);

    let key_insights = key_insights(
        enrichment.succeeded,
        &risk,
        &recommendation,
        average_confidence,
        &items_per_source,
    );
    let text_summary = text_summary(batch, &tasks, &dedup);

    BatchSummary {
        batch_id: batch.id,
        overall_status: batch.overall_status(),
        tasks,
        items_per_source,
        dedup,
        enrichment,
        sentiment,
        risk,
        recommendation,
        average_confidence,
        symbols: symbols.into_iter().collect(),
        tge_dates: tge_dates.into_iter().collect(),
        key_insights,
        text_summary,
    }
}

fn key_insights(
    analyzed: usize,
    risk: &BTreeMap<RiskLevel, usize>,
    recommendation: &BTreeMap<Recommendation, usize>,
    average_confidence: Option<f32>,
    items_per_source: &BTreeMap<SourceId, usize>,
) -> Vec<String> {
    let mut out = Vec::new();

    if analyzed > 0 {
        let positive: usize = recommendation
            .iter()
            .filter(|(r, _)| r.is_positive())
            .map(|(_, n)| n)
            .sum();
        if positive > 0 {
            out.push(format!(
                "{:.1}% of analyzed items carry a positive recommendation",
                positive as f64 * 100.0 / analyzed as f64
            ));
        }
        let high = risk.get(&RiskLevel::High).copied().unwrap_or(0);
        if high > 0 {
            out.push(format!(
                "{:.1}% of analyzed items are rated high risk",
                high as f64 * 100.0 / analyzed as f64
            ));
        }
    }
    if let Some(avg) = average_confidence {
        out.push(format!("average analysis confidence is {avg:.2}"));
    }
    // Ties go to the first source id.
    let top = items_per_source
        .iter()
        .filter(|(_, n)| **n > 0)
        .fold(None::<(&SourceId, usize)>, |best, (s, n)| match best {
            Some((_, b)) if b >= *n => best,
            _ => Some((s, *n)),
        });
    if let Some((source, n)) = top {
        out.push(format!("most content came from {source} ({n} items)"));
    }

    if out.is_empty() {
        out.push("not enough data for insights".to_string());
    }
    out.truncate(MAX_INSIGHTS);
    out
}

fn text_summary(batch: &Batch, tasks: &TaskCounts, dedup: &DedupCounts) -> String {
    let per_source: Vec<String> = batch
        .tasks
        .values()
        .map(|t| match t.status {
            TaskStatus::Succeeded => format!("{}: {} items", t.source_id, t.items_found),
            other => format!("{}: {}", t.source_id, status_word(other)),
        })
        .collect();
    format!(
        "Batch {id}\n\
         - sources: {total}\n\
         - succeeded: {ok}\n\
         - not succeeded: {bad}\n\
         - raw items: {raw}, unique: {unique}\n\
         - per source: {per_source}\n\
         - keywords: {keywords}",
        id = batch.id,
        total = batch.tasks.len(),
        ok = tasks.succeeded,
        bad = tasks.failed + tasks.timed_out + tasks.skipped,
        raw = dedup.raw,
        unique = dedup.unique,
        per_source = per_source.join(", "),
        keywords = batch.keywords.join(", "),
    )
}

fn status_word(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::TimedOut => "timed out",
        TaskStatus::Skipped => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnrichmentStatus;

    fn ok(n: u8, rec: Recommendation, risk: RiskLevel, conf: f32, reused: bool) -> EnrichmentResult {
        EnrichmentResult {
            fingerprint_hash: [n; 32],
            sentiment: Sentiment::Positive,
            recommendation: rec,
            risk_level: risk,
            confidence_score: conf,
            extracted_symbol: Some(format!("SYM{n}")),
            tge_date: None,
            status: EnrichmentStatus::Succeeded,
            error: None,
            reused,
        }
    }

    fn finished_batch() -> Batch {
        let ids = [SourceId::new("a"), SourceId::new("b"), SourceId::new("c")];
        let mut b = Batch::new(&ids, vec!["tge".into()], 10);
        for (id, status, n) in [
            (&ids[0], TaskStatus::Succeeded, 10),
            (&ids[1], TaskStatus::Succeeded, 5),
            (&ids[2], TaskStatus::Failed, 0),
        ] {
            let t = b.task_mut(id).unwrap();
            t.status = status;
            t.items_found = n;
        }
        b
    }

    #[test]
    fn counts_and_distributions() {
        let batch = finished_batch();
        let results = vec![
            ok(1, Recommendation::Buy, RiskLevel::Low, 0.8, false),
            ok(2, Recommendation::Avoid, RiskLevel::High, 0.4, true),
            EnrichmentResult::failed([3; 32], "timeout"),
        ];
        let s = aggregate(
            &batch,
            DedupCounts { raw: 15, unique: 2, duplicates: 12, filtered: 1 },
            &results,
        );
        assert_eq!(s.overall_status, BatchStatus::Completed);
        assert_eq!(s.tasks.succeeded, 2);
        assert_eq!(s.tasks.failed, 1);
        assert_eq!(s.items_per_source[&SourceId::new("a")], 10);
        assert_eq!(s.enrichment.attempted, 2);
        assert_eq!(s.enrichment.reused, 1);
        assert_eq!(s.enrichment.failed, 1);
        assert_eq!(s.risk[&RiskLevel::High], 1);
        assert!((s.average_confidence.unwrap() - 0.6).abs() < 1e-6);
        assert_eq!(s.symbols, vec!["SYM1".to_string(), "SYM2".to_string()]);
        assert!(s.key_insights.iter().any(|i| i.starts_with("50.0% of analyzed items carry")));
        assert!(s.key_insights.iter().any(|i| i.contains("most content came from a (10 items)")));
        assert!(s.text_summary.contains("c: failed"));
    }

    #[test]
    fn empty_results_still_summarize() {
        let batch = Batch::new(&[], vec!["tge".into()], 5);
        let s = aggregate(&batch, DedupCounts::default(), &[]);
        assert_eq!(s.overall_status, BatchStatus::Completed);
        assert_eq!(s.average_confidence, None);
        assert_eq!(s.key_insights, vec!["not enough data for insights".to_string()]);
    }
}
