// tests/batch_e2e.rs
//
// End-to-end runs through the batch service: fetch, dedup, enrichment and
// summary, with scripted sources and a counting analyzer.

mod common;

use std::sync::Arc;

use common::*;
use tge_batch_orchestrator::config::PipelineConfig;
use tge_batch_orchestrator::error::{BatchError, SourceError};
use tge_batch_orchestrator::model::{BatchStatus, SourceId, TaskStatus};
use tge_batch_orchestrator::service::StageName;

#[tokio::test(start_paused = true)]
async fn three_sources_partial_success() {
    let a = Arc::new(FakeSource::ok("a", items("a", 10)));
    let b = Arc::new(
        FakeSource::ok("b", items("b", 5)).then(Err(SourceError::RateLimited { retry_after: None })),
    );
    let c = Arc::new(FakeSource::failing("c", SourceError::AuthFailed("expired cookie".into())));
    let analyzer = Arc::new(CountingAnalyzer::default());
    let svc = service_with(
        &PipelineConfig::default(),
        registry(&[a.clone(), b.clone(), c.clone()]),
        analyzer.clone(),
    );

    let record = svc.run_batch(request(&["a", "b", "c"])).await.unwrap();

    assert_eq!(record.batch.overall_status(), BatchStatus::Completed);
    assert_eq!(record.stage, StageName::Finished);
    let task = |id: &str| record.batch.tasks[&SourceId::new(id)].clone();
    assert_eq!(task("a").status, TaskStatus::Succeeded);
    assert_eq!(task("a").items_found, 10);
    assert_eq!(task("b").status, TaskStatus::Succeeded);
    assert_eq!(task("b").items_found, 5);
    assert_eq!(task("b").attempt_count, 2);
    assert_eq!(task("c").status, TaskStatus::Failed);
    assert_eq!(task("c").attempt_count, 1);
    assert!(task("c").error.unwrap().contains("expired cookie"));

    let outcome = record.outcome.expect("finished batch has an outcome");
    let s = &outcome.summary;
    assert_eq!(s.dedup.raw, 15);
    assert_eq!(s.dedup.unique, 15);
    assert_eq!(s.enrichment.attempted, 15);
    assert_eq!(s.enrichment.succeeded, 15);
    assert_eq!(
        s.tasks.succeeded + s.tasks.failed + s.tasks.timed_out + s.tasks.skipped,
        3
    );
    assert_eq!(analyzer.calls(), 15);

    // Items are grouped by source id and keep each source's order.
    assert_eq!(outcome.items[0].external_id, "a-0");
    assert_eq!(outcome.items[10].external_id, "b-0");
    assert_eq!(c.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_batch_reuses_stored_results() {
    let a = Arc::new(FakeSource::ok("a", items("a", 4)));
    let analyzer = Arc::new(CountingAnalyzer::default());
    let svc = service_with(&PipelineConfig::default(), registry(&[a.clone()]), analyzer.clone());

    let first = svc.run_batch(request(&["a"])).await.unwrap();
    let second = svc.run_batch(request(&["a"])).await.unwrap();

    let first = first.outcome.unwrap();
    let second = second.outcome.unwrap();
    assert_eq!(first.summary.dedup.unique, 4);
    assert_eq!(second.summary.dedup.unique, 0);
    assert_eq!(second.summary.dedup.duplicates, 4);
    assert_eq!(second.summary.enrichment.attempted, 0);
    assert_eq!(second.summary.enrichment.reused, 4);
    assert!(second.results.iter().all(|r| r.reused && r.is_success()));
    assert_eq!(analyzer.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn enrichment_failure_is_isolated() {
    let mut batch_items = items("a", 3);
    batch_items.push(item("a", "bad", "TGE poison pill that the analyzer cannot parse at all"));
    let a = Arc::new(FakeSource::ok("a", batch_items));
    let analyzer = Arc::new(CountingAnalyzer::default());
    let svc = service_with(&PipelineConfig::default(), registry(&[a]), analyzer.clone());

    let record = svc.run_batch(request(&["a"])).await.unwrap();
    let outcome = record.outcome.unwrap();
    assert_eq!(outcome.results.len(), 4);
    assert_eq!(outcome.summary.enrichment.succeeded, 3);
    assert_eq!(outcome.summary.enrichment.failed, 1);
    let failed = outcome.results.iter().find(|r| !r.is_success()).unwrap();
    assert!(failed.error.as_deref().unwrap().contains("unparseable"));
    // Fatal analyzer errors are not retried.
    assert_eq!(analyzer.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn validation_errors_are_reported_up_front() {
    let a = Arc::new(FakeSource::ok("a", items("a", 1)));
    let svc = mock_service(&PipelineConfig::default(), registry(&[a]));

    let mut req = request(&["a"]);
    req.keywords = vec!["   ".into()];
    assert_eq!(svc.run_batch(req).await.unwrap_err(), BatchError::EmptyKeywords);

    let mut req = request(&["a"]);
    req.per_source_max_items = 0;
    assert_eq!(svc.run_batch(req).await.unwrap_err(), BatchError::InvalidMaxItems);

    assert_eq!(
        svc.run_batch(request(&["nope"])).await.unwrap_err(),
        BatchError::UnknownSource(SourceId::new("nope"))
    );
    assert!(svc.list_batches(10).is_empty());
}

#[tokio::test(start_paused = true)]
async fn async_submit_can_be_polled_and_listed() {
    let a = Arc::new(FakeSource::ok("a", items("a", 2)).with_delay(std::time::Duration::from_secs(1)));
    let svc = mock_service(&PipelineConfig::default(), registry(&[a]));

    let id = svc.submit_batch(request(&["a"])).unwrap();
    let early = svc.get_batch(id).unwrap();
    assert_ne!(early.stage, StageName::Finished);

    let done = svc.wait_batch(id).await.unwrap();
    assert_eq!(done.stage, StageName::Finished);
    assert_eq!(done.batch.overall_status(), BatchStatus::Completed);

    let listed = svc.list_batches(10);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert!(!svc.cancel_batch(id).unwrap());
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_in_flight_sources() {
    let slow = Arc::new(FakeSource::ok("slow", items("slow", 2)).with_delay(std::time::Duration::from_secs(60)));
    let svc = mock_service(&PipelineConfig::default(), registry(&[slow.clone()]));

    let id = svc.submit_batch(request(&["slow"])).unwrap();
    // Let the task start its search.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(svc.cancel_batch(id).unwrap());

    let done = svc.wait_batch(id).await.unwrap();
    assert!(done.cancelled);
    let task = &done.batch.tasks[&SourceId::new("slow")];
    assert_eq!(task.status, TaskStatus::TimedOut);
    assert_eq!(task.error.as_deref(), Some("batch cancelled"));
    // A user cancel is not held against the source.
    let health = svc.source_health();
    assert_eq!(health[0].consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn cleanup_drops_only_old_finished_batches() {
    let a = Arc::new(FakeSource::ok("a", items("a", 1)));
    let svc = mock_service(&PipelineConfig::default(), registry(&[a]));

    let old = svc.run_batch(request(&["a"])).await.unwrap().batch.id;
    tokio::time::advance(std::time::Duration::from_secs(3 * 3600)).await;
    let fresh = svc.run_batch(request(&["a"])).await.unwrap().batch.id;

    assert_eq!(svc.cleanup_old_batches(std::time::Duration::from_secs(3600)), 1);
    assert!(svc.get_batch(old).is_err());
    assert!(svc.get_batch(fresh).is_ok());
}

#[tokio::test(start_paused = true)]
async fn maintenance_tick_expires_stored_results() {
    let a = Arc::new(FakeSource::ok("a", items("a", 3)));
    let mut cfg = PipelineConfig::default();
    cfg.enrichment.result_retention_secs = 60;
    cfg.retention.cleanup_interval_secs = 30;
    let svc = mock_service(&cfg, registry(&[a]));

    svc.run_batch(request(&["a"])).await.unwrap();
    assert_eq!(svc.enrichment().cache().len(), 3);

    let maintenance = svc.spawn_maintenance();
    tokio::time::sleep(std::time::Duration::from_secs(95)).await;
    assert!(svc.enrichment().cache().is_empty());
    maintenance.abort();
}
