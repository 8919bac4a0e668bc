// tests/circuit_breaker.rs
//
// Breaker behaviour across batches: a source that keeps failing is skipped
// without dispatch until a successful probe plus a successful trial.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tge_batch_orchestrator::config::PipelineConfig;
use tge_batch_orchestrator::error::SourceError;
use tge_batch_orchestrator::model::{SourceId, TaskStatus};
use tge_batch_orchestrator::service::BatchService;

async fn status_of(svc: &Arc<BatchService>, source: &str) -> (TaskStatus, Option<String>) {
    let record = svc.run_batch(request(&[source])).await.unwrap();
    let task = &record.batch.tasks[&SourceId::new(source)];
    (task.status, task.error.clone())
}

#[tokio::test(start_paused = true)]
async fn open_circuit_skips_until_probe_and_trial_succeed() {
    let flaky = Arc::new(FakeSource::failing("flaky", SourceError::ParseFailed("layout changed".into())));
    let svc = mock_service(&PipelineConfig::default(), registry(&[flaky.clone()]));

    for _ in 0..3 {
        assert_eq!(status_of(&svc, "flaky").await.0, TaskStatus::Failed);
    }
    assert_eq!(flaky.calls(), 3);

    // Open: skipped and never dispatched.
    let (status, err) = status_of(&svc, "flaky").await;
    assert_eq!(status, TaskStatus::Skipped);
    assert!(err.unwrap().contains("circuit open"));
    assert_eq!(flaky.calls(), 3);
    assert_eq!(flaky.probes(), 0);
    assert!(svc.source_health()[0].disabled);

    // Half-open with a failing probe: counts as a failure, cooldown doubles.
    tokio::time::advance(Duration::from_secs(61)).await;
    flaky.set_probe(false);
    let (status, err) = status_of(&svc, "flaky").await;
    assert_eq!(status, TaskStatus::Skipped);
    assert_eq!(err.as_deref(), Some("health probe failed"));
    assert_eq!(flaky.calls(), 3);
    assert_eq!(flaky.probes(), 1);
    assert_eq!(svc.source_health()[0].trips, 2);

    // Still inside the doubled cooldown.
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(status_of(&svc, "flaky").await.0, TaskStatus::Skipped);
    assert_eq!(flaky.probes(), 1);

    // Probe passes and the trial search succeeds: breaker closes.
    tokio::time::advance(Duration::from_secs(60)).await;
    flaky.set_probe(true);
    flaky.set_fallback(Ok(items("flaky", 3)));
    assert_eq!(status_of(&svc, "flaky").await.0, TaskStatus::Succeeded);
    assert_eq!(flaky.calls(), 4);
    assert_eq!(flaky.probes(), 2);

    let health = &svc.source_health()[0];
    assert!(!health.disabled);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.trips, 0);

    // Closed again: regular dispatch, no probe.
    assert_eq!(status_of(&svc, "flaky").await.0, TaskStatus::Succeeded);
    assert_eq!(flaky.probes(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_trial_reopens_with_longer_cooldown() {
    let flaky = Arc::new(FakeSource::failing("flaky", SourceError::AuthFailed("banned".into())));
    let svc = mock_service(&PipelineConfig::default(), registry(&[flaky.clone()]));

    for _ in 0..3 {
        status_of(&svc, "flaky").await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    // Probe ok, search fails again.
    assert_eq!(status_of(&svc, "flaky").await.0, TaskStatus::Failed);
    assert_eq!(flaky.calls(), 4);
    let health = &svc.source_health()[0];
    assert!(health.disabled);
    assert_eq!(health.trips, 2);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(status_of(&svc, "flaky").await.0, TaskStatus::Skipped);
    assert_eq!(flaky.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn healthy_sources_are_unaffected_by_a_broken_one() {
    let broken = Arc::new(FakeSource::failing("broken", SourceError::AuthFailed("x".into())));
    let good = Arc::new(FakeSource::ok("good", items("good", 2)));
    let svc = mock_service(&PipelineConfig::default(), registry(&[broken.clone(), good.clone()]));

    for _ in 0..4 {
        svc.run_batch(request(&["broken", "good"])).await.unwrap();
    }
    assert_eq!(broken.calls(), 3);
    assert_eq!(good.calls(), 4);

    let record = svc.run_batch(request(&[])).await.unwrap();
    assert_eq!(record.batch.tasks.len(), 2);
    assert_eq!(record.batch.tasks[&SourceId::new("broken")].status, TaskStatus::Skipped);
    assert_eq!(record.batch.tasks[&SourceId::new("good")].status, TaskStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn late_success_from_before_the_trip_keeps_circuit_open() {
    let late = Arc::new(
        FakeSource::failing("late", SourceError::AuthFailed("cookie expired".into()))
            .then_after(Duration::from_secs(10), Ok(items("late", 2))),
    );
    late.set_probe(false);
    let svc = mock_service(&PipelineConfig::default(), registry(&[late.clone()]));

    // First search hangs for ten seconds and then succeeds.
    let slow = svc.submit_batch(request(&["late"])).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(late.calls(), 1);

    for _ in 0..3 {
        assert_eq!(status_of(&svc, "late").await.0, TaskStatus::Failed);
    }
    assert!(svc.source_health()[0].disabled);

    let record = svc.wait_batch(slow).await.unwrap();
    assert_eq!(record.batch.tasks[&SourceId::new("late")].status, TaskStatus::Succeeded);

    let health = &svc.source_health()[0];
    assert!(health.disabled);
    assert_eq!(health.trips, 1);
    assert_eq!(health.consecutive_failures, 0);

    let (status, err) = status_of(&svc, "late").await;
    assert_eq!(status, TaskStatus::Skipped);
    assert!(err.unwrap().contains("circuit open"));
    assert_eq!(late.calls(), 4);
    assert_eq!(late.probes(), 0);
}
