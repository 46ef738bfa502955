mod common;

use std::time::Duration;

use common::{harness, FakeSite};
use hotreel_core::{JobState, ScrapeConfig};

const MINUTE: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn idle_tick_starts_the_next_run_and_rearms() {
    let site = FakeSite::with_items(2, 0);
    let (orchestrator, sink) = harness(&site);

    orchestrator
        .start(ScrapeConfig::recurring(2, true, 30))
        .await
        .expect("start");
    orchestrator.wait_idle().await;
    assert_eq!(sink.primary_batches().len(), 1);
    let status = orchestrator.status().await;
    assert!(status.next_update_at.is_some());
    assert!(status.last_update_at.is_none());

    tokio::time::sleep(30 * MINUTE + Duration::from_secs(1)).await;
    orchestrator.wait_idle().await;

    assert_eq!(sink.primary_batches().len(), 2);
    let status = orchestrator.status().await;
    assert!(status.last_update_at.is_some());
    assert!(status.next_update_at.is_some());
    let last = status.last_job.expect("second run");
    assert!(last.config.auto_update);
    assert_eq!(last.state, JobState::Completed);

    orchestrator.stop().await;
    assert!(orchestrator.status().await.next_update_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn tick_during_an_active_run_is_skipped() {
    let site = FakeSite::with_items(2, 0);
    site.gate_at(1);
    let (orchestrator, sink) = harness(&site);

    orchestrator
        .start(ScrapeConfig::recurring(2, true, 30))
        .await
        .expect("start");
    site.blocked.notified().await;

    tokio::time::sleep(31 * MINUTE).await;

    // still the first run, and the timer was armed again instead of queueing
    assert_eq!(site.home_visits(), 1);
    let status = orchestrator.status().await;
    assert!(status.is_running);
    assert!(status.next_update_at.is_some());
    assert!(status.last_update_at.is_none());

    site.release_gate();
    orchestrator.wait_idle().await;
    assert_eq!(sink.primary_batches().len(), 1);

    // the re-armed tick fires at the hour mark and finds the controller idle
    tokio::time::sleep(30 * MINUTE).await;
    orchestrator.wait_idle().await;
    assert_eq!(site.home_visits(), 2);
    assert_eq!(sink.primary_batches().len(), 2);

    orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_disarms_recurrence() {
    let site = FakeSite::with_items(1, 0);
    let (orchestrator, sink) = harness(&site);

    orchestrator
        .start(ScrapeConfig::recurring(1, true, 30))
        .await
        .expect("start");
    orchestrator.wait_idle().await;
    assert!(!orchestrator.stop().await);

    tokio::time::sleep(2 * 60 * MINUTE).await;
    assert_eq!(sink.primary_batches().len(), 1);
    assert_eq!(site.home_visits(), 1);
    assert!(orchestrator.status().await.next_update_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn one_shot_runs_never_arm_a_timer() {
    let site = FakeSite::with_items(1, 0);
    let (orchestrator, sink) = harness(&site);

    orchestrator
        .start(ScrapeConfig::once(1, true))
        .await
        .expect("start");
    orchestrator.wait_idle().await;
    assert!(orchestrator.status().await.next_update_at.is_none());

    tokio::time::sleep(90 * MINUTE).await;
    assert_eq!(sink.primary_batches().len(), 1);
}
