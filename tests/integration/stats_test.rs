// tests/integration/stats_test.rs

//! Site classification tests: availability, busyness, the hysteresis band
//! between them, and fail-closed behavior on missing statistics.

use super::fixtures::*;
use super::test_helpers::{FleetState, MemoryTaskBuffer};
use queuefill::core::catalog::SiteCatalog;
use queuefill::core::stats::FleetStatsProbe;

/// Classifies the state's sites, returning (available, busy) names.
async fn classify(state: FleetState) -> (Vec<String>, Vec<String>) {
    let buffer = MemoryTaskBuffer::new(state);
    let probe = FleetStatsProbe::new(buffer.clone(), "atlas");
    let catalog = SiteCatalog::new(buffer.state.lock().sites.clone());
    let available = probe.available_sites(&catalog).await.keys().cloned().collect();
    let busy = probe.busy_sites(&catalog).await.keys().cloned().collect();
    (available, busy)
}

#[tokio::test]
async fn idle_online_site_is_available() {
    // threshold = max(20, 2*10) = 20; queue 4 < 5.
    let (available, busy) = classify(base_state()).await;
    assert_eq!(available, vec![SITE_A.to_string()]);
    assert!(busy.is_empty());
}

#[tokio::test]
async fn queue_at_quarter_threshold_is_not_available() {
    let mut state = base_state();
    state.job_stats = Some(stats_with_queue(10, 5));
    let (available, busy) = classify(state).await;
    assert!(available.is_empty());
    assert!(busy.is_empty(), "queue of 5 sits in the hysteresis band");
}

#[tokio::test]
async fn crowded_queue_is_busy() {
    let mut state = base_state();
    state.job_stats = Some(stats_with_queue(10, 16));
    let (available, busy) = classify(state).await;
    assert!(available.is_empty());
    assert_eq!(busy, vec![SITE_A.to_string()]);
}

#[tokio::test]
async fn offline_site_is_busy_even_when_idle() {
    let mut state = base_state();
    state.sites[0].status = "offline".into();
    let (available, busy) = classify(state).await;
    assert!(available.is_empty());
    assert_eq!(busy, vec![SITE_A.to_string()]);
}

#[tokio::test]
async fn slow_to_run_rate_is_not_available() {
    let mut state = base_state();
    state.run_rates = Some([(SITE_A.to_string(), 0.5)].into());
    let (available, _busy) = classify(state).await;
    assert!(available.is_empty());
}

#[tokio::test]
async fn memory_floor_disqualifies_a_site() {
    let mut state = base_state();
    state.sites[0].minrss = Some(2000);
    let (available, _busy) = classify(state).await;
    assert!(available.is_empty());
}

#[tokio::test]
async fn non_production_site_is_not_available() {
    let mut state = base_state();
    state.sites[0].runs_production = false;
    let (available, _busy) = classify(state).await;
    assert!(available.is_empty());
}

#[tokio::test]
async fn missing_job_stats_classify_nothing() {
    let mut state = base_state();
    state.job_stats = None;
    state.sites[0].status = "offline".into();
    let (available, busy) = classify(state).await;
    assert!(available.is_empty());
    assert!(busy.is_empty(), "offline site must not be busy without stats");
}

#[tokio::test]
async fn missing_run_rates_classify_nothing() {
    let mut state = base_state();
    state.run_rates = None;
    state.job_stats = Some(stats_with_queue(10, 40));
    let (available, busy) = classify(state).await;
    assert!(available.is_empty());
    assert!(busy.is_empty(), "crowded site must not be busy without rates");
}

#[tokio::test]
async fn unified_pseudo_sites_collapse_first_wins() {
    let mut state = base_state();
    let mut twin = site_a();
    twin.name = "SITE_A_CLOUD".into();
    twin.status = "offline".into();
    state.sites.push(twin);
    let (available, busy) = classify(state).await;
    // The first pseudo site in catalog order decides the classification.
    assert_eq!(available, vec![SITE_A.to_string()]);
    assert!(busy.is_empty());
}
