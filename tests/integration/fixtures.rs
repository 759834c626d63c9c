// tests/integration/fixtures.rs

//! Canonical fleet fixtures shared by the scenario and property tests: one
//! production site with one eligible task, and the knobs to degrade it.

use super::test_helpers::{DatasetRow, FleetState, MemoryTaskBuffer, TaskRow};
use indexmap::IndexMap;
use queuefill::core::reconciler::QueueFiller;
use queuefill::core::types::{JobStats, ResourceType, SiteCapability, SiteSpec};
use std::sync::Arc;

pub const SITE_A: &str = "SITE_A";
pub const RSE_1: &str = "RSE_1";
pub const SCORE: &str = "SCORE";
pub const MANAGED: &str = "managed";

/// An online multi-core production site with a single input RSE.
pub fn site_a() -> SiteSpec {
    SiteSpec {
        name: SITE_A.into(),
        unified_name: SITE_A.into(),
        status: "online".into(),
        runs_production: true,
        minrss: Some(0),
        maxrss: Some(16000),
        core_count: 8,
        is_unified: false,
        capability: SiteCapability::Mcore,
        fairshare_policy: None,
        ddm_endpoints_input: IndexMap::from([("default".to_string(), vec![RSE_1.to_string()])]),
    }
}

/// Job statistics with the given running and queued counts at SITE_A.
pub fn stats_with_queue(n_running: u64, n_queue: u64) -> JobStats {
    let mut stats = JobStats::default();
    stats.add(SITE_A, "prod", "running", n_running);
    stats.add(SITE_A, "prod", "activated", n_queue);
    stats
}

/// The canonical world: SITE_A idle (threshold 20, queue 4), to-running rate
/// 0.9, and task 42 eligible for preassignment.
pub fn base_state() -> FleetState {
    let mut state = FleetState {
        sites: vec![site_a()],
        job_stats: Some(stats_with_queue(10, 4)),
        run_rates: Some([(SITE_A.to_string(), 0.9)].into()),
        resource_types: vec![ResourceType {
            resource_name: SCORE.into(),
        }],
        ..FleetState::default()
    };
    state.tasks.insert(42, TaskRow::ready(42, SCORE));
    state.datasets.push(DatasetRow::input(42, 200, 100));
    state.locality.insert((42, RSE_1.to_string()));
    state
}

/// A controller replica over `buffer` with a distinguishable lock owner tag.
pub fn controller(buffer: Arc<MemoryTaskBuffer>, pid: &str) -> QueueFiller {
    QueueFiller::with_pid(buffer, "atlas", vec![MANAGED.to_string()], false, pid)
}

/// Same, but in dry-run mode.
pub fn dry_run_controller(buffer: Arc<MemoryTaskBuffer>, pid: &str) -> QueueFiller {
    QueueFiller::with_pid(buffer, "atlas", vec![MANAGED.to_string()], true, pid)
}
