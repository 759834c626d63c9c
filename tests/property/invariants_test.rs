// tests/property/invariants_test.rs

//! Tick invariants: cap enforcement, claim disjointness, blacklist
//! exclusion, blacklist aging, and soft-undo soundness.

use crate::fixtures::*;
use crate::test_helpers::{DatasetRow, MemoryTaskBuffer, TaskRow};
use chrono::Utc;
use indexmap::IndexMap;
use proptest::prelude::*;
use queuefill::core::cache::PreassignCache;
use queuefill::core::query::GENERATING_TASK_STATUSES;
use queuefill::core::types::{BlacklistMap, TaskId};
use std::collections::HashSet;

const SITE_B: &str = "SITE_B";

fn hour_bucket(ts: i64) -> String {
    (ts - ts.rem_euclid(3600)).to_string()
}

/// Two idle production sites sharing the same input RSE, so every eligible
/// task could go to either.
fn two_site_state() -> crate::test_helpers::FleetState {
    let mut state = base_state();
    state.tasks.clear();
    state.datasets.clear();
    state.locality.clear();
    let mut site_b = site_a();
    site_b.name = SITE_B.into();
    site_b.unified_name = SITE_B.into();
    state.sites.push(site_b);
    let mut stats = stats_with_queue(10, 4);
    stats.add(SITE_B, "prod", "running", 10);
    stats.add(SITE_B, "prod", "activated", 4);
    state.job_stats = Some(stats);
    state.run_rates = Some(
        [(SITE_A.to_string(), 0.9), (SITE_B.to_string(), 0.9)].into(),
    );
    state
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn preassign_respects_cap_disjointness_and_blacklist(
        n_tasks in 0usize..20,
        cap in 1i64..=4,
        blacklist_mask in prop::collection::vec(any::<bool>(), 20),
        ram_counts in prop::collection::vec(500i64..40_000, 20),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut state = two_site_state();
            state
                .config_values
                .insert("queue_filler/MAX_PREASSIGNED_TASKS_managed".into(), cap);
            let mut blacklisted: HashSet<TaskId> = HashSet::new();
            for i in 0..n_tasks {
                let id = 100 + i as TaskId;
                let mut task = TaskRow::ready(id, SCORE);
                task.ram_count = ram_counts[i];
                task.current_priority = 1000 - i as i64;
                state.tasks.insert(id, task);
                state.datasets.push(DatasetRow::input(id, 200, 100));
                state.locality.insert((id, RSE_1.to_string()));
                if blacklist_mask[i] {
                    blacklisted.insert(id);
                }
            }
            let buffer = MemoryTaskBuffer::new(state);
            let cache = PreassignCache::new(buffer.clone());
            if !blacklisted.is_empty() {
                let mut bl = BlacklistMap::new();
                bl.insert(
                    hour_bucket(Utc::now().timestamp()),
                    blacklisted.iter().copied().collect(),
                );
                cache.store_blacklist(&bl).await.unwrap();
            }

            controller(buffer.clone(), "r1-1-dog")
                .do_preassign()
                .await
                .unwrap();

            let map = cache.load_preassigned().await.unwrap();
            let mut seen: HashSet<TaskId> = HashSet::new();
            for (key, ids) in &map {
                assert!(
                    ids.len() <= cap as usize,
                    "key {key} exceeds cap {cap}: {ids:?}"
                );
                let site = key.split('|').next().unwrap();
                for id in ids {
                    assert!(seen.insert(*id), "task {id} claimed under two keys");
                    assert!(!blacklisted.contains(id), "blacklisted task {id} picked");
                    let state = buffer.state.lock();
                    let task = &state.tasks[id];
                    // Eligibility soundness at selection time.
                    assert!(GENERATING_TASK_STATUSES.contains(&task.status.as_str()));
                    assert_eq!(task.site.as_deref(), Some(site));
                    assert!((task.ram_count as f64) < 2000.0 * task.core_count as f64);
                }
            }
        });
    }

    #[test]
    fn blacklist_buckets_age_out(
        hour_offsets in prop::collection::vec(0i64..24, 1..8),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let now = Utc::now().timestamp();
            let mut blacklist = BlacklistMap::new();
            for (i, hours) in hour_offsets.iter().enumerate() {
                blacklist
                    .entry(hour_bucket(now - hours * 3600))
                    .or_default()
                    .push(i as TaskId);
            }
            let buffer = MemoryTaskBuffer::new(base_state());
            let cache = PreassignCache::new(buffer.clone());
            cache.store_blacklist(&blacklist).await.unwrap();

            controller(buffer.clone(), "r1-1-dog")
                .undo_preassign()
                .await
                .unwrap();

            let after = cache.load_blacklist().await.unwrap();
            for hours in &hour_offsets {
                let bucket = hour_bucket(now - hours * 3600);
                // Leave the 11-12h boundary alone: bucket rounding makes it
                // depend on where inside the hour the tick lands.
                if *hours <= 10 {
                    assert!(after.contains_key(&bucket), "young bucket {bucket} purged");
                } else if *hours >= 13 {
                    assert!(!after.contains_key(&bucket), "old bucket {bucket} kept");
                }
            }
        });
    }

    #[test]
    fn soft_undo_releases_exactly_the_non_generating_tasks(
        statuses in prop::collection::vec(
            prop::sample::select(vec![
                "ready".to_string(),
                "running".to_string(),
                "scouting".to_string(),
                "paused".to_string(),
                "aborted".to_string(),
                "done".to_string(),
            ]),
            1..4
        ),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut state = base_state();
            state.tasks.clear();
            let mut cached: Vec<TaskId> = Vec::new();
            for (i, status) in statuses.iter().enumerate() {
                let id = 200 + i as TaskId;
                let mut task = TaskRow::ready(id, SCORE);
                task.status = status.clone();
                task.site = Some(SITE_A.to_string());
                state.tasks.insert(id, task);
                cached.push(id);
            }
            let buffer = MemoryTaskBuffer::new(state);
            let cache = PreassignCache::new(buffer.clone());
            let mut map = IndexMap::new();
            map.insert(format!("{SITE_A}|{SCORE}"), cached.clone());
            cache.store_preassigned(&map).await.unwrap();

            controller(buffer.clone(), "r1-1-dog")
                .undo_preassign()
                .await
                .unwrap();

            let released: Vec<TaskId> = cached
                .iter()
                .zip(&statuses)
                .filter(|(_, s)| !GENERATING_TASK_STATUSES.contains(&s.as_str()))
                .map(|(id, _)| *id)
                .collect();
            let remaining: Vec<TaskId> = cached
                .iter()
                .copied()
                .filter(|id| !released.contains(id))
                .collect();

            let after = cache.load_preassigned().await.unwrap();
            let key = format!("{SITE_A}|{SCORE}");
            if remaining.is_empty() {
                assert!(after.get(&key).is_none());
            } else {
                assert_eq!(after.get(&key), Some(&remaining));
            }
            for id in &cached {
                let expect_bound = remaining.contains(id);
                assert_eq!(
                    buffer.task_site(*id).is_some(),
                    expect_bound,
                    "task {id} binding state is wrong"
                );
            }
            let blacklist = cache.load_blacklist().await.unwrap();
            let blacklisted: HashSet<TaskId> =
                blacklist.values().flatten().copied().collect();
            let expected: HashSet<TaskId> = released.iter().copied().collect();
            assert_eq!(blacklisted, expected);
        });
    }
}
