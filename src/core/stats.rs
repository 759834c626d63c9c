// src/core/stats.rs

//! Classifies sites as available or busy from live fleet statistics.
//!
//! Two inputs feed the classification: per-site job counts grouped by global
//! share, and the per-site to-running rate over a trailing window. If either
//! input is missing the probe fails closed and classifies nothing, so a
//! statistics outage never triggers preassignments or undos.

use crate::core::catalog::SiteCatalog;
use crate::core::taskbuffer::TaskBuffer;
use crate::core::types::{JobStats, SiteSpec};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Trailing window over which the to-running rate is measured.
pub const TO_RUN_RATE_WINDOW: Duration = Duration::from_secs(86_400); // 24 hours
/// The most recent slice excluded from the window, where job state is still
/// settling.
pub const TO_RUN_RATE_CUTOFF: Duration = Duration::from_secs(21_600); // 6 hours
/// How long a fetched rate map stays fresh.
const TO_RUN_RATE_CACHE_LIFETIME: Duration = Duration::from_secs(600); // 10 minutes

/// Minimum to-running rate (jobs per hour) for a site to count as active.
pub const MIN_TO_RUN_RATE: f64 = 0.8;

/// Job statuses counted as queued at a site.
const QUEUED_JOB_STATUSES: [&str; 2] = ["activated", "starting"];

struct RateCacheEntry {
    fetched_at: Instant,
    rates: HashMap<String, f64>,
}

/// Derives site classifications from fleet statistics.
pub struct FleetStatsProbe {
    buffer: Arc<dyn TaskBuffer>,
    vo: String,
    rate_cache: Mutex<Option<RateCacheEntry>>,
}

impl FleetStatsProbe {
    pub fn new(buffer: Arc<dyn TaskBuffer>, vo: &str) -> Self {
        Self {
            buffer,
            vo: vo.to_string(),
            rate_cache: Mutex::new(None),
        }
    }

    /// The to-running rate map, refreshed at most every ten minutes.
    /// `None` when the statistics source is unavailable.
    async fn to_run_rates(&self) -> Option<HashMap<String, f64>> {
        {
            let cache = self.rate_cache.lock();
            if let Some(entry) = cache.as_ref() {
                if entry.fetched_at.elapsed() < TO_RUN_RATE_CACHE_LIFETIME {
                    return Some(entry.rates.clone());
                }
            }
        }
        match self
            .buffer
            .site_to_run_rate_stats(&self.vo, TO_RUN_RATE_WINDOW, TO_RUN_RATE_CUTOFF)
            .await
        {
            Ok(rates) => {
                *self.rate_cache.lock() = Some(RateCacheEntry {
                    fetched_at: Instant::now(),
                    rates: rates.clone(),
                });
                Some(rates)
            }
            Err(e) => {
                warn!("Failed to fetch site to-running rate stats: {}", e);
                None
            }
        }
    }

    /// Both classification inputs, or `None` when either is missing.
    async fn inputs(&self) -> Option<(JobStats, HashMap<String, f64>)> {
        let stats = match self.buffer.job_statistics_by_global_share(&self.vo).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Failed to fetch job statistics by global share: {}", e);
                return None;
            }
        };
        let rates = self.to_run_rates().await?;
        Some((stats, rates))
    }

    fn n_queue(stats: &JobStats, site: &str) -> u64 {
        QUEUED_JOB_STATUSES
            .iter()
            .map(|status| stats.n_jobs(site, status))
            .sum()
    }

    fn queue_threshold(stats: &JobStats, site: &str) -> f64 {
        let n_running = stats.n_jobs(site, "running") as f64;
        (2.0 * n_running).max(20.0)
    }

    /// Sites idle enough to receive preassignments: online production sites
    /// without a memory floor, with recent to-running activity, and with a
    /// queue below a quarter of the threshold.
    pub async fn available_sites(&self, catalog: &SiteCatalog) -> IndexMap<String, SiteSpec> {
        let Some((stats, rates)) = self.inputs().await else {
            return IndexMap::new();
        };
        let mut available = IndexMap::new();
        for (unified_name, spec) in catalog.unified_specs() {
            if !spec.is_online() || !spec.runs_production || spec.has_memory_floor() {
                continue;
            }
            match rates.get(&unified_name) {
                Some(&rate) if rate >= MIN_TO_RUN_RATE => {}
                _ => continue,
            }
            let n_queue = Self::n_queue(&stats, &unified_name) as f64;
            if n_queue < 0.25 * Self::queue_threshold(&stats, &unified_name) {
                available.insert(unified_name, spec.clone());
            }
        }
        available
    }

    /// Sites whose preassignments should be released: offline, or with a
    /// queue above three quarters of the threshold.
    pub async fn busy_sites(&self, catalog: &SiteCatalog) -> IndexMap<String, SiteSpec> {
        let Some((stats, _rates)) = self.inputs().await else {
            return IndexMap::new();
        };
        let mut busy = IndexMap::new();
        for (unified_name, spec) in catalog.unified_specs() {
            let n_queue = Self::n_queue(&stats, &unified_name) as f64;
            if !spec.is_online() || n_queue > 0.75 * Self::queue_threshold(&stats, &unified_name)
            {
                busy.insert(unified_name, spec.clone());
            }
        }
        busy
    }
}
