// src/core/types.rs

//! Shared data types describing the fleet: sites, resource types, job
//! statistics, and the keys under which preassignments are tracked.

use crate::core::errors::QueueFillError;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use strum_macros::Display;

/// Identifier of a workload task in the shared database.
pub type TaskId = i64;

/// Map of `site|resourceType` key to the ordered list of preassigned task IDs.
pub type PreassignedMap = IndexMap<String, Vec<TaskId>>;

/// Map of hour-bucket unix timestamp (decimal string) to blacklisted task IDs.
pub type BlacklistMap = IndexMap<String, Vec<TaskId>>;

/// How a site schedules cores. Anything that is not explicitly unified-core
/// or multi-core is treated as a plain single-core queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SiteCapability {
    Ucore,
    Mcore,
    Single,
}

impl SiteCapability {
    /// Maps the free-form capability tag from the site catalog.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ucore" => SiteCapability::Ucore,
            "mcore" => SiteCapability::Mcore,
            _ => SiteCapability::Single,
        }
    }
}

/// Specification of a single execution site as published by the site catalog.
#[derive(Debug, Clone)]
pub struct SiteSpec {
    /// Pseudo site name under which the catalog lists this entry.
    pub name: String,
    /// Unified site name; several pseudo sites may collapse onto one.
    pub unified_name: String,
    /// Catalog status tag; only `online` sites receive preassignments.
    pub status: String,
    pub runs_production: bool,
    /// Minimum RSS requirement in MB. A site with a nonzero floor is skipped.
    pub minrss: Option<i64>,
    /// Maximum RSS in MB; `None` or 0 means effectively unbounded.
    pub maxrss: Option<i64>,
    pub core_count: i64,
    pub is_unified: bool,
    pub capability: SiteCapability,
    /// Fairshare policy string; the literal `"NULL"` counts as unset.
    pub fairshare_policy: Option<String>,
    /// Input DDM endpoint tokens, keyed by data scope.
    pub ddm_endpoints_input: IndexMap<String, Vec<String>>,
}

impl SiteSpec {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    /// Whether the site enforces a minimum memory requirement on jobs.
    pub fn has_memory_floor(&self) -> bool {
        !matches!(self.minrss, None | Some(0))
    }

    pub fn has_fairshare(&self) -> bool {
        matches!(self.fairshare_policy.as_deref(), Some(p) if p != "NULL")
    }

    /// Memory budget per core in MB, with an effectively-unbounded default
    /// when the site does not publish a limit.
    pub fn max_mem_per_core(&self) -> f64 {
        let maxrss = match self.maxrss {
            Some(v) if v != 0 => v,
            _ => 999_999,
        };
        maxrss as f64 / self.core_count as f64
    }

    /// Task core counts this site can run.
    pub fn allowed_core_counts(&self) -> Vec<i64> {
        if self.is_unified || self.capability == SiteCapability::Ucore {
            vec![1, self.core_count]
        } else if self.capability == SiteCapability::Mcore {
            vec![self.core_count]
        } else {
            vec![1]
        }
    }
}

/// A task resource type (e.g. single-core, multi-core, high-memory) as loaded
/// from the shared database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType {
    pub resource_name: String,
}

/// Per-site job counts grouped by global share and job status.
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    counts: HashMap<String, HashMap<String, HashMap<String, u64>>>,
}

impl JobStats {
    /// Accumulates a count for (site, global share, job status).
    pub fn add(&mut self, site: &str, share: &str, status: &str, n: u64) {
        *self
            .counts
            .entry(site.to_string())
            .or_default()
            .entry(share.to_string())
            .or_default()
            .entry(status.to_string())
            .or_default() += n;
    }

    /// Number of jobs in `status` at `site`, summed over all global shares.
    pub fn n_jobs(&self, site: &str, status: &str) -> u64 {
        self.counts
            .get(site)
            .map(|shares| {
                shares
                    .values()
                    .filter_map(|statuses| statuses.get(status))
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Cache key for one preassignment bucket: a site and a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreassignKey {
    pub site: String,
    pub resource_type: String,
}

impl PreassignKey {
    pub fn new(site: &str, resource_type: &str) -> Self {
        Self {
            site: site.to_string(),
            resource_type: resource_type.to_string(),
        }
    }
}

impl fmt::Display for PreassignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.site, self.resource_type)
    }
}

impl FromStr for PreassignKey {
    type Err = QueueFillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('|') {
            Some((site, resource_type)) if !site.is_empty() && !resource_type.is_empty() => {
                Ok(Self::new(site, resource_type))
            }
            _ => Err(QueueFillError::MalformedKey(s.to_string())),
        }
    }
}
