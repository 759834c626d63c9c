// src/core/taskbuffer/mod.rs

//! The interface through which the controller reads and mutates workload
//! state. The reconciler only ever talks to this trait; the PostgreSQL
//! implementation in [`pg`] backs it in production, and tests provide an
//! in-memory one.

pub mod pg;

use crate::core::catalog::SiteCatalog;
use crate::core::errors::QueueFillError;
use crate::core::query::EligibilityQuery;
use crate::core::types::{JobStats, ResourceType, TaskId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Identifies one advisory process lock lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub vo: String,
    pub prod_source_label: String,
    /// Component tag; all queue-filler replicas share the same one.
    pub component: String,
    /// Owner tag of the requesting process.
    pub pid: String,
    /// Lease duration after which the lock expires on its own.
    pub time_limit: Duration,
}

/// Access to the shared workload database and its side catalogs.
///
/// Every method is a suspension point; the reconciler holds no locks of its
/// own across calls and relies on the advisory process lock for mutual
/// exclusion between replicas.
#[async_trait]
pub trait TaskBuffer: Send + Sync {
    /// A snapshot of the site catalog.
    async fn site_catalog(&self) -> Result<SiteCatalog, QueueFillError>;

    /// Per-site job counts grouped by global share and job status.
    async fn job_statistics_by_global_share(&self, vo: &str)
    -> Result<JobStats, QueueFillError>;

    /// Empirical per-site to-running rate (jobs per hour) over
    /// `[now - time_window, now - cutoff]`.
    async fn site_to_run_rate_stats(
        &self,
        vo: &str,
        time_window: Duration,
        cutoff: Duration,
    ) -> Result<HashMap<String, f64>, QueueFillError>;

    async fn load_resource_types(&self) -> Result<Vec<ResourceType>, QueueFillError>;

    /// Reads one dynamic configuration value, `None` when the key is unset.
    async fn config_value(
        &self,
        section: &str,
        key: &str,
        realm: &str,
        vo: &str,
    ) -> Result<Option<i64>, QueueFillError>;

    /// Tries to take the advisory lock. Returns `false` while another live
    /// lease exists for the same (vo, label, component) triple.
    async fn lock_process(&self, request: &LockRequest) -> Result<bool, QueueFillError>;

    async fn unlock_process(&self, request: &LockRequest) -> Result<(), QueueFillError>;

    /// Reads a raw cache payload; `None` on a miss.
    async fn get_cache(
        &self,
        main_key: &str,
        sub_key: &str,
    ) -> Result<Option<String>, QueueFillError>;

    /// Replaces a cache payload wholesale.
    async fn update_cache(
        &self,
        main_key: &str,
        sub_key: &str,
        data: &str,
    ) -> Result<(), QueueFillError>;

    /// Runs the eligibility query without row locks and without binding
    /// anything, in priority order. Used by dry-run mode.
    async fn query_eligible_tasks(
        &self,
        query: &EligibilityQuery,
    ) -> Result<Vec<TaskId>, QueueFillError>;

    /// Atomic select-and-bind: runs the eligibility query under row locks,
    /// drops blacklisted IDs, takes the first `limit` rows and sets their
    /// `site` to `site` in the same transaction. Returns the IDs actually
    /// bound. Blacklisted IDs returned by the query are never updated.
    async fn query_tasks_to_preassign(
        &self,
        query: &EligibilityQuery,
        site: &str,
        blacklist: &HashSet<TaskId>,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueFillError>;

    /// Which of `task_ids` a non-forced undo would release right now, without
    /// touching anything. Used by dry-run mode.
    async fn predict_undone_tasks(
        &self,
        task_ids: &[TaskId],
    ) -> Result<Vec<TaskId>, QueueFillError>;

    /// Clears the `site` binding. Forced undo releases every given task;
    /// non-forced releases only tasks that no longer generate jobs. Returns
    /// the IDs whose rows were updated.
    async fn undo_preassigned_tasks(
        &self,
        task_ids: &[TaskId],
        force_undo: bool,
    ) -> Result<Vec<TaskId>, QueueFillError>;
}
