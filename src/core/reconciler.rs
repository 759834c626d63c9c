// src/core/reconciler.rs

//! The two-phase reconciliation loop: undo stale or harmful preassignments,
//! then preassign eligible tasks to idle sites within the per-key cap.
//!
//! Every cache read-modify-write runs inside an advisory-lock critical
//! section so that multiple controller replicas stay consistent against the
//! shared database. No failure here is fatal; the controller makes progress
//! over many ticks, not within any single one.

use crate::core::cache::PreassignCache;
use crate::core::errors::QueueFillError;
use crate::core::lock::LockManager;
use crate::core::query::EligibilityQuery;
use crate::core::stats::FleetStatsProbe;
use crate::core::taskbuffer::TaskBuffer;
use crate::core::types::{BlacklistMap, PreassignKey, TaskId};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default cap of preassigned tasks per (site, resource type) key.
const DEFAULT_MAX_PREASSIGNED_TASKS: usize = 3;
/// Default minimum of unprocessed input files a task must still have.
const DEFAULT_MIN_FILES_READY: i64 = 50;
/// Default minimum total size of the input dataset, in files.
const DEFAULT_MIN_FILES_REMAINING: i64 = 100;

/// Section and realm of the dynamic configuration keys.
const CONFIG_SECTION: &str = "queue_filler";
const CONFIG_REALM: &str = "jedi";

/// How long a blacklisted task stays blacklisted.
const BLACKLIST_RETENTION: Duration = Duration::from_secs(12 * 3600); // 12 hours

const REASON_FORCE: &str = "site busy or offline or with too many preassigned tasks";
const REASON_SOFT: &str = "task paused or terminated";

/// Per-label reconciliation caps, read from the shared configuration table
/// on every tick so operators can retune without redeploying.
#[derive(Debug, Clone, Copy)]
struct LabelCaps {
    max_preassigned_tasks: usize,
    min_files_ready: i64,
    min_files_remaining: i64,
}

impl Default for LabelCaps {
    fn default() -> Self {
        Self {
            max_preassigned_tasks: DEFAULT_MAX_PREASSIGNED_TASKS,
            min_files_ready: DEFAULT_MIN_FILES_READY,
            min_files_remaining: DEFAULT_MIN_FILES_REMAINING,
        }
    }
}

/// Floors a unix timestamp to its hour and renders the blacklist bucket key.
fn hour_bucket(ts: i64) -> String {
    (ts - ts.rem_euclid(3600)).to_string()
}

/// Owner tag for the advisory lock: short hostname, OS pid, and a fixed
/// suffix identifying the watchdog.
fn process_pid() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    let short = host.split('.').next().unwrap_or("localhost");
    format!("{short}-{}-dog", std::process::id())
}

/// The queue-filler controller. One instance per replica; replicas coordinate
/// only through the advisory lock and the shared cache.
pub struct QueueFiller {
    buffer: Arc<dyn TaskBuffer>,
    probe: FleetStatsProbe,
    cache: PreassignCache,
    lock: LockManager,
    vo: String,
    prod_source_labels: Vec<String>,
    dry_run: bool,
}

impl QueueFiller {
    /// Builds a controller whose lock owner tag is derived from the host and
    /// OS process id.
    pub fn new(
        buffer: Arc<dyn TaskBuffer>,
        vo: &str,
        prod_source_labels: Vec<String>,
        dry_run: bool,
    ) -> Self {
        let pid = process_pid();
        Self::with_pid(buffer, vo, prod_source_labels, dry_run, &pid)
    }

    /// Builds a controller with an explicit lock owner tag.
    pub fn with_pid(
        buffer: Arc<dyn TaskBuffer>,
        vo: &str,
        prod_source_labels: Vec<String>,
        dry_run: bool,
        pid: &str,
    ) -> Self {
        Self {
            probe: FleetStatsProbe::new(buffer.clone(), vo),
            cache: PreassignCache::new(buffer.clone()),
            lock: LockManager::new(buffer.clone(), vo, pid),
            buffer,
            vo: vo.to_string(),
            prod_source_labels,
            dry_run,
        }
    }

    /// One reconciliation tick: undo, then preassign. Phase failures are
    /// logged and swallowed so the next tick retries.
    pub async fn tick(&self) {
        debug!("tick start");
        if let Err(e) = self.undo_preassign().await {
            error!("undo_preassign failed: {}", e);
        }
        if let Err(e) = self.do_preassign().await {
            error!("do_preassign failed: {}", e);
        }
        debug!("tick done");
    }

    /// Reads the three per-label caps, falling back to the defaults when a
    /// key is unset or unreadable.
    async fn label_caps(&self, prod_source_label: &str) -> LabelCaps {
        let defaults = LabelCaps::default();
        LabelCaps {
            max_preassigned_tasks: self
                .config_cap(prod_source_label, "MAX_PREASSIGNED_TASKS")
                .await
                .map(|v| v.max(0) as usize)
                .unwrap_or(defaults.max_preassigned_tasks),
            min_files_ready: self
                .config_cap(prod_source_label, "MIN_FILES_READY")
                .await
                .unwrap_or(defaults.min_files_ready),
            min_files_remaining: self
                .config_cap(prod_source_label, "MIN_FILES_REMAINING")
                .await
                .unwrap_or(defaults.min_files_remaining),
        }
    }

    async fn config_cap(&self, prod_source_label: &str, name: &str) -> Option<i64> {
        let key = format!("{name}_{prod_source_label}");
        match self
            .buffer
            .config_value(CONFIG_SECTION, &key, CONFIG_REALM, &self.vo)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read config value {}/{}: {}", CONFIG_SECTION, key, e);
                None
            }
        }
    }

    /// Drops blacklist buckets older than the retention window.
    async fn purge_blacklist(&self) -> Result<(), QueueFillError> {
        let before = self.cache.load_blacklist().await?;
        let min_allowed_ts = Utc::now().timestamp() - BLACKLIST_RETENTION.as_secs() as i64;
        let mut after = BlacklistMap::new();
        for (bucket, task_ids) in &before {
            match bucket.parse::<i64>() {
                Ok(ts) if ts < min_allowed_ts => {}
                Ok(_) => {
                    after.insert(bucket.clone(), task_ids.clone());
                }
                Err(_) => {
                    warn!("Dropping malformed blacklist bucket '{}'", bucket);
                }
            }
        }
        self.cache.store_blacklist(&after).await?;
        let n_before: usize = before.values().map(Vec::len).sum();
        let n_after: usize = after.values().map(Vec::len).sum();
        debug!(
            "done cleanup blacklist; before {} , now {} tasks in blacklist",
            n_before, n_after
        );
        Ok(())
    }

    /// Adds the given tasks to the blacklist under the current hour bucket.
    async fn blacklist_tasks(&self, task_ids: &[TaskId]) -> Result<(), QueueFillError> {
        let bucket = hour_bucket(Utc::now().timestamp());
        let mut blacklist = self.cache.load_blacklist().await?;
        let entry = blacklist.entry(bucket).or_default();
        for task_id in task_ids {
            if !entry.contains(task_id) {
                entry.push(*task_id);
            }
        }
        self.cache.store_blacklist(&blacklist).await
    }

    /// The undo phase: release preassignments on busy or offline sites
    /// unconditionally, and release bindings of tasks that no longer generate
    /// jobs, blacklisting the latter against immediate re-selection.
    pub async fn undo_preassign(&self) -> Result<(), QueueFillError> {
        let catalog = self.buffer.site_catalog().await?;
        let busy_sites = self.probe.busy_sites(&catalog).await;

        'labels: for label in &self.prod_source_labels {
            let caps = self.label_caps(label).await;

            if !self.lock.acquire(label).await? {
                debug!("undo_preassign: locked by another process. Skipped");
                continue;
            }
            let purged = self.purge_blacklist().await;
            self.lock.release(label).await;
            if let Err(e) = purged {
                error!("Failed to clean up blacklist: {}", e);
            }

            let snapshot = self.cache.load_preassigned().await?;
            let mut working = snapshot.clone();
            for (key_name, cached) in &snapshot {
                let key: PreassignKey = match key_name.parse() {
                    Ok(key) => key,
                    Err(e) => {
                        warn!("Skipping cached entry: {}", e);
                        continue;
                    }
                };
                let force = busy_sites.contains_key(&key.site)
                    || cached.len() > caps.max_preassigned_tasks;
                let reason = if force { REASON_FORCE } else { REASON_SOFT };

                if !self.lock.acquire(label).await? {
                    debug!("undo_preassign: locked by another process. Skipped");
                    continue 'labels;
                }

                let undone = match self.release_bindings(cached, force).await {
                    Ok(db_undone) => {
                        // A forced undo releases every cached binding, whatever
                        // their task status.
                        let undone = if force { cached.clone() } else { db_undone };
                        if force {
                            working.shift_remove(key_name);
                        } else if !undone.is_empty() {
                            let remaining: Vec<TaskId> = cached
                                .iter()
                                .copied()
                                .filter(|id| !undone.contains(id))
                                .collect();
                            if remaining.is_empty() {
                                working.shift_remove(key_name);
                            } else {
                                working.insert(key_name.clone(), remaining);
                            }
                        }
                        if let Err(e) = self.cache.store_preassigned(&working).await {
                            error!("{:<64} failed to update preassigned cache: {}", key_name, e);
                        }
                        undone
                    }
                    Err(e) => {
                        error!(
                            "{:<64} failed to undo preassigned tasks (force={}): {}",
                            key_name, force, e
                        );
                        Vec::new()
                    }
                };

                if !undone.is_empty() {
                    if self.dry_run {
                        debug!(
                            "[dry run] {:<64} {:>3} preassigned tasks would be undone ({})",
                            key_name,
                            undone.len(),
                            reason
                        );
                    } else {
                        info!(
                            "{:<64} {:>3} preassigned tasks undone ({}) : {:?}",
                            key_name,
                            undone.len(),
                            reason,
                            undone
                        );
                        for task_id in &undone {
                            info!(
                                "#ATM #KV jediTaskID={} action=undo_preassign site={} rtype={} un-preassinged since {}",
                                task_id, key.site, key.resource_type, reason
                            );
                        }
                    }
                    if !force {
                        if let Err(e) = self.blacklist_tasks(&undone).await {
                            error!("{:<64} failed to update blacklist: {}", key_name, e);
                        }
                    }
                }

                self.lock.release(label).await;
            }
        }
        Ok(())
    }

    /// Clears the site bindings of `cached`, or in dry-run mode merely
    /// computes what would be cleared.
    async fn release_bindings(
        &self,
        cached: &[TaskId],
        force: bool,
    ) -> Result<Vec<TaskId>, QueueFillError> {
        if self.dry_run {
            if force || cached.is_empty() {
                Ok(cached.to_vec())
            } else {
                self.buffer.predict_undone_tasks(cached).await
            }
        } else {
            self.buffer.undo_preassigned_tasks(cached, force).await
        }
    }

    /// The preassign phase: bind eligible tasks to available sites up to the
    /// per-key cap, excluding blacklisted tasks.
    pub async fn do_preassign(&self) -> Result<(), QueueFillError> {
        let catalog = self.buffer.site_catalog().await?;
        let resource_types = self.buffer.load_resource_types().await?;

        for label in &self.prod_source_labels {
            let rse_map = catalog.site_rse_map(label);
            let caps = self.label_caps(label).await;
            let available_sites = self.probe.available_sites(&catalog).await;
            let blacklist: HashSet<TaskId> = self
                .cache
                .load_blacklist()
                .await?
                .values()
                .flatten()
                .copied()
                .collect();

            for (site_name, spec) in &available_sites {
                let Some(rses) = rse_map.get(site_name).filter(|rses| !rses.is_empty()) else {
                    continue;
                };

                for resource_type in &resource_types {
                    let key_name =
                        PreassignKey::new(site_name, &resource_type.resource_name).to_string();

                    if !self.lock.acquire(label).await? {
                        debug!("do_preassign: locked by another process. Skipped");
                        return Ok(());
                    }

                    let mut map = match self.cache.load_preassigned().await {
                        Ok(map) => map,
                        Err(e) => {
                            error!("{:<64} failed to load preassigned cache: {}", key_name, e);
                            self.lock.release(label).await;
                            continue;
                        }
                    };
                    let cached = map.get(&key_name).cloned().unwrap_or_default();
                    let slots = caps.max_preassigned_tasks.saturating_sub(cached.len());

                    if slots == 0 {
                        debug!(
                            "{:<64} already has enough preassigned tasks ({:>3}) ; skipped",
                            key_name,
                            cached.len()
                        );
                    } else {
                        let query = EligibilityQuery::for_site(
                            spec,
                            rses,
                            label,
                            &resource_type.resource_name,
                            caps.min_files_ready,
                            caps.min_files_remaining,
                        );
                        match self.pick_tasks(&query, site_name, &cached, &blacklist, slots).await
                        {
                            Err(e) => {
                                error!("{:<64} failed to preassign tasks : {}", key_name, e);
                            }
                            Ok(picked) if picked.is_empty() => {}
                            Ok(picked) => {
                                let mut merged = cached.clone();
                                for task_id in &picked {
                                    if !merged.contains(task_id) {
                                        merged.push(*task_id);
                                    }
                                }
                                map.insert(key_name.clone(), merged);
                                if let Err(e) = self.cache.store_preassigned(&map).await {
                                    error!(
                                        "{:<64} failed to update preassigned cache: {}",
                                        key_name, e
                                    );
                                } else if self.dry_run {
                                    debug!(
                                        "[dry run] {:<64} {:>3} tasks would be preassigned",
                                        key_name,
                                        picked.len()
                                    );
                                } else {
                                    info!(
                                        "{:<64} {:>3} tasks preassigned : {:?}",
                                        key_name,
                                        picked.len(),
                                        picked
                                    );
                                    for task_id in &picked {
                                        info!(
                                            "#ATM #KV jediTaskID={} action=do_preassign site={} rtype={} preassigned",
                                            task_id, site_name, resource_type.resource_name
                                        );
                                    }
                                }
                            }
                        }
                    }

                    self.lock.release(label).await;
                }
            }
        }
        Ok(())
    }

    /// Selects and binds up to `limit` tasks, or in dry-run mode computes the
    /// hypothetical pick without touching task rows.
    async fn pick_tasks(
        &self,
        query: &EligibilityQuery,
        site: &str,
        cached: &[TaskId],
        blacklist: &HashSet<TaskId>,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueFillError> {
        if self.dry_run {
            let rows = self.buffer.query_eligible_tasks(query).await?;
            Ok(rows
                .into_iter()
                .filter(|id| !cached.contains(id) && !blacklist.contains(id))
                .take(limit)
                .collect())
        } else {
            self.buffer
                .query_tasks_to_preassign(query, site, blacklist, limit)
                .await
        }
    }
}
