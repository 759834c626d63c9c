// src/core/taskbuffer/pg.rs

//! PostgreSQL-backed [`TaskBuffer`]. The workload schema itself is owned by
//! the wider workflow engine; this module only queries it. Table names are
//! collected in one place so a schema rename stays a one-line change.

use crate::core::catalog::SiteCatalog;
use crate::core::errors::QueueFillError;
use crate::core::query::{
    self, EligibilityQuery, LockMode, SqlQuery, SqlValue, TASKS_TABLE,
};
use crate::core::taskbuffer::{LockRequest, TaskBuffer};
use crate::core::types::{JobStats, ResourceType, SiteCapability, SiteSpec, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use indexmap::IndexMap;
use serde::Deserialize;
use sqlx::Row;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Advisory process-lock leases.
const PROCESS_LOCK_TABLE: &str = "jedi_process_lock";
/// Shared key/value cache.
const CACHE_TABLE: &str = "jedi_cache";
/// Dynamic configuration values.
const CONFIG_TABLE: &str = "panda_config";
/// Known task resource types.
const RESOURCE_TYPES_TABLE: &str = "resource_types";
/// Site catalog documents, one JSON record per pseudo site.
const SITE_CATALOG_TABLE: &str = "schedconfig_json";
/// Active jobs, the source of queue statistics and to-running rates.
const ACTIVE_JOBS_TABLE: &str = "jobsactive4";

/// Site catalog document as published per pseudo site.
#[derive(Debug, Deserialize)]
struct SiteRecord {
    #[serde(default)]
    unified_name: Option<String>,
    status: String,
    #[serde(default)]
    runs_production: bool,
    #[serde(default)]
    minrss: Option<i64>,
    #[serde(default)]
    maxrss: Option<i64>,
    #[serde(default = "default_core_count")]
    corecount: i64,
    #[serde(default)]
    is_unified: bool,
    #[serde(default)]
    capability: String,
    #[serde(default)]
    fairshare_policy: Option<String>,
    #[serde(default)]
    ddm_endpoints_input: IndexMap<String, Vec<String>>,
}

fn default_core_count() -> i64 {
    1
}

impl SiteRecord {
    fn into_spec(self, pseudo_name: String) -> SiteSpec {
        SiteSpec {
            unified_name: self.unified_name.unwrap_or_else(|| pseudo_name.clone()),
            name: pseudo_name,
            status: self.status,
            runs_production: self.runs_production,
            minrss: self.minrss,
            maxrss: self.maxrss,
            core_count: self.corecount.max(1),
            is_unified: self.is_unified,
            capability: SiteCapability::from_tag(&self.capability),
            fairshare_policy: self.fairshare_policy,
            ddm_endpoints_input: self.ddm_endpoints_input,
        }
    }
}

/// Binds the values of a rendered [`SqlQuery`] in order.
fn bind_values<'q>(
    sql: &'q str,
    binds: &'q [SqlValue],
) -> Query<'q, sqlx::Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for value in binds {
        query = match value {
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

pub struct PgTaskBuffer {
    pool: PgPool,
}

impl PgTaskBuffer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, QueueFillError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    async fn fetch_task_ids(&self, query: &SqlQuery) -> Result<Vec<TaskId>, QueueFillError> {
        let rows = bind_values(&query.sql, &query.binds)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<TaskId, _>(0).map_err(QueueFillError::from))
            .collect()
    }
}

#[async_trait]
impl TaskBuffer for PgTaskBuffer {
    async fn site_catalog(&self) -> Result<SiteCatalog, QueueFillError> {
        let sql = format!("SELECT panda_queue, data FROM {SITE_CATALOG_TABLE}");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut specs = Vec::with_capacity(rows.len());
        for row in &rows {
            let pseudo_name: String = row.try_get("panda_queue")?;
            let data: String = row.try_get("data")?;
            let record: SiteRecord = serde_json::from_str(&data).map_err(|e| {
                QueueFillError::Internal(format!(
                    "invalid site catalog record for '{pseudo_name}': {e}"
                ))
            })?;
            specs.push(record.into_spec(pseudo_name));
        }
        Ok(SiteCatalog::new(specs))
    }

    async fn job_statistics_by_global_share(
        &self,
        vo: &str,
    ) -> Result<JobStats, QueueFillError> {
        let sql = format!(
            "SELECT computingsite, gshare, jobstatus, COUNT(*) AS njobs \
             FROM {ACTIVE_JOBS_TABLE} \
             WHERE vo=$1 \
             GROUP BY computingsite, gshare, jobstatus"
        );
        let rows = sqlx::query(&sql).bind(vo).fetch_all(&self.pool).await?;
        let mut stats = JobStats::default();
        for row in &rows {
            let site: String = row.try_get("computingsite")?;
            let share: String = row.try_get("gshare")?;
            let status: String = row.try_get("jobstatus")?;
            let n: i64 = row.try_get("njobs")?;
            stats.add(&site, &share, &status, n.max(0) as u64);
        }
        Ok(stats)
    }

    async fn site_to_run_rate_stats(
        &self,
        vo: &str,
        time_window: Duration,
        cutoff: Duration,
    ) -> Result<HashMap<String, f64>, QueueFillError> {
        let now = Utc::now();
        let window_start: DateTime<Utc> =
            now - ChronoDuration::seconds(time_window.as_secs() as i64);
        let window_end: DateTime<Utc> = now - ChronoDuration::seconds(cutoff.as_secs() as i64);
        let window_hours = (time_window.as_secs_f64() - cutoff.as_secs_f64()) / 3600.0;
        let sql = format!(
            "SELECT computingsite, COUNT(*)::float8 / $2 AS rate \
             FROM {ACTIVE_JOBS_TABLE} \
             WHERE vo=$1 AND starttime >= $3 AND starttime < $4 \
             GROUP BY computingsite"
        );
        let rows = sqlx::query(&sql)
            .bind(vo)
            .bind(window_hours)
            .bind(window_start)
            .bind(window_end)
            .fetch_all(&self.pool)
            .await?;
        let mut rates = HashMap::with_capacity(rows.len());
        for row in &rows {
            let site: String = row.try_get("computingsite")?;
            let rate: f64 = row.try_get("rate")?;
            rates.insert(site, rate);
        }
        Ok(rates)
    }

    async fn load_resource_types(&self) -> Result<Vec<ResourceType>, QueueFillError> {
        let sql =
            format!("SELECT resource_name FROM {RESOURCE_TYPES_TABLE} ORDER BY resource_name");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(ResourceType {
                    resource_name: row.try_get("resource_name")?,
                })
            })
            .collect()
    }

    async fn config_value(
        &self,
        section: &str,
        key: &str,
        realm: &str,
        vo: &str,
    ) -> Result<Option<i64>, QueueFillError> {
        let sql = format!(
            "SELECT value FROM {CONFIG_TABLE} \
             WHERE component=$1 AND key=$2 AND app=$3 AND vo=$4"
        );
        let row = sqlx::query(&sql)
            .bind(section)
            .bind(key)
            .bind(realm)
            .bind(vo)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let value: String = row.try_get("value")?;
                value.trim().parse::<i64>().map(Some).map_err(|_| {
                    QueueFillError::Internal(format!(
                        "non-integer config value for {section}/{key}: '{value}'"
                    ))
                })
            }
        }
    }

    async fn lock_process(&self, request: &LockRequest) -> Result<bool, QueueFillError> {
        let mut tx = self.pool.begin().await?;
        let select_sql = format!(
            "SELECT pid, locked_time FROM {PROCESS_LOCK_TABLE} \
             WHERE vo=$1 AND prod_source_label=$2 AND component=$3 \
             FOR UPDATE"
        );
        let existing = sqlx::query(&select_sql)
            .bind(request.vo.as_str())
            .bind(request.prod_source_label.as_str())
            .bind(request.component.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let now = Utc::now();
        if let Some(row) = existing {
            let holder: String = row.try_get("pid")?;
            let locked_time: DateTime<Utc> = row.try_get("locked_time")?;
            let lease_end =
                locked_time + ChronoDuration::seconds(request.time_limit.as_secs() as i64);
            if holder != request.pid && now < lease_end {
                tx.commit().await?;
                return Ok(false);
            }
        }
        let upsert_sql = format!(
            "INSERT INTO {PROCESS_LOCK_TABLE} (vo, prod_source_label, component, pid, locked_time) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (vo, prod_source_label, component) \
             DO UPDATE SET pid=EXCLUDED.pid, locked_time=EXCLUDED.locked_time"
        );
        sqlx::query(&upsert_sql)
            .bind(request.vo.as_str())
            .bind(request.prod_source_label.as_str())
            .bind(request.component.as_str())
            .bind(request.pid.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn unlock_process(&self, request: &LockRequest) -> Result<(), QueueFillError> {
        let sql = format!(
            "DELETE FROM {PROCESS_LOCK_TABLE} \
             WHERE vo=$1 AND prod_source_label=$2 AND component=$3 AND pid=$4"
        );
        sqlx::query(&sql)
            .bind(request.vo.as_str())
            .bind(request.prod_source_label.as_str())
            .bind(request.component.as_str())
            .bind(request.pid.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_cache(
        &self,
        main_key: &str,
        sub_key: &str,
    ) -> Result<Option<String>, QueueFillError> {
        let sql = format!("SELECT data FROM {CACHE_TABLE} WHERE main_key=$1 AND sub_key=$2");
        let row = sqlx::query(&sql)
            .bind(main_key)
            .bind(sub_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(row.try_get("data")?)),
        }
    }

    async fn update_cache(
        &self,
        main_key: &str,
        sub_key: &str,
        data: &str,
    ) -> Result<(), QueueFillError> {
        let sql = format!(
            "INSERT INTO {CACHE_TABLE} (main_key, sub_key, data, last_update) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (main_key, sub_key) \
             DO UPDATE SET data=EXCLUDED.data, last_update=EXCLUDED.last_update"
        );
        sqlx::query(&sql)
            .bind(main_key)
            .bind(sub_key)
            .bind(data)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query_eligible_tasks(
        &self,
        query: &EligibilityQuery,
    ) -> Result<Vec<TaskId>, QueueFillError> {
        self.fetch_task_ids(&query.to_sql(LockMode::Plain)).await
    }

    async fn query_tasks_to_preassign(
        &self,
        query: &EligibilityQuery,
        site: &str,
        blacklist: &HashSet<TaskId>,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueFillError> {
        let rendered = query.to_sql(LockMode::RowLock);
        let mut tx = self.pool.begin().await?;
        let rows = bind_values(&rendered.sql, &rendered.binds)
            .fetch_all(&mut *tx)
            .await?;
        let mut picked = Vec::with_capacity(limit);
        for row in &rows {
            if picked.len() >= limit {
                break;
            }
            let task_id: TaskId = row.try_get(0)?;
            if !blacklist.contains(&task_id) {
                picked.push(task_id);
            }
        }
        let update_sql = format!("UPDATE {TASKS_TABLE} SET site=$1 WHERE jeditaskid=$2");
        for task_id in &picked {
            sqlx::query(&update_sql)
                .bind(site)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(picked)
    }

    async fn predict_undone_tasks(
        &self,
        task_ids: &[TaskId],
    ) -> Result<Vec<TaskId>, QueueFillError> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_task_ids(&query::undo_candidates_sql(task_ids))
            .await
    }

    async fn undo_preassigned_tasks(
        &self,
        task_ids: &[TaskId],
        force_undo: bool,
    ) -> Result<Vec<TaskId>, QueueFillError> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = if force_undo {
            format!(
                "UPDATE {TASKS_TABLE} SET site=NULL \
                 WHERE jeditaskid = ANY($1) \
                 RETURNING jeditaskid"
            )
        } else {
            let statuses = query::GENERATING_TASK_STATUSES
                .iter()
                .map(|s| format!("'{s}'"))
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "UPDATE {TASKS_TABLE} SET site=NULL \
                 WHERE jeditaskid = ANY($1) \
                 AND site IS NOT NULL \
                 AND status NOT IN ({statuses}) \
                 RETURNING jeditaskid"
            )
        };
        let rows = sqlx::query(&sql)
            .bind(task_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<TaskId, _>(0).map_err(QueueFillError::from))
            .collect()
    }
}
