// src/core/query.rs

//! Composes the parameterized SQL that selects candidate tasks for one
//! (site, resource type, production source label) triple. One builder covers
//! both the row-locked variant used for real preassignment and the plain
//! variant used in dry-run mode; the predicate list exists exactly once.

use crate::core::types::{SiteSpec, TaskId};

/// Task table in the shared workload schema.
pub const TASKS_TABLE: &str = "jedi_tasks";
/// Dataset table; input datasets carry the file-progress counters.
pub const DATASETS_TABLE: &str = "jedi_datasets";
/// Replica-location rows mapping (task, RSE).
pub const DATASET_LOCALITY_TABLE: &str = "jedi_dataset_locality";

/// Statuses in which a task still generates jobs and so may hold or receive
/// a site binding.
pub const GENERATING_TASK_STATUSES: [&str; 3] = ["ready", "running", "scouting"];

/// Whether the composed query should take row locks on the selected tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// `FOR UPDATE`; the caller will mutate the selected rows in the same
    /// transaction.
    RowLock,
    /// Plain read, safe for dry-run inspection.
    Plain,
}

/// A bind parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Float(f64),
    Text(String),
}

/// A rendered SQL text with positional bind values, `$1`-style.
#[derive(Debug, Clone, Default)]
pub struct SqlQuery {
    pub sql: String,
    pub binds: Vec<SqlValue>,
}

impl SqlQuery {
    fn new() -> Self {
        Self::default()
    }

    /// Registers one bind value and returns its placeholder.
    fn bind(&mut self, value: SqlValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }

    /// Registers a list of bind values and returns a comma-joined placeholder
    /// list suitable for an `IN (...)` clause. The list must be non-empty.
    fn bind_list<I: IntoIterator<Item = SqlValue>>(&mut self, values: I) -> String {
        let placeholders: Vec<String> = values.into_iter().map(|v| self.bind(v)).collect();
        placeholders.join(",")
    }
}

fn quoted_status_list() -> String {
    GENERATING_TASK_STATUSES
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(",")
}

/// The full eligibility predicate set for one (site, resource type, label)
/// triple, with all site-derived inputs already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityQuery {
    pub prod_source_label: String,
    pub resource_type: String,
    /// Memory budget per core at the site, MB.
    pub max_mem_per_core: f64,
    /// Task core counts the site can run.
    pub allowed_core_counts: Vec<i64>,
    /// RSEs of the site; tasks need an input replica at one of them.
    /// Must be non-empty (sites without RSEs are skipped upstream).
    pub rses: Vec<String>,
    /// Restrict to simulation tasks; set when the site has a fairshare policy.
    pub simul_only: bool,
    pub min_files_ready: i64,
    pub min_files_remaining: i64,
}

impl EligibilityQuery {
    /// Derives the predicate set from a site specification.
    pub fn for_site(
        site: &SiteSpec,
        rses: &[String],
        prod_source_label: &str,
        resource_type: &str,
        min_files_ready: i64,
        min_files_remaining: i64,
    ) -> Self {
        Self {
            prod_source_label: prod_source_label.to_string(),
            resource_type: resource_type.to_string(),
            max_mem_per_core: site.max_mem_per_core(),
            allowed_core_counts: site.allowed_core_counts(),
            rses: rses.to_vec(),
            simul_only: site.has_fairshare(),
            min_files_ready,
            min_files_remaining,
        }
    }

    /// Renders the predicate set to SQL. `LockMode::RowLock` appends
    /// `FOR UPDATE`; the two variants are otherwise byte-identical.
    pub fn to_sql(&self, lock_mode: LockMode) -> SqlQuery {
        let mut query = SqlQuery::new();
        let label = query.bind(SqlValue::Text(self.prod_source_label.clone()));
        let rtype = query.bind(SqlValue::Text(self.resource_type.clone()));
        let mem_per_core = query.bind(SqlValue::Float(self.max_mem_per_core));
        let core_counts =
            query.bind_list(self.allowed_core_counts.iter().map(|c| SqlValue::Int(*c)));
        let rses = query.bind_list(self.rses.iter().map(|r| SqlValue::Text(r.clone())));

        let mut sql = format!(
            "SELECT t.jeditaskid \
             FROM {TASKS_TABLE} t \
             WHERE t.status IN ({statuses}) AND t.lockedby IS NULL \
             AND t.prodsourcelabel={label} \
             AND t.resource_type={rtype} \
             AND t.site IS NULL \
             AND t.ramcount<({mem_per_core}*t.corecount) \
             AND t.corecount IN ({core_counts}) \
             AND EXISTS ( \
             SELECT 1 FROM {DATASET_LOCALITY_TABLE} dl \
             WHERE dl.jeditaskid=t.jeditaskid \
             AND dl.rse IN ({rses}) \
             ) ",
            statuses = quoted_status_list(),
        );
        if self.simul_only {
            let simul = query.bind(SqlValue::Text("simul".to_string()));
            sql.push_str(&format!("AND t.processingtype={simul} "));
        }
        let min_ready = query.bind(SqlValue::Int(self.min_files_ready));
        let min_remaining = query.bind(SqlValue::Int(self.min_files_remaining));
        sql.push_str(&format!(
            "AND EXISTS ( \
             SELECT d.datasetid FROM {DATASETS_TABLE} d \
             WHERE t.jeditaskid=d.jeditaskid AND d.type='input' \
             AND d.nfilestobeused-d.nfilesused>={min_ready} \
             AND d.nfilestobeused>={min_remaining} \
             ) \
             ORDER BY t.currentpriority DESC",
        ));
        if lock_mode == LockMode::RowLock {
            sql.push_str(" FOR UPDATE OF t");
        }

        query.sql = sql;
        query
    }
}

/// Query predicting which of the given bound tasks a non-forced undo would
/// release: still bound to a site, but no longer in a job-generating status.
pub fn undo_candidates_sql(task_ids: &[TaskId]) -> SqlQuery {
    let mut query = SqlQuery::new();
    let ids = query.bind_list(task_ids.iter().map(|id| SqlValue::Int(*id)));
    query.sql = format!(
        "SELECT jeditaskid \
         FROM {TASKS_TABLE} \
         WHERE jeditaskid IN ({ids}) \
         AND site IS NOT NULL \
         AND status NOT IN ({statuses})",
        statuses = quoted_status_list(),
    );
    query
}
