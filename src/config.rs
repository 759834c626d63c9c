// src/config.rs

//! Manages controller configuration: loading from a TOML file and defaults.
//!
//! Only static process-level settings live here. The per-label reconciliation
//! caps are dynamic and are read from the shared configuration table on every
//! tick (see `core::reconciler`), so that operators can retune a running
//! fleet without redeploying the controller.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Top-level configuration for a controller replica.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Connection string of the shared workload database.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Maximum number of pooled database connections.
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Virtual organisation the controller acts for.
    #[serde(default = "default_vo")]
    pub vo: String,

    /// Production source labels to reconcile, in order.
    #[serde(default = "default_prod_source_labels")]
    pub prod_source_labels: Vec<String>,

    /// When true, the controller computes and records hypothetical decisions
    /// but never mutates task rows.
    #[serde(default)]
    pub dry_run: bool,

    /// Interval between reconciliation ticks.
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,

    /// Default tracing filter, overridable with RUST_LOG.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_database_url() -> String {
    "postgres://localhost/panda".to_string()
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_vo() -> String {
    "atlas".to_string()
}

fn default_prod_source_labels() -> Vec<String> {
    vec!["managed".to_string()]
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(600) // 10 minutes
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_database_max_connections(),
            vo: default_vo(),
            prod_source_labels: default_prod_source_labels(),
            dry_run: false,
            tick_interval: default_tick_interval(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{path}'"))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file '{path}'"))?;
        Ok(config)
    }
}
