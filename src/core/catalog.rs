// src/core/catalog.rs

//! Snapshot view of the site catalog. The catalog is refreshed at phase
//! start and read-only for the rest of the tick; insertion order is kept so
//! that unified-name collapsing is deterministic (first pseudo-site wins).

use crate::core::types::SiteSpec;
use indexmap::IndexMap;

/// Input-data scope consulted for a production source label. Analysis labels
/// read from the per-user data scope instead.
fn input_scope(prod_source_label: &str) -> &'static str {
    match prod_source_label {
        "user" | "panda" => "data",
        _ => "default",
    }
}

/// An immutable snapshot of all known sites, keyed by pseudo site name.
#[derive(Debug, Clone, Default)]
pub struct SiteCatalog {
    sites: IndexMap<String, SiteSpec>,
}

impl SiteCatalog {
    pub fn new(specs: Vec<SiteSpec>) -> Self {
        let mut sites = IndexMap::new();
        for spec in specs {
            sites.entry(spec.name.clone()).or_insert(spec);
        }
        Self { sites }
    }

    /// Pseudo site names currently known, in catalog order.
    pub fn all_sites(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    pub fn site_spec(&self, name: &str) -> Option<&SiteSpec> {
        self.sites.get(name)
    }

    /// One spec per unified site name; when several pseudo sites share a
    /// unified name the first one in catalog order is consulted.
    pub fn unified_specs(&self) -> IndexMap<String, &SiteSpec> {
        let mut unified = IndexMap::new();
        for spec in self.sites.values() {
            unified.entry(spec.unified_name.clone()).or_insert(spec);
        }
        unified
    }

    /// Maps unified site name to the RSE tokens of the production input scope
    /// for `prod_source_label`. Sites without input DDM endpoints in that
    /// scope are omitted.
    pub fn site_rse_map(&self, prod_source_label: &str) -> IndexMap<String, Vec<String>> {
        let scope = input_scope(prod_source_label);
        let mut rse_map = IndexMap::new();
        for spec in self.sites.values() {
            let Some(rses) = spec.ddm_endpoints_input.get(scope) else {
                continue;
            };
            rse_map
                .entry(spec.unified_name.clone())
                .or_insert_with(|| rses.clone());
        }
        rse_map
    }
}
