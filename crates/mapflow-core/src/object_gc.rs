use std::collections::BTreeSet;

use anyhow::{Context, Result};

use crate::manifest::FeatureStoreManifest;
use crate::object_store::ObjectStore;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone)]
pub struct GcPlanEntry {
    pub prefix: &'static str,
    pub orphaned: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GcReport {
    pub manifests: Vec<String>,
    pub entries: Vec<GcPlanEntry>,
}

impl GcReport {
    pub fn total_orphaned(&self) -> usize {
        self.entries.iter().map(|entry| entry.orphaned.len()).sum()
    }
}

/// Lists cache objects that no feature-store manifest references. Nothing is
/// deleted here; the core pipeline never calls this.
pub fn plan_gc(store: &ObjectStore) -> Result<GcReport> {
    let cache_existing = store
        .list_prefix(ObjectStore::CACHE_PREFIX)
        .context("failed to list cache entries")?;

    let manifests: Vec<String> = store
        .list_prefix(ObjectStore::FEATURES_PREFIX)
        .context("failed to list feature stores")?
        .into_iter()
        .filter(|key| key.ends_with(MANIFEST_FILE))
        .collect();

    let mut referenced = BTreeSet::new();
    for key in &manifests {
        let bytes = store
            .get(key)
            .with_context(|| format!("failed to read manifest '{key}'"))?
            .with_context(|| format!("manifest '{key}' disappeared during planning"))?;
        let manifest: FeatureStoreManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("manifest '{key}' is not valid JSON"))?;
        referenced.extend(manifest.referenced_objects());
    }

    let entries = vec![GcPlanEntry {
        prefix: ObjectStore::CACHE_PREFIX,
        orphaned: diff(&cache_existing, &referenced),
    }];

    Ok(GcReport { manifests, entries })
}

pub fn apply_gc(store: &ObjectStore, report: &GcReport) -> Result<()> {
    for entry in &report.entries {
        for key in &entry.orphaned {
            store
                .delete(key)
                .with_context(|| format!("failed to delete orphaned object '{}'", key))?;
        }
    }

    Ok(())
}

fn diff(existing: &[String], referenced: &BTreeSet<String>) -> Vec<String> {
    existing
        .iter()
        .filter(|key| !referenced.contains(*key))
        .cloned()
        .collect()
}
