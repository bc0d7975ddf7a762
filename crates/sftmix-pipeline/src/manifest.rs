use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Machine-readable summary of what an operation actually produced. Written
/// next to the output (or at an explicit path) and the only place drop
/// accounting is surfaced: no record ever silently disappears.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub output: String,
    pub written: u64,
    /// Records that entered the pipeline, oversampling copies included.
    pub records_yielded: u64,
    pub category_counts: BTreeMap<String, u64>,
    pub source_counts: BTreeMap<String, u64>,
    /// Dropped duplicates over total normalized records.
    pub dedup_rate: f64,
    pub drop_reasons: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub applied_bucket_weights: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub oversample_weights: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shortfalls: BTreeMap<String, u64>,
    /// Records that survived normalization and dedup but were not selected
    /// by the sampler; keeps the counts reconciling exactly.
    #[serde(default)]
    pub pool_leftover: u64,
    #[serde(default)]
    pub empty_sources: Vec<String>,
}

/// Default manifest path: `<output>.manifest.json` next to the output file.
pub fn default_manifest_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    name.push_str(".manifest.json");
    output.with_file_name(name)
}

pub fn write_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(manifest)?;
    bytes.push(b'\n');
    sftmix_store::write_atomic(path, &bytes)
        .with_context(|| format!("write manifest: {}", path.display()))?;
    info!(
        target: "sftmix_audit",
        event = "manifest_written",
        op = %manifest.operation,
        path = %path.display(),
        written = manifest.written,
        "manifest written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_sits_next_to_output() {
        let p = default_manifest_path(Path::new("/data/out/corpus.jsonl"));
        assert_eq!(p, PathBuf::from("/data/out/corpus.jsonl.manifest.json"));
    }

    #[test]
    fn manifest_round_trips_through_json() -> Result<()> {
        let manifest = RunManifest {
            operation: "merge-all".to_string(),
            profile: None,
            profile_hash: None,
            seed: None,
            output: "corpus.jsonl".to_string(),
            written: 3,
            records_yielded: 5,
            category_counts: BTreeMap::from([("code".to_string(), 3)]),
            source_counts: BTreeMap::from([("a".to_string(), 3)]),
            dedup_rate: 0.4,
            drop_reasons: BTreeMap::from([("duplicate".to_string(), 2)]),
            applied_bucket_weights: BTreeMap::new(),
            oversample_weights: BTreeMap::new(),
            shortfalls: BTreeMap::new(),
            pool_leftover: 0,
            empty_sources: vec![],
        };
        let json = serde_json::to_string(&manifest)?;
        let back: RunManifest = serde_json::from_str(&json)?;
        assert_eq!(back.written, 3);
        assert_eq!(back.drop_reasons.get("duplicate"), Some(&2));
        Ok(())
    }
}
