use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use sftmix_core::source::SourceDescriptor;

use crate::counters::RunCounters;
use crate::manifest::{default_manifest_path, write_manifest, RunManifest};
use crate::output::JsonlWriter;
use crate::provider::NoDatasetProvider;
use crate::source::{open_source, supported_extension};

use super::{gate_and_count, normalize_and_count, open_store, DedupGate, DedupPolicy, OpError};

pub struct MergeAllConfig {
    pub input_dir: PathBuf,
    pub output: PathBuf,
    pub global_cache: Option<PathBuf>,
}

/// Consolidate every JSONL/JSON file under a directory tree into one
/// deduplicated corpus. No bucket weighting, no shuffle: output order is the
/// sorted file walk, so re-runs are byte-identical.
pub fn merge_all(cfg: &MergeAllConfig) -> Result<RunManifest, OpError> {
    if !cfg.input_dir.is_dir() {
        return Err(OpError::Config(format!(
            "--input-dir is not a directory: {}",
            cfg.input_dir.display()
        )));
    }

    let files = walk_tree(&cfg.input_dir)?;
    info!(
        target: "sftmix_audit",
        event = "run_start",
        op = "merge-all",
        input_dir = %cfg.input_dir.display(),
        files = files.len() as u64,
        "merging sources"
    );

    let store = open_store(cfg.global_cache.as_deref(), false)?;
    let mut gate = DedupGate::new(store, DedupPolicy::RunLocal);
    let counters = Arc::new(RunCounters::default());

    let mut writer = JsonlWriter::create(&cfg.output)?;
    let mut category_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut source_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut empty_sources: Vec<String> = Vec::new();

    for path in files {
        let label = file_label(&path);
        source_counts.entry(label.clone()).or_insert(0);
        let desc = SourceDescriptor::files(path.display().to_string(), label.clone());

        let stream = match open_source(&desc, &NoDatasetProvider, counters.clone()) {
            Ok(s) => s,
            Err(err) => {
                warn!(
                    target: "sftmix_audit",
                    event = "source_load_failed",
                    label = %label,
                    error = %err,
                    "source failed to open; continuing"
                );
                counters.source_load_failed.inc();
                empty_sources.push(label);
                continue;
            }
        };

        let mut raw_count: u64 = 0;
        for raw in stream {
            raw_count += 1;
            let Some(rec) = normalize_and_count(&raw, &desc, &counters) else {
                continue;
            };
            if gate_and_count(&rec, &mut gate, &counters)? {
                writer.write_record(&rec)?;
                *category_counts.entry(rec.category.to_string()).or_insert(0) += 1;
                *source_counts.entry(rec.source.clone()).or_insert(0) += 1;
            }
        }
        if raw_count == 0 {
            counters.source_load_failed.inc();
            empty_sources.push(label);
        }
    }

    if writer.written() == 0 {
        return Err(OpError::ZeroOutput);
    }
    let written = writer.finish()?;
    gate.flush()?;

    let manifest = RunManifest {
        operation: "merge-all".to_string(),
        profile: None,
        profile_hash: None,
        seed: None,
        output: cfg.output.display().to_string(),
        written,
        records_yielded: counters.yielded.get(),
        category_counts,
        source_counts,
        dedup_rate: counters.dedup_rate(),
        drop_reasons: counters.drop_reasons(),
        applied_bucket_weights: BTreeMap::new(),
        oversample_weights: BTreeMap::new(),
        shortfalls: BTreeMap::new(),
        pool_leftover: 0,
        empty_sources,
    };
    write_manifest(&default_manifest_path(&cfg.output), &manifest)?;

    info!(
        target: "sftmix_audit",
        event = "run_complete",
        op = "merge-all",
        written,
        duplicates = counters.duplicate.get(),
        "consolidated corpus written"
    );

    Ok(manifest)
}

/// Recursive sorted walk of the input tree, JSONL/JSON files only.
fn walk_tree(root: &Path) -> Result<Vec<PathBuf>, OpError> {
    let mut out: Vec<(String, PathBuf)> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("read_dir failed: {}", dir.display()))
            .map_err(OpError::Other)?;
        for entry in entries {
            let entry = entry.map_err(|e| OpError::Other(e.into()))?;
            let path = entry.path();
            let meta = entry.metadata().map_err(|e| OpError::Other(e.into()))?;
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() && supported_extension(&path) {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push((rel, path));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out.into_iter().map(|(_, p)| p).collect())
}

pub(crate) fn file_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string())
}
