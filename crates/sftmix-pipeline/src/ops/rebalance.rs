use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use sftmix_core::source::SourceDescriptor;

use crate::counters::RunCounters;
use crate::manifest::{write_manifest, RunManifest};
use crate::output::JsonlWriter;
use crate::provider::NoDatasetProvider;
use crate::source::open_source;

use super::merge_all::file_label;
use super::{gate_and_count, normalize_and_count, open_store, DedupGate, DedupPolicy, OpError};

pub struct RebalanceConfig {
    pub base: PathBuf,
    pub output: PathBuf,
    pub manifest_path: PathBuf,
    /// Source labels dropped from the corpus (`excluded_source`).
    pub exclude_sources: Vec<String>,
    /// Injection corpora mixed in after the base, under the same dedup store.
    pub inject: Vec<PathBuf>,
    /// Persona overrides by source label.
    pub persona_overrides: BTreeMap<String, String>,
    pub global_cache: Option<PathBuf>,
}

/// Rework an existing consolidated corpus: drop excluded sources, apply
/// persona overrides, then mix in injection corpora behind the same dedup
/// store.
pub fn rebalance(cfg: &RebalanceConfig) -> Result<RunManifest, OpError> {
    if !cfg.base.is_file() {
        return Err(OpError::Config(format!(
            "--base is not a file: {}",
            cfg.base.display()
        )));
    }

    info!(
        target: "sftmix_audit",
        event = "run_start",
        op = "rebalance",
        base = %cfg.base.display(),
        injections = cfg.inject.len() as u64,
        excluded = cfg.exclude_sources.len() as u64,
        "rebalancing corpus"
    );

    let excluded: BTreeSet<&str> = cfg.exclude_sources.iter().map(String::as_str).collect();
    let store = open_store(cfg.global_cache.as_deref(), false)?;
    let mut gate = DedupGate::new(store, DedupPolicy::Global);
    let counters = Arc::new(RunCounters::default());

    let mut writer = JsonlWriter::create(&cfg.output)?;
    let mut category_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut source_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut empty_sources: Vec<String> = Vec::new();

    let mut inputs: Vec<PathBuf> = Vec::with_capacity(1 + cfg.inject.len());
    inputs.push(cfg.base.clone());
    inputs.extend(cfg.inject.iter().cloned());

    for path in inputs {
        let label = file_label(&path);
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
            let Some(mut rec) = normalize_and_count(&raw, &desc, &counters) else {
                continue;
            };
            if excluded.contains(rec.source.as_str()) {
                counters.excluded_source.inc();
                continue;
            }
            if let Some(persona) = cfg.persona_overrides.get(&rec.source) {
                rec.meta
                    .insert("_persona".to_string(), Value::String(persona.clone()));
            }
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
        operation: "rebalance".to_string(),
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
    write_manifest(&cfg.manifest_path, &manifest)?;

    info!(
        target: "sftmix_audit",
        event = "run_complete",
        op = "rebalance",
        written,
        excluded = counters.excluded_source.get(),
        duplicates = counters.duplicate.get(),
        "rebalanced corpus written"
    );

    Ok(manifest)
}
