use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use sftmix_core::plan::plan_targets;
use sftmix_core::profile::Profile;
use sftmix_core::record::CanonicalRecord;
use sftmix_observe::metrics::ScopedTimer;

use crate::counters::RunCounters;
use crate::manifest::{default_manifest_path, write_manifest, RunManifest};
use crate::output::JsonlWriter;
use crate::pool::{BucketPools, PoolConfig};
use crate::provider::DatasetProvider;
use crate::sampler::{execute_plan, label_rng, reservoir_sample};
use crate::source::open_source;

use super::{
    gate_and_count, normalize_and_count, open_store, DedupGate, DedupPolicy, OpError,
};

pub struct BuildProfileConfig {
    pub profile: Profile,
    pub output: PathBuf,
    pub max_total: u64,
    pub seed: Option<u64>,
    pub global_cache: Option<PathBuf>,
    pub reset_global_cache: bool,
    /// Per-bucket in-memory pool cap before spilling to disk shards.
    pub pool_mem_cap: usize,
}

/// Stream every profile source, normalize, classify, dedup, pool, plan,
/// sample, write, manifest.
pub fn build_profile(
    cfg: &BuildProfileConfig,
    provider: &dyn DatasetProvider,
) -> Result<RunManifest, OpError> {
    let profile = &cfg.profile;
    profile
        .validate()
        .map_err(|e| OpError::Config(e.to_string()))?;
    if cfg.max_total == 0 {
        return Err(OpError::Config("--max-total must be > 0".to_string()));
    }

    let profile_hash = profile
        .profile_hash()
        .map_err(|e| OpError::Config(format!("profile hash: {e}")))?;
    let seed = match cfg.seed {
        Some(s) => s,
        None => profile
            .default_seed()
            .map_err(|e| OpError::Config(format!("profile seed: {e}")))?,
    };

    info!(
        target: "sftmix_audit",
        event = "run_start",
        op = "build-profile",
        profile = %profile.name,
        profile_hash = %profile_hash,
        seed,
        max_total = cfg.max_total,
        "building profile corpus"
    );

    let store = open_store(cfg.global_cache.as_deref(), cfg.reset_global_cache)?;
    let mut gate = DedupGate::new(store, DedupPolicy::Global);
    let counters = Arc::new(RunCounters::default());

    let staging_dir = staging_dir_for(&cfg.output);
    let mut pools = BucketPools::new(PoolConfig {
        mem_cap_records: cfg.pool_mem_cap,
        staging_dir,
    });

    // Higher-priority sources first; dedup is first-wins, so priority decides
    // who keeps a contested record. The sort is stable: ties keep list order.
    let mut ordered: Vec<&_> = profile.sources.iter().collect();
    ordered.sort_by_key(|d| std::cmp::Reverse(d.priority));

    let mut empty_sources: Vec<String> = Vec::new();
    let mut source_counts: BTreeMap<String, u64> =
        profile.sources.iter().map(|d| (d.label.clone(), 0)).collect();

    for desc in ordered {
        let label = desc.label.clone();
        let weight = profile.oversample.get(&label).copied().unwrap_or(1.0);
        let _timer = ScopedTimer::new(&counters.ingest_time);

        let stream = match open_source(desc, provider, counters.clone()) {
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
        if weight > 1.0 {
            // Oversampling happens before the dedup gate: repeat the whole
            // source floor(w) times plus a fractional reservoir draw.
            // Identical copies collapse at the gate, so this boosts classes,
            // not tokens.
            let mut buffered: Vec<CanonicalRecord> = Vec::new();
            for raw in stream {
                raw_count += 1;
                if let Some(rec) = normalize_and_count(&raw, desc, &counters) {
                    buffered.push(rec);
                }
            }

            let repeats = weight.floor() as u64;
            for pass in 0..repeats {
                for rec in &buffered {
                    if pass > 0 {
                        counters.yielded.inc();
                        counters.normalized.inc();
                    }
                    if gate_and_count(rec, &mut gate, &counters)? {
                        pools.push(rec.clone())?;
                    }
                }
            }

            let frac = weight - weight.floor();
            let extra = (frac * buffered.len() as f64).round() as usize;
            if extra > 0 {
                let mut rng = label_rng(seed, &label);
                for rec in reservoir_sample(buffered.iter(), extra, &mut rng) {
                    counters.yielded.inc();
                    counters.normalized.inc();
                    if gate_and_count(rec, &mut gate, &counters)? {
                        pools.push(rec.clone())?;
                    }
                }
            }
        } else {
            for raw in stream {
                raw_count += 1;
                let Some(rec) = normalize_and_count(&raw, desc, &counters) else {
                    continue;
                };
                if gate_and_count(&rec, &mut gate, &counters)? {
                    pools.push(rec)?;
                }
            }
        }

        if raw_count == 0 {
            counters.source_load_failed.inc();
            empty_sources.push(label.clone());
        }
        info!(
            target: "sftmix_audit",
            event = "source_ingested",
            label = %label,
            records = raw_count,
            pooled = pools.total_len(),
            "source ingested"
        );
    }

    pools.finalize()?;

    let plan = plan_targets(&profile.bucket_weights, cfg.max_total);
    let outcome = execute_plan(&pools, &plan, seed)?;
    if outcome.records.is_empty() {
        return Err(OpError::ZeroOutput);
    }

    let mut category_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut writer = JsonlWriter::create(&cfg.output)?;
    for record in &outcome.records {
        writer.write_record(record)?;
        *category_counts.entry(record.category.to_string()).or_insert(0) += 1;
        *source_counts.entry(record.source.clone()).or_insert(0) += 1;
    }
    let written = writer.finish()?;
    gate.flush()?;

    let manifest = RunManifest {
        operation: "build-profile".to_string(),
        profile: Some(profile.name.clone()),
        profile_hash: Some(profile_hash),
        seed: Some(seed),
        output: cfg.output.display().to_string(),
        written,
        records_yielded: counters.yielded.get(),
        category_counts,
        source_counts,
        dedup_rate: counters.dedup_rate(),
        drop_reasons: counters.drop_reasons(),
        applied_bucket_weights: profile
            .bucket_weights
            .iter()
            .map(|(b, w)| (b.to_string(), *w))
            .collect(),
        oversample_weights: profile.oversample.clone(),
        shortfalls: outcome
            .shortfalls
            .iter()
            .map(|(b, s)| (b.to_string(), *s))
            .collect(),
        pool_leftover: outcome.pool_leftover,
        empty_sources,
    };
    write_manifest(&default_manifest_path(&cfg.output), &manifest)?;

    let ingest = counters.ingest_time.snapshot();
    info!(
        target: "sftmix_audit",
        event = "run_complete",
        op = "build-profile",
        profile = %profile.name,
        written,
        duplicates = counters.duplicate.get(),
        sources = ingest.count,
        ingest_avg_ms = ingest.avg_ns() / 1_000_000,
        "profile corpus written"
    );

    Ok(manifest)
}

fn staging_dir_for(output: &std::path::Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let dir_name = format!(
        ".{stem}-staging-{}-{}",
        std::process::id(),
        sftmix_observe::time::unix_time_ms()
    );
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(dir_name),
        _ => PathBuf::from(dir_name),
    }
}
