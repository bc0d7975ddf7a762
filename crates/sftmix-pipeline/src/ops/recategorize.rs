use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::Context;
use serde_json::Value;
use tracing::info;

use sftmix_core::bucket::BucketOverride;
use sftmix_core::classify::classify;
use sftmix_core::record::canonicalize;

use crate::manifest::{default_manifest_path, write_manifest, RunManifest};
use crate::output::JsonlWriter;

use super::OpError;

pub struct RecategorizeConfig {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Rewrite only `_category` using the current classifier, preserving every
/// other field, the record count, and the record order. Records with a valid
/// non-`unknown` tag keep it (the classifier is stable on its own output);
/// `unknown` and untagged records get a fresh classification. Lines that do
/// not parse pass through byte-unchanged. The dedup store is never touched.
pub fn recategorize(cfg: &RecategorizeConfig) -> Result<RunManifest, OpError> {
    if !cfg.input.is_file() {
        return Err(OpError::Config(format!(
            "--input is not a file: {}",
            cfg.input.display()
        )));
    }

    let file = std::fs::File::open(&cfg.input)
        .with_context(|| format!("open input: {}", cfg.input.display()))
        .map_err(OpError::Other)?;
    let reader = BufReader::new(file);

    let mut writer = JsonlWriter::create(&cfg.output)?;
    let mut category_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut source_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut rewritten: u64 = 0;
    let mut passthrough: u64 = 0;

    for line in reader.lines() {
        let line = line
            .with_context(|| format!("read input: {}", cfg.input.display()))
            .map_err(OpError::Other)?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(mut obj)) => match canonicalize(&obj) {
                Some(extracted) => {
                    let classified = classify(&extracted, BucketOverride::Auto);
                    obj.insert(
                        "_category".to_string(),
                        Value::String(classified.bucket.as_str().to_string()),
                    );
                    *category_counts
                        .entry(classified.bucket.to_string())
                        .or_insert(0) += 1;
                    if let Some(Value::String(source)) = obj.get("_source") {
                        *source_counts.entry(source.clone()).or_insert(0) += 1;
                    }
                    let rewritten_line =
                        serde_json::to_string(&Value::Object(obj)).map_err(anyhow::Error::from)?;
                    writer.write_line(&rewritten_line)?;
                    rewritten += 1;
                }
                None => {
                    writer.write_line(&line)?;
                    passthrough += 1;
                }
            },
            _ => {
                writer.write_line(&line)?;
                passthrough += 1;
            }
        }
    }

    if writer.written() == 0 {
        return Err(OpError::ZeroOutput);
    }
    let written = writer.finish()?;

    let manifest = RunManifest {
        operation: "recategorize".to_string(),
        profile: None,
        profile_hash: None,
        seed: None,
        output: cfg.output.display().to_string(),
        written,
        records_yielded: written,
        category_counts,
        source_counts,
        dedup_rate: 0.0,
        drop_reasons: BTreeMap::new(),
        applied_bucket_weights: BTreeMap::new(),
        oversample_weights: BTreeMap::new(),
        shortfalls: BTreeMap::new(),
        pool_leftover: 0,
        empty_sources: vec![],
    };
    write_manifest(&default_manifest_path(&cfg.output), &manifest)?;

    info!(
        target: "sftmix_audit",
        event = "run_complete",
        op = "recategorize",
        written,
        rewritten,
        passthrough,
        "categories rewritten"
    );

    Ok(manifest)
}
