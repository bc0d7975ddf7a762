use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use sftmix_core::bucket::Bucket;
use sftmix_core::record::CanonicalRecord;
use sftmix_observe::metrics::Gauge;

/// Bucket pool sizing. Pools hold records in memory up to the cap; past the
/// cap a pool spills to a JSONL shard in the staging directory and later
/// appends stream straight to disk.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub mem_cap_records: usize,
    pub staging_dir: PathBuf,
}

pub struct BucketPools {
    cfg: PoolConfig,
    pools: BTreeMap<Bucket, BucketPool>,
    staging_created: bool,
    pooled: Gauge,
}

pub struct BucketPool {
    in_mem: Vec<CanonicalRecord>,
    spill: Option<Spill>,
}

struct Spill {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    count: u64,
}

impl BucketPools {
    pub fn new(cfg: PoolConfig) -> Self {
        Self {
            cfg,
            pools: BTreeMap::new(),
            staging_created: false,
            pooled: Gauge::default(),
        }
    }

    pub fn push(&mut self, record: CanonicalRecord) -> Result<()> {
        let bucket = record.category;
        let cap = self.cfg.mem_cap_records;

        let needs_spill = {
            let pool = self.pools.entry(bucket).or_insert_with(BucketPool::new);
            pool.spill.is_some() || pool.in_mem.len() >= cap
        };

        if needs_spill && !self.staging_created {
            std::fs::create_dir_all(&self.cfg.staging_dir).with_context(|| {
                format!("create staging dir: {}", self.cfg.staging_dir.display())
            })?;
            self.staging_created = true;
        }

        let staging_dir = self.cfg.staging_dir.clone();
        let pool = self.pools.entry(bucket).or_insert_with(BucketPool::new);
        if needs_spill {
            pool.spill_push(&staging_dir, bucket, &record)?;
        } else {
            pool.in_mem.push(record);
        }
        self.pooled.add(1);
        Ok(())
    }

    /// Flush and close spill writers. Must run before any pool is iterated.
    pub fn finalize(&mut self) -> Result<()> {
        for (bucket, pool) in &mut self.pools {
            if let Some(spill) = pool.spill.as_mut() {
                if let Some(mut writer) = spill.writer.take() {
                    writer.flush().with_context(|| {
                        format!("flush spill shard for bucket {bucket}")
                    })?;
                }
                info!(
                    target: "sftmix_audit",
                    event = "pool_spilled",
                    bucket = %bucket,
                    spilled = spill.count,
                    in_mem = pool.in_mem.len() as u64,
                    "bucket pool staged to disk"
                );
            }
        }
        Ok(())
    }

    pub fn get(&self, bucket: Bucket) -> Option<&BucketPool> {
        self.pools.get(&bucket)
    }

    pub fn buckets(&self) -> impl Iterator<Item = (Bucket, &BucketPool)> {
        self.pools.iter().map(|(b, p)| (*b, p))
    }

    pub fn total_len(&self) -> u64 {
        self.pools.values().map(BucketPool::len).sum()
    }
}

impl Drop for BucketPools {
    fn drop(&mut self) {
        if self.staging_created {
            let _ = std::fs::remove_dir_all(&self.cfg.staging_dir);
        }
    }
}

impl BucketPool {
    fn new() -> Self {
        Self {
            in_mem: Vec::new(),
            spill: None,
        }
    }

    fn spill_push(
        &mut self,
        staging_dir: &std::path::Path,
        bucket: Bucket,
        record: &CanonicalRecord,
    ) -> Result<()> {
        if self.spill.is_none() {
            let path = staging_dir.join(format!("{bucket}.jsonl"));
            let file = File::create(&path)
                .with_context(|| format!("create spill shard: {}", path.display()))?;
            self.spill = Some(Spill {
                path,
                writer: Some(BufWriter::new(file)),
                count: 0,
            });
        }

        let spill = match self.spill.as_mut() {
            Some(s) => s,
            None => anyhow::bail!("spill state missing after creation"),
        };
        let writer = match spill.writer.as_mut() {
            Some(w) => w,
            None => anyhow::bail!("spill shard already finalized for bucket {bucket}"),
        };
        let line = record.to_jsonl_line()?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        spill.count += 1;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.in_mem.len() as u64 + self.spill.as_ref().map_or(0, |s| s.count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insertion-order iteration: the in-memory prefix first, then the spill
    /// shard.
    pub fn iter(&self) -> Result<PoolIter<'_>> {
        let shard = match &self.spill {
            Some(spill) => {
                anyhow::ensure!(
                    spill.writer.is_none(),
                    "pool iterated before finalize()"
                );
                let file = File::open(&spill.path)
                    .with_context(|| format!("open spill shard: {}", spill.path.display()))?;
                Some(BufReader::new(file).lines())
            }
            None => None,
        };
        Ok(PoolIter {
            mem: self.in_mem.iter(),
            shard,
        })
    }
}

pub struct PoolIter<'a> {
    mem: std::slice::Iter<'a, CanonicalRecord>,
    shard: Option<std::io::Lines<BufReader<File>>>,
}

impl Iterator for PoolIter<'_> {
    type Item = Result<CanonicalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.mem.next() {
            return Some(Ok(record.clone()));
        }
        let lines = self.shard.as_mut()?;
        for line in lines {
            let line = match line {
                Ok(l) => l,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<serde_json::Value>(&line)
                .ok()
                .and_then(|v| CanonicalRecord::from_json_value(&v));
            return Some(parsed.context("staging shard line did not round-trip"));
        }
        None
    }
}
