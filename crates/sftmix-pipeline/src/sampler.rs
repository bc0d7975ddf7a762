use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use sftmix_core::bucket::Bucket;
use sftmix_core::fingerprint::{fingerprint, Fingerprint};
use sftmix_core::plan::MixPlan;
use sftmix_core::record::CanonicalRecord;

use crate::pool::BucketPools;

/// Result of executing a mix plan against the bucket pools. Records are in
/// their final shuffled order, ready to write.
pub struct SampleOutcome {
    pub records: Vec<CanonicalRecord>,
    pub shortfalls: BTreeMap<Bucket, u64>,
    pub pool_leftover: u64,
}

/// Execute the plan: per-bucket uniform draws without replacement, top-up
/// from leftover pool entries when buckets underrun, deterministic shuffle,
/// truncate to budget.
///
/// Draw order is deterministic: each bucket gets its own RNG stream derived
/// from the run seed and the bucket name, so adding a bucket never perturbs
/// another bucket's draw.
pub fn execute_plan(pools: &BucketPools, plan: &MixPlan, seed: u64) -> Result<SampleOutcome> {
    let budget = plan.total();
    let mut emitted: Vec<CanonicalRecord> = Vec::new();
    let mut emitted_fps: HashSet<Fingerprint> = HashSet::new();
    let mut shortfalls: BTreeMap<Bucket, u64> = BTreeMap::new();
    let mut selected_idx: BTreeMap<Bucket, HashSet<u64>> = BTreeMap::new();

    for (&bucket, &target) in &plan.targets {
        if target == 0 {
            continue;
        }
        let pool_len = pools.get(bucket).map_or(0, |p| p.len());
        if pool_len <= target {
            if let Some(pool) = pools.get(bucket) {
                for record in pool.iter()? {
                    emit(record?, &mut emitted, &mut emitted_fps);
                }
            }
            let shortfall = target - pool_len;
            if shortfall > 0 {
                shortfalls.insert(bucket, shortfall);
            }
        } else {
            let mut rng = bucket_rng(seed, bucket);
            let chosen = sample_indices(&mut rng, pool_len, target);
            let pool = match pools.get(bucket) {
                Some(p) => p,
                None => continue,
            };
            for (idx, record) in pool.iter()?.enumerate() {
                let record = record?;
                if chosen.contains(&(idx as u64)) {
                    emit(record, &mut emitted, &mut emitted_fps);
                }
            }
            selected_idx.insert(bucket, chosen);
        }
    }

    // Underruns are topped up from leftover pool entries: buckets with the
    // larger shortfalls first, then taxonomy order, entries in insertion
    // order.
    if (emitted.len() as u64) < budget {
        let mut order: Vec<Bucket> = pools.buckets().map(|(b, _)| b).collect();
        order.sort_by_key(|b| {
            (
                std::cmp::Reverse(shortfalls.get(b).copied().unwrap_or(0)),
                *b,
            )
        });

        'topup: for bucket in order {
            let Some(pool) = pools.get(bucket) else {
                continue;
            };
            let chosen = selected_idx.get(&bucket);
            // Buckets emitted whole have no leftovers to walk.
            if chosen.is_none() && plan.targets.get(&bucket).copied().unwrap_or(0) > 0 {
                continue;
            }
            for (idx, record) in pool.iter()?.enumerate() {
                if emitted.len() as u64 >= budget {
                    break 'topup;
                }
                if chosen.is_some_and(|set| set.contains(&(idx as u64))) {
                    continue;
                }
                emit(record?, &mut emitted, &mut emitted_fps);
            }
        }
    }

    if shortfalls.values().any(|s| *s > 0) {
        warn!(
            target: "sftmix_audit",
            event = "bucket_shortfall",
            buckets = shortfalls.len() as u64,
            "one or more buckets underran their targets"
        );
    }

    let mut rng = StdRng::seed_from_u64(seed);
    emitted.shuffle(&mut rng);
    emitted.truncate(usize::try_from(budget).unwrap_or(usize::MAX));

    let pool_leftover = pools.total_len().saturating_sub(emitted.len() as u64);

    info!(
        target: "sftmix_audit",
        event = "plan_executed",
        budget,
        emitted = emitted.len() as u64,
        pool_leftover,
        "sampling complete"
    );

    Ok(SampleOutcome {
        records: emitted,
        shortfalls,
        pool_leftover,
    })
}

fn emit(
    record: CanonicalRecord,
    emitted: &mut Vec<CanonicalRecord>,
    emitted_fps: &mut HashSet<Fingerprint>,
) {
    // Pools are globally deduplicated, so this only guards against a stale
    // staging shard re-introducing a fingerprint.
    if emitted_fps.insert(fingerprint(&record)) {
        emitted.push(record);
    }
}

/// Floyd's algorithm: `amount` distinct indices in `[0, length)`.
fn sample_indices(rng: &mut StdRng, length: u64, amount: u64) -> HashSet<u64> {
    let mut chosen: HashSet<u64> = HashSet::with_capacity(amount as usize);
    for j in length.saturating_sub(amount)..length {
        let t = rng.gen_range(0..=j);
        if !chosen.insert(t) {
            chosen.insert(j);
        }
    }
    chosen
}

pub(crate) fn bucket_rng(seed: u64, bucket: Bucket) -> StdRng {
    StdRng::seed_from_u64(seed ^ fnv1a64(bucket.as_str().as_bytes()))
}

pub(crate) fn label_rng(seed: u64, label: &str) -> StdRng {
    StdRng::seed_from_u64(seed ^ fnv1a64(label.as_bytes()))
}

/// Seeded reservoir sample of `k` items.
pub fn reservoir_sample<T, I: IntoIterator<Item = T>>(
    items: I,
    k: usize,
    rng: &mut StdRng,
) -> Vec<T> {
    let mut reservoir: Vec<T> = Vec::with_capacity(k);
    if k == 0 {
        return reservoir;
    }
    for (i, item) in items.into_iter().enumerate() {
        if reservoir.len() < k {
            reservoir.push(item);
        } else {
            let j = rng.gen_range(0..=i);
            if j < k {
                reservoir[j] = item;
            }
        }
    }
    reservoir
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut h = FNV_OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BucketPools, PoolConfig};
    use sftmix_core::plan::plan_targets;
    use std::collections::BTreeMap as Map;
    use std::path::PathBuf;

    fn rec(n: usize, bucket: Bucket) -> CanonicalRecord {
        CanonicalRecord {
            instruction: format!("{bucket} question {n}"),
            input: String::new(),
            output: format!("{bucket} answer {n}"),
            source: format!("src-{bucket}"),
            category: bucket,
            meta: Map::new(),
        }
    }

    fn staging(test_name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "sftmix-sampler-{test_name}-{}-{}",
            std::process::id(),
            sftmix_observe::time::unix_time_ms()
        ));
        root
    }

    fn pools_with(counts: &[(Bucket, usize)], test_name: &str) -> Result<BucketPools> {
        let mut pools = BucketPools::new(PoolConfig {
            mem_cap_records: 1_000_000,
            staging_dir: staging(test_name),
        });
        for (bucket, n) in counts {
            for i in 0..*n {
                pools.push(rec(i, *bucket))?;
            }
        }
        pools.finalize()?;
        Ok(pools)
    }

    #[test]
    fn shortfall_is_topped_up_from_rich_buckets() -> Result<()> {
        // Scenario: code 0.5 / cot_math 0.5, budget 10; code has 20, cot has 3.
        let pools = pools_with(&[(Bucket::Code, 20), (Bucket::CotMath, 3)], "topup")?;
        let weights = Map::from([(Bucket::Code, 0.5), (Bucket::CotMath, 0.5)]);
        let plan = plan_targets(&weights, 10);

        let outcome = execute_plan(&pools, &plan, 7)?;
        assert_eq!(outcome.records.len(), 10);
        assert_eq!(outcome.shortfalls.get(&Bucket::CotMath), Some(&2));

        let code = outcome
            .records
            .iter()
            .filter(|r| r.category == Bucket::Code)
            .count();
        let cot = outcome
            .records
            .iter()
            .filter(|r| r.category == Bucket::CotMath)
            .count();
        assert_eq!(code, 7);
        assert_eq!(cot, 3);
        assert_eq!(outcome.pool_leftover, 13);
        Ok(())
    }

    #[test]
    fn same_seed_same_output_different_seed_differs() -> Result<()> {
        let weights = Map::from([(Bucket::Code, 1.0)]);
        let plan = plan_targets(&weights, 20);

        let pools = pools_with(&[(Bucket::Code, 100)], "det-a")?;
        let a = execute_plan(&pools, &plan, 42)?;
        let pools = pools_with(&[(Bucket::Code, 100)], "det-b")?;
        let b = execute_plan(&pools, &plan, 42)?;
        assert_eq!(
            a.records.iter().map(|r| &r.instruction).collect::<Vec<_>>(),
            b.records.iter().map(|r| &r.instruction).collect::<Vec<_>>()
        );

        let pools = pools_with(&[(Bucket::Code, 100)], "det-c")?;
        let c = execute_plan(&pools, &plan, 43)?;
        assert_ne!(
            a.records.iter().map(|r| &r.instruction).collect::<Vec<_>>(),
            c.records.iter().map(|r| &r.instruction).collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn no_duplicate_fingerprints_in_outcome() -> Result<()> {
        let pools = pools_with(&[(Bucket::Code, 50), (Bucket::Factual, 50)], "nodup")?;
        let weights = Map::from([(Bucket::Code, 0.5), (Bucket::Factual, 0.5)]);
        let plan = plan_targets(&weights, 60);

        let outcome = execute_plan(&pools, &plan, 1)?;
        let mut fps = HashSet::new();
        for r in &outcome.records {
            assert!(fps.insert(fingerprint(r)));
        }
        Ok(())
    }

    #[test]
    fn empty_pools_emit_nothing() -> Result<()> {
        let pools = pools_with(&[], "empty")?;
        let weights = Map::from([(Bucket::Code, 1.0)]);
        let plan = plan_targets(&weights, 5);
        let outcome = execute_plan(&pools, &plan, 0)?;
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.shortfalls.get(&Bucket::Code), Some(&5));
        Ok(())
    }

    #[test]
    fn reservoir_sample_is_exact_for_small_inputs() {
        let mut rng = StdRng::seed_from_u64(9);
        let all = reservoir_sample(0..5, 10, &mut rng);
        assert_eq!(all, vec![0, 1, 2, 3, 4]);

        let mut rng = StdRng::seed_from_u64(9);
        let some = reservoir_sample(0..100, 10, &mut rng);
        assert_eq!(some.len(), 10);
        let distinct: HashSet<_> = some.iter().collect();
        assert_eq!(distinct.len(), 10);
    }

    #[test]
    fn sample_indices_distinct_and_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let set = sample_indices(&mut rng, 100, 30);
        assert_eq!(set.len(), 30);
        assert!(set.iter().all(|i| *i < 100));
    }
}
