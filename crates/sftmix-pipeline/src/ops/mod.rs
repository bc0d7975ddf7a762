mod build_profile;
mod merge_all;
mod rebalance;
mod recategorize;

pub use build_profile::{build_profile, BuildProfileConfig};
pub use merge_all::{merge_all, MergeAllConfig};
pub use rebalance::{rebalance, RebalanceConfig};
pub use recategorize::{recategorize, RecategorizeConfig};

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;

use sftmix_core::fingerprint::{fingerprint, Fingerprint};
use sftmix_core::profile::Profile;
use sftmix_core::record::{CanonicalRecord, RawRecord};
use sftmix_core::source::SourceDescriptor;
use sftmix_store::{DedupStore, DedupStoreError, MemoryDedupStore, SqliteDedupStore};

use crate::counters::RunCounters;
use crate::normalize::normalize;

#[derive(Debug, Error)]
pub enum OpError {
    /// The operation would write zero records. Exit code 2.
    #[error("operation would write zero records")]
    ZeroOutput,
    /// The dedup store cannot be opened or written. Exit code 1.
    #[error(transparent)]
    Store(#[from] DedupStoreError),
    /// Bad profile or flags. Exit code 1.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Open the persistent store at `path`, or a run-scoped in-memory store when
/// no path is given.
pub(crate) fn open_store(
    path: Option<&Path>,
    reset: bool,
) -> Result<Box<dyn DedupStore>, DedupStoreError> {
    Ok(match path {
        Some(p) if reset => Box::new(SqliteDedupStore::open_reset(p)?),
        Some(p) => Box::new(SqliteDedupStore::open(p)?),
        None => Box::new(MemoryDedupStore::new()),
    })
}

/// How prior-run fingerprints in a shared store are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DedupPolicy {
    /// A fingerprint present in the store drops the record, whichever run put
    /// it there. Used by build-profile (cross-profile overlap) and rebalance.
    Global,
    /// Only fingerprints seen earlier in this run drop the record; prior-run
    /// entries pass through (and stay recorded). Makes merge-all idempotent:
    /// re-running over the same inputs rebuilds the identical consolidated
    /// file instead of dropping everything as duplicates.
    RunLocal,
}

/// The dedup gate in front of pools/output. Owns the store handle; writes are
/// serialized by `&mut`.
pub(crate) struct DedupGate {
    store: Box<dyn DedupStore>,
    policy: DedupPolicy,
    run_local: HashSet<Fingerprint>,
}

impl DedupGate {
    pub(crate) fn new(store: Box<dyn DedupStore>, policy: DedupPolicy) -> Self {
        Self {
            store,
            policy,
            run_local: HashSet::new(),
        }
    }

    /// True when the record should be kept.
    pub(crate) fn admit(&mut self, fp: &Fingerprint) -> Result<bool, DedupStoreError> {
        match self.policy {
            DedupPolicy::Global => self.store.add_if_absent(fp),
            DedupPolicy::RunLocal => {
                if !self.run_local.insert(*fp) {
                    return Ok(false);
                }
                self.store.add_if_absent(fp)?;
                Ok(true)
            }
        }
    }

    pub(crate) fn flush(&mut self) -> Result<(), DedupStoreError> {
        self.store.flush()
    }
}

/// Count a raw record into the pipeline and normalize it.
pub(crate) fn normalize_and_count(
    raw: &RawRecord,
    desc: &SourceDescriptor,
    counters: &RunCounters,
) -> Option<CanonicalRecord> {
    counters.yielded.inc();
    match normalize(raw, desc) {
        Some(rec) => {
            counters.normalized.inc();
            Some(rec)
        }
        None => {
            counters.missing_instruction_or_output.inc();
            None
        }
    }
}

/// Run a record through the dedup gate, counting a rejection as `duplicate`.
pub(crate) fn gate_and_count(
    record: &CanonicalRecord,
    gate: &mut DedupGate,
    counters: &RunCounters,
) -> Result<bool, DedupStoreError> {
    let admitted = gate.admit(&fingerprint(record))?;
    if !admitted {
        counters.duplicate.inc();
    }
    Ok(admitted)
}

/// Load and validate a profile document.
pub fn load_profile(path: &Path) -> Result<Profile, OpError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| OpError::Config(format!("read profile {}: {e}", path.display())))?;
    let profile: Profile = serde_json::from_str(&text)
        .map_err(|e| OpError::Config(format!("parse profile {}: {e}", path.display())))?;
    profile
        .validate()
        .map_err(|e| OpError::Config(format!("profile {}: {e}", profile.name)))?;
    Ok(profile)
}

/// `--profile` accepts a direct path or a name resolved under the profiles
/// directory.
pub fn resolve_profile(name_or_path: &str, profiles_dir: &Path) -> Result<Profile, OpError> {
    let direct = Path::new(name_or_path);
    if direct.is_file() {
        return load_profile(direct);
    }
    let named = profiles_dir.join(format!("{name_or_path}.json"));
    if named.is_file() {
        return load_profile(&named);
    }
    Err(OpError::Config(format!(
        "profile {name_or_path:?} not found (looked for a file and for {})",
        named.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sftmix_core::fingerprint::fingerprint_triple;

    #[test]
    fn global_policy_honors_prior_runs() -> anyhow::Result<()> {
        let mut store = MemoryDedupStore::new();
        let fp = fingerprint_triple("from", "", "before");
        store.add_if_absent(&fp)?;

        let mut gate = DedupGate::new(Box::new(store), DedupPolicy::Global);
        assert!(!gate.admit(&fp)?);
        Ok(())
    }

    #[test]
    fn run_local_policy_admits_prior_run_entries_once() -> anyhow::Result<()> {
        let mut store = MemoryDedupStore::new();
        let fp = fingerprint_triple("from", "", "before");
        store.add_if_absent(&fp)?;

        let mut gate = DedupGate::new(Box::new(store), DedupPolicy::RunLocal);
        assert!(gate.admit(&fp)?, "prior-run entry re-emits");
        assert!(!gate.admit(&fp)?, "second sighting this run is a duplicate");
        Ok(())
    }
}
