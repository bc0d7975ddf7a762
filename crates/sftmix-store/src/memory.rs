use std::collections::HashSet;

use sftmix_core::fingerprint::Fingerprint;

use crate::{DedupStore, DedupStoreError};

/// Run-scoped dedup store. Used when no persistent cache path is supplied;
/// everything is forgotten when the run ends.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    seen: HashSet<Fingerprint>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupStore for MemoryDedupStore {
    fn add_if_absent(&mut self, fp: &Fingerprint) -> Result<bool, DedupStoreError> {
        Ok(self.seen.insert(*fp))
    }

    fn contains(&self, fp: &Fingerprint) -> Result<bool, DedupStoreError> {
        Ok(self.seen.contains(fp))
    }

    fn len(&self) -> Result<u64, DedupStoreError> {
        Ok(self.seen.len() as u64)
    }

    fn flush(&mut self) -> Result<(), DedupStoreError> {
        Ok(())
    }
}
