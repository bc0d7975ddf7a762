#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod memory;
pub mod sqlite;

use std::path::Path;

use sftmix_core::fingerprint::Fingerprint;
use thiserror::Error;

pub use memory::MemoryDedupStore;
pub use sqlite::SqliteDedupStore;

#[derive(Debug, Error)]
pub enum DedupStoreError {
    /// The store file exists but cannot be opened or queried. Fatal: a store
    /// in this state must never be trusted for dedup decisions.
    #[error("dedup store corrupt: {0}")]
    Corrupt(String),
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent set of record fingerprints with at-most-once insertion.
///
/// The store is the only shared mutable resource in a run; taking `&mut self`
/// serializes writers by construction. Fingerprints seen in a prior run are
/// considered seen in the current run when, and only when, the same store
/// path is opened again.
pub trait DedupStore: Send {
    /// Returns true exactly when the fingerprint was not previously present,
    /// inserting it in that case.
    fn add_if_absent(&mut self, fp: &Fingerprint) -> Result<bool, DedupStoreError>;

    fn contains(&self, fp: &Fingerprint) -> Result<bool, DedupStoreError>;

    fn len(&self) -> Result<u64, DedupStoreError>;

    fn is_empty(&self) -> Result<bool, DedupStoreError> {
        Ok(self.len()? == 0)
    }

    /// Commit any batched inserts. Called at the end of a run; dropping the
    /// store also flushes best-effort.
    fn flush(&mut self) -> Result<(), DedupStoreError>;
}

/// Write `bytes` to `path` via a temp file and an atomic rename, so readers
/// never observe a half-written file and a crash leaves only temp debris.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    let mut tmp = path.to_path_buf();
    tmp.set_file_name(format!(
        "{file_name}.tmp.{}.{}",
        std::process::id(),
        unix_time_ms()
    ));

    {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}

pub(crate) fn unix_time_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u64::MAX as u128) as u64
}
