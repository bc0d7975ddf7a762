use std::path::{Path, PathBuf};

use rusqlite::Connection;
use sftmix_core::fingerprint::Fingerprint;

use crate::{DedupStore, DedupStoreError};

/// Inserts are batched into explicit transactions and committed every this
/// many rows; the final partial batch commits on `flush` (or drop).
const COMMIT_BATCH: u64 = 5_000;

/// SQLite-backed dedup store in write-optimized mode: journaling and
/// synchronous off, a single table with the fingerprint as BLOB primary key.
///
/// Sized for tens of millions of fingerprints; memory use stays at SQLite's
/// page cache regardless of store size.
pub struct SqliteDedupStore {
    conn: Connection,
    path: PathBuf,
    in_tx: bool,
    pending: u64,
}

impl std::fmt::Debug for SqliteDedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDedupStore")
            .field("path", &self.path)
            .field("in_tx", &self.in_tx)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl SqliteDedupStore {
    /// Open or create the store at `path`. Any failure to open, configure, or
    /// probe the database surfaces as `Corrupt`: a store in an unknown state
    /// must not silently degrade dedup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DedupStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)
            .map_err(|e| DedupStoreError::Corrupt(format!("{}: {e}", path.display())))?;
        conn.execute_batch(
            "PRAGMA journal_mode=OFF;\n\
             PRAGMA synchronous=OFF;\n\
             CREATE TABLE IF NOT EXISTS fingerprints (fp BLOB PRIMARY KEY) WITHOUT ROWID;",
        )
        .map_err(|e| DedupStoreError::Corrupt(format!("{}: {e}", path.display())))?;

        // Probe: a readable schema that cannot answer a count is corrupt.
        conn.query_row("SELECT COUNT(*) FROM fingerprints", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| DedupStoreError::Corrupt(format!("{}: {e}", path.display())))?;

        Ok(Self {
            conn,
            path,
            in_tx: false,
            pending: 0,
        })
    }

    /// Delete any existing store file before opening a fresh one.
    pub fn open_reset(path: impl AsRef<Path>) -> Result<Self, DedupStoreError> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(DedupStoreError::Io(err)),
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn begin_if_needed(&mut self) -> Result<(), DedupStoreError> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN")?;
            self.in_tx = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DedupStoreError> {
        if self.in_tx {
            self.conn.execute_batch("COMMIT")?;
            self.in_tx = false;
            self.pending = 0;
        }
        Ok(())
    }
}

impl DedupStore for SqliteDedupStore {
    fn add_if_absent(&mut self, fp: &Fingerprint) -> Result<bool, DedupStoreError> {
        self.begin_if_needed()?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO fingerprints (fp) VALUES (?1)",
            [fp.as_bytes().as_slice()],
        )? == 1;
        if inserted {
            self.pending += 1;
            if self.pending >= COMMIT_BATCH {
                self.commit()?;
            }
        }
        Ok(inserted)
    }

    fn contains(&self, fp: &Fingerprint) -> Result<bool, DedupStoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM fingerprints WHERE fp = ?1")?;
        Ok(stmt.exists([fp.as_bytes().as_slice()])?)
    }

    fn len(&self) -> Result<u64, DedupStoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn flush(&mut self) -> Result<(), DedupStoreError> {
        self.commit()
    }
}

impl Drop for SqliteDedupStore {
    fn drop(&mut self) {
        let _ = self.commit();
    }
}
