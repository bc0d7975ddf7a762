use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use sftmix_core::record::CanonicalRecord;

/// Single-writer JSONL output. Records land in a temp file next to the final
/// path and are moved into place atomically on `finish`, so a crashed run
/// leaves only temp debris and never a half-written corpus.
pub struct JsonlWriter {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl JsonlWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create output dir: {}", parent.display()))?;
            }
        }

        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .context("output path has no file name")?;
        let mut tmp_path = path.to_path_buf();
        tmp_path.set_file_name(format!(
            "{file_name}.tmp.{}.{}",
            std::process::id(),
            sftmix_observe::time::unix_time_ms()
        ));

        let file = File::create(&tmp_path)
            .with_context(|| format!("create output temp file: {}", tmp_path.display()))?;
        Ok(Self {
            final_path: path.to_path_buf(),
            tmp_path,
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    pub fn write_record(&mut self, record: &CanonicalRecord) -> Result<()> {
        let line = record.to_jsonl_line()?;
        self.write_line(&line)
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("writer already finished")?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, sync and atomically move the temp file into place.
    pub fn finish(mut self) -> Result<u64> {
        let writer = self
            .writer
            .take()
            .context("writer already finished")?;
        let file = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flush output: {e}"))?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.tmp_path, &self.final_path).with_context(|| {
            format!(
                "move output into place: {} -> {}",
                self.tmp_path.display(),
                self.final_path.display()
            )
        })?;
        Ok(self.written)
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        // Abandoned (unfinished) writers leave no partial final file.
        if self.writer.is_some() {
            self.writer = None;
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sftmix_core::bucket::Bucket;

    fn temp_dir(test_name: &str) -> Result<PathBuf> {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "sftmix-output-{test_name}-{}-{}",
            std::process::id(),
            sftmix_observe::time::unix_time_ms()
        ));
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    fn rec(n: usize) -> CanonicalRecord {
        CanonicalRecord {
            instruction: format!("q{n}"),
            input: String::new(),
            output: format!("a{n}"),
            source: "t".to_string(),
            category: Bucket::Instruction,
            meta: Default::default(),
        }
    }

    #[test]
    fn finish_moves_output_into_place() -> Result<()> {
        let root = temp_dir("finish")?;
        let out = root.join("corpus.jsonl");

        let mut w = JsonlWriter::create(&out)?;
        w.write_record(&rec(0))?;
        w.write_record(&rec(1))?;
        assert!(!out.exists(), "final path must not exist before finish");
        assert_eq!(w.finish()?, 2);

        let body = std::fs::read_to_string(&out)?;
        assert_eq!(body.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn dropped_writer_cleans_up_temp_file() -> Result<()> {
        let root = temp_dir("drop")?;
        let out = root.join("corpus.jsonl");
        {
            let mut w = JsonlWriter::create(&out)?;
            w.write_record(&rec(0))?;
        }
        assert!(!out.exists());
        let leftovers: Vec<_> = std::fs::read_dir(&root)?.collect();
        assert!(leftovers.is_empty(), "temp file must be removed on drop");
        Ok(())
    }
}
