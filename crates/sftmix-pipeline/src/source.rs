use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

use sftmix_core::record::RawRecord;
use sftmix_core::source::{SourceDescriptor, SourceLocator};

use crate::counters::RunCounters;
use crate::provider::DatasetProvider;

/// Lazy stream of raw records. Memory use is independent of source size; JSON
/// parse failures are counted and skipped, never surfaced as iterator errors.
pub type RecordStream = Box<dyn Iterator<Item = RawRecord>>;

/// Open a descriptor as a lazy record stream.
///
/// Failures here (missing file, empty glob, unsupported extension, provider
/// refusal) are the caller's `source_load_failed`; failures past this point
/// are per-line and recovered.
pub fn open_source(
    desc: &SourceDescriptor,
    provider: &dyn DatasetProvider,
    counters: Arc<RunCounters>,
) -> Result<RecordStream> {
    let stream: RecordStream = match &desc.locator {
        SourceLocator::Files { pattern } => {
            let files = expand_files(pattern)?;
            Box::new(FileRecords::new(files, desc.label.clone(), counters))
        }
        SourceLocator::Dataset {
            dataset_id,
            config,
            split,
            trust_remote_code,
        } => provider.open_dataset(dataset_id, config.as_deref(), split, *trust_remote_code)?,
    };

    Ok(match desc.max_examples {
        Some(cap) => Box::new(stream.take(cap_to_usize(cap))),
        None => stream,
    })
}

fn cap_to_usize(cap: u64) -> usize {
    usize::try_from(cap).unwrap_or(usize::MAX)
}

/// Expand a path or glob to the sorted list of matching files. Empty matches
/// and unsupported extensions are open-time errors.
pub fn expand_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = if pattern.contains(['*', '?', '[']) {
        glob::glob(pattern)
            .with_context(|| format!("bad glob pattern: {pattern}"))?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect()
    } else {
        let path = PathBuf::from(pattern);
        anyhow::ensure!(path.is_file(), "not a readable file: {pattern}");
        vec![path]
    };
    files.sort();
    anyhow::ensure!(!files.is_empty(), "glob matched no files: {pattern}");

    for file in &files {
        anyhow::ensure!(
            supported_extension(file),
            "unsupported source file (expected .jsonl or .json): {}",
            file.display()
        );
    }
    Ok(files)
}

pub(crate) fn supported_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("jsonl") | Some("ndjson") | Some("json")
    )
}

struct FileRecords {
    files: VecDeque<PathBuf>,
    current: Option<Box<dyn Iterator<Item = RawRecord>>>,
    label: String,
    counters: Arc<RunCounters>,
}

impl FileRecords {
    fn new(files: Vec<PathBuf>, label: String, counters: Arc<RunCounters>) -> Self {
        Self {
            files: files.into(),
            current: None,
            label,
            counters,
        }
    }

    fn open_next_file(&mut self) -> bool {
        while let Some(path) = self.files.pop_front() {
            match open_one_file(&path, &self.label, self.counters.clone()) {
                Ok(iter) => {
                    self.current = Some(iter);
                    return true;
                }
                Err(err) => {
                    // Keep going with the remaining files of the glob.
                    warn!(
                        target: "sftmix_audit",
                        event = "source_file_skipped",
                        label = %self.label,
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable source file"
                    );
                    self.counters.source_load_failed.inc();
                }
            }
        }
        false
    }
}

impl Iterator for FileRecords {
    type Item = RawRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = self.current.as_mut() {
                if let Some(record) = iter.next() {
                    return Some(record);
                }
                self.current = None;
            }
            if !self.open_next_file() {
                return None;
            }
        }
    }
}

fn open_one_file(
    path: &Path,
    label: &str,
    counters: Arc<RunCounters>,
) -> Result<Box<dyn Iterator<Item = RawRecord>>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read failed: {}", path.display()))?;
            let value: Value = serde_json::from_str(&text)
                .with_context(|| format!("not valid JSON: {}", path.display()))?;
            let Value::Array(items) = value else {
                anyhow::bail!("top-level JSON must be a list: {}", path.display());
            };
            let label = label.to_string();
            let path_display = path.display().to_string();
            Ok(Box::new(items.into_iter().filter_map(move |item| {
                match item {
                    Value::Object(map) => Some(map),
                    _ => {
                        warn!(
                            target: "sftmix_audit",
                            event = "non_object_element",
                            label = %label,
                            path = %path_display,
                            "skipping non-object array element"
                        );
                        counters.parse_error.inc();
                        None
                    }
                }
            })))
        }
        _ => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("open failed: {}", path.display()))?;
            let reader = BufReader::new(file);
            Ok(Box::new(reader.lines().filter_map(move |line| {
                let line = match line {
                    Ok(l) => l,
                    Err(_) => return None,
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(Value::Object(map)) => Some(map),
                    _ => {
                        counters.parse_error.inc();
                        None
                    }
                }
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::NoDatasetProvider;
    use sftmix_core::source::SourceDescriptor;

    fn temp_dir(test_name: &str) -> Result<PathBuf> {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "sftmix-source-{test_name}-{}-{}",
            std::process::id(),
            sftmix_observe::time::unix_time_ms()
        ));
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    fn collect(desc: &SourceDescriptor, counters: &Arc<RunCounters>) -> Result<Vec<RawRecord>> {
        let stream = open_source(desc, &NoDatasetProvider, counters.clone())?;
        Ok(stream.collect())
    }

    #[test]
    fn jsonl_skips_bad_and_empty_lines() -> Result<()> {
        let root = temp_dir("jsonl")?;
        let path = root.join("a.jsonl");
        std::fs::write(
            &path,
            "{\"instruction\":\"one\",\"output\":\"1\"}\n\
             \n\
             not json at all\n\
             42\n\
             {\"instruction\":\"two\",\"output\":\"2\"}\n",
        )?;

        let counters = Arc::new(RunCounters::default());
        let records = collect(
            &SourceDescriptor::files(path.display().to_string(), "a"),
            &counters,
        )?;
        assert_eq!(records.len(), 2);
        assert_eq!(counters.parse_error.get(), 2);
        Ok(())
    }

    #[test]
    fn json_array_file_is_supported() -> Result<()> {
        let root = temp_dir("json-array")?;
        let path = root.join("a.json");
        std::fs::write(
            &path,
            "[{\"instruction\":\"one\",\"output\":\"1\"}, 7, {\"instruction\":\"two\",\"output\":\"2\"}]",
        )?;

        let counters = Arc::new(RunCounters::default());
        let records = collect(
            &SourceDescriptor::files(path.display().to_string(), "a"),
            &counters,
        )?;
        assert_eq!(records.len(), 2);
        assert_eq!(counters.parse_error.get(), 1);
        Ok(())
    }

    #[test]
    fn glob_expands_sorted_and_empty_glob_fails() -> Result<()> {
        let root = temp_dir("glob")?;
        std::fs::write(root.join("b.jsonl"), "{\"instruction\":\"b\",\"output\":\"b\"}\n")?;
        std::fs::write(root.join("a.jsonl"), "{\"instruction\":\"a\",\"output\":\"a\"}\n")?;

        let files = expand_files(&format!("{}/*.jsonl", root.display()))?;
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.jsonl"));

        let err = expand_files(&format!("{}/*.parquet", root.display())).unwrap_err();
        assert!(err.to_string().contains("matched no files"));
        Ok(())
    }

    #[test]
    fn max_examples_caps_the_stream() -> Result<()> {
        let root = temp_dir("cap")?;
        let path = root.join("a.jsonl");
        let mut body = String::new();
        for i in 0..10 {
            body.push_str(&format!("{{\"instruction\":\"q{i}\",\"output\":\"a{i}\"}}\n"));
        }
        std::fs::write(&path, body)?;

        let mut desc = SourceDescriptor::files(path.display().to_string(), "a");
        desc.max_examples = Some(3);
        let counters = Arc::new(RunCounters::default());
        assert_eq!(collect(&desc, &counters)?.len(), 3);
        Ok(())
    }

    #[test]
    fn missing_file_fails_at_open() {
        let counters = Arc::new(RunCounters::default());
        let desc = SourceDescriptor::files("/no/such/file.jsonl", "ghost");
        assert!(collect(&desc, &counters).is_err());
    }
}
