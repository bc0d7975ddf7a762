use std::collections::BTreeMap;

use sftmix_observe::metrics::{Counter, DurationAgg};

/// Run-wide accounting. Every record entering the normalize/dedup pipeline is
/// counted exactly once as written or under one drop reason, so the manifest
/// always reconciles.
#[derive(Debug, Default)]
pub struct RunCounters {
    /// Records that entered the pipeline (source yields plus oversampling
    /// copies).
    pub yielded: Counter,
    /// Records that survived canonicalization.
    pub normalized: Counter,
    pub parse_error: Counter,
    pub missing_instruction_or_output: Counter,
    pub duplicate: Counter,
    pub excluded_source: Counter,
    pub source_load_failed: Counter,
    /// Per-source ingest wall time, reported on the completion log line.
    pub ingest_time: DurationAgg,
}

impl RunCounters {
    pub fn drop_reasons(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("parse_error".to_string(), self.parse_error.get()),
            (
                "missing_instruction_or_output".to_string(),
                self.missing_instruction_or_output.get(),
            ),
            ("duplicate".to_string(), self.duplicate.get()),
            ("excluded_source".to_string(), self.excluded_source.get()),
            (
                "source_load_failed".to_string(),
                self.source_load_failed.get(),
            ),
        ])
    }

    /// Dropped duplicates over total normalized records.
    pub fn dedup_rate(&self) -> f64 {
        let normalized = self.normalized.get();
        if normalized == 0 {
            return 0.0;
        }
        self.duplicate.get() as f64 / normalized as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_rate_handles_zero_normalized() {
        let c = RunCounters::default();
        assert_eq!(c.dedup_rate(), 0.0);
        c.normalized.inc_by(4);
        c.duplicate.inc();
        assert!((c.dedup_rate() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn drop_reasons_lists_every_kind() {
        let c = RunCounters::default();
        let reasons = c.drop_reasons();
        for key in [
            "parse_error",
            "missing_instruction_or_output",
            "duplicate",
            "excluded_source",
            "source_load_failed",
        ] {
            assert!(reasons.contains_key(key), "missing {key}");
        }
    }
}
