use anyhow::Result;

use crate::source::RecordStream;

/// Contract with the external dataset host: given an id, config and split,
/// hand back a lazy record stream. The core imposes nothing on the
/// implementation; a failure here becomes `source_load_failed` for the
/// descriptor, never a process abort.
pub trait DatasetProvider {
    fn open_dataset(
        &self,
        dataset_id: &str,
        config: Option<&str>,
        split: &str,
        trust_remote_code: bool,
    ) -> Result<RecordStream>;
}

/// Provider used when no dataset backend is configured (or the `hub` feature
/// is off): every open fails at the source boundary.
pub struct NoDatasetProvider;

impl DatasetProvider for NoDatasetProvider {
    fn open_dataset(
        &self,
        dataset_id: &str,
        _config: Option<&str>,
        _split: &str,
        _trust_remote_code: bool,
    ) -> Result<RecordStream> {
        anyhow::bail!("no dataset provider configured (dataset {dataset_id:?} unreachable)")
    }
}

#[cfg(feature = "hub")]
pub use hub::HubProvider;

#[cfg(feature = "hub")]
mod hub {
    use std::collections::VecDeque;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use serde::Deserialize;
    use tracing::warn;

    use sftmix_core::record::RawRecord;

    use crate::source::RecordStream;

    use super::DatasetProvider;

    const DEFAULT_BASE_URL: &str = "https://datasets-server.huggingface.co";
    const PAGE_SIZE: u64 = 100;

    /// Streams dataset rows from the hub's rows API, one page at a time.
    ///
    /// The rows API serves pre-extracted rows and never executes dataset
    /// scripts; a script-only dataset fails at open and surfaces as
    /// `source_load_failed`.
    pub struct HubProvider {
        base_url: String,
        client: reqwest::blocking::Client,
    }

    impl HubProvider {
        pub fn new() -> Result<Self> {
            Self::with_base_url(DEFAULT_BASE_URL)
        }

        pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(Duration::from_secs(2))
                .timeout(Duration::from_secs(30))
                .build()?;
            Ok(Self {
                base_url: base_url.into(),
                client,
            })
        }
    }

    impl DatasetProvider for HubProvider {
        fn open_dataset(
            &self,
            dataset_id: &str,
            config: Option<&str>,
            split: &str,
            trust_remote_code: bool,
        ) -> Result<RecordStream> {
            if trust_remote_code {
                warn!(
                    target: "sftmix_audit",
                    event = "trust_remote_code_ignored",
                    dataset = dataset_id,
                    "rows API serves extracted rows; trust_remote_code has no effect here"
                );
            }

            // First page fetched eagerly so provider failures surface at open
            // time, where the caller accounts them per descriptor.
            let first = fetch_rows_page(
                &self.client,
                &self.base_url,
                dataset_id,
                config,
                split,
                0,
            )?;
            let total = first.num_rows_total;
            let buffered: VecDeque<RawRecord> =
                first.rows.into_iter().map(|entry| entry.row).collect();

            Ok(Box::new(HubRows {
                client: self.client.clone(),
                base_url: self.base_url.clone(),
                dataset_id: dataset_id.to_string(),
                config: config.map(str::to_string),
                split: split.to_string(),
                offset: buffered.len() as u64,
                total,
                buffered,
                exhausted: false,
            }))
        }
    }

    #[derive(Debug, Deserialize)]
    struct RowsPage {
        rows: Vec<RowEntry>,
        #[serde(default)]
        num_rows_total: Option<u64>,
    }

    #[derive(Debug, Deserialize)]
    struct RowEntry {
        row: RawRecord,
    }

    struct HubRows {
        client: reqwest::blocking::Client,
        base_url: String,
        dataset_id: String,
        config: Option<String>,
        split: String,
        offset: u64,
        total: Option<u64>,
        buffered: VecDeque<RawRecord>,
        exhausted: bool,
    }

    impl HubRows {
        fn refill(&mut self) {
            if self.exhausted {
                return;
            }
            if let Some(total) = self.total {
                if self.offset >= total {
                    self.exhausted = true;
                    return;
                }
            }

            match fetch_rows_page(
                &self.client,
                &self.base_url,
                &self.dataset_id,
                self.config.as_deref(),
                &self.split,
                self.offset,
            ) {
                Ok(page) => {
                    if page.rows.is_empty() {
                        self.exhausted = true;
                        return;
                    }
                    self.offset += page.rows.len() as u64;
                    self.buffered
                        .extend(page.rows.into_iter().map(|entry| entry.row));
                }
                Err(err) => {
                    // A mid-stream page failure truncates the source instead
                    // of aborting the run.
                    warn!(
                        target: "sftmix_audit",
                        event = "hub_page_failed",
                        dataset = %self.dataset_id,
                        offset = self.offset,
                        error = %err,
                        "truncating dataset stream"
                    );
                    self.exhausted = true;
                }
            }
        }
    }

    impl Iterator for HubRows {
        type Item = RawRecord;

        fn next(&mut self) -> Option<Self::Item> {
            if self.buffered.is_empty() {
                self.refill();
            }
            self.buffered.pop_front()
        }
    }

    fn fetch_rows_page(
        client: &reqwest::blocking::Client,
        base_url: &str,
        dataset_id: &str,
        config: Option<&str>,
        split: &str,
        offset: u64,
    ) -> Result<RowsPage> {
        let url = format!("{base_url}/rows");
        let offset_s = offset.to_string();
        let length_s = PAGE_SIZE.to_string();
        let query: [(&str, &str); 5] = [
            ("dataset", dataset_id),
            ("config", config.unwrap_or("default")),
            ("split", split),
            ("offset", &offset_s),
            ("length", &length_s),
        ];

        let resp = get_with_retry(client, &url, &query)?;
        let status = resp.status();
        anyhow::ensure!(
            status.is_success(),
            "rows request failed: status={status} dataset={dataset_id} split={split} offset={offset}"
        );
        resp.json()
            .with_context(|| format!("bad rows payload: dataset={dataset_id}"))
    }

    fn get_with_retry(
        client: &reqwest::blocking::Client,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::blocking::Response> {
        const MAX_ATTEMPTS: usize = 5;
        const BASE_DELAY_MS: u64 = 50;

        let mut attempt: usize = 0;
        let mut delay_ms: u64 = BASE_DELAY_MS;
        loop {
            attempt = attempt.saturating_add(1);
            match client.get(url).query(query).send() {
                Ok(resp) => {
                    let status = resp.status();
                    let transient = status == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || status == reqwest::StatusCode::REQUEST_TIMEOUT
                        || status.is_server_error();
                    if transient && attempt < MAX_ATTEMPTS {
                        sleep_backoff(&mut delay_ms);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    let transient = err.is_timeout() || err.is_connect();
                    if transient && attempt < MAX_ATTEMPTS {
                        sleep_backoff(&mut delay_ms);
                        continue;
                    }
                    return Err(anyhow::Error::new(err));
                }
            }
        }
    }

    fn sleep_backoff(delay_ms: &mut u64) {
        const MAX_DELAY_MS: u64 = 1000;
        let jitter = sftmix_observe::time::unix_time_ms() % 37;
        std::thread::sleep(Duration::from_millis(delay_ms.saturating_add(jitter)));
        *delay_ms = (delay_ms.saturating_mul(2)).min(MAX_DELAY_MS);
    }
}
