use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bucket::BucketOverride;

/// Where a source's records come from: a local file or glob, or an externally
/// hosted dataset addressed as `hub:<dataset>[:<config>][:<split>][@trust]`.
///
/// An empty config segment (`hub:ds::test`) means "no config, explicit
/// split". The split defaults to `train`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceLocator {
    Files {
        pattern: String,
    },
    Dataset {
        dataset_id: String,
        config: Option<String>,
        split: String,
        trust_remote_code: bool,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceLocatorParseError {
    #[error("empty source locator")]
    Empty,
    #[error("hub locator needs a dataset id: {0:?}")]
    MissingDatasetId(String),
}

impl SourceLocator {
    pub fn parse(input: &str) -> Result<Self, SourceLocatorParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SourceLocatorParseError::Empty);
        }

        let Some(rest) = input.strip_prefix("hub:") else {
            return Ok(Self::Files {
                pattern: input.to_string(),
            });
        };

        let (rest, trust_remote_code) = match rest.strip_suffix("@trust") {
            Some(base) => (base, true),
            None => (rest, false),
        };

        let mut parts = rest.split(':');
        let dataset_id = parts.next().unwrap_or("").trim().to_string();
        if dataset_id.is_empty() {
            return Err(SourceLocatorParseError::MissingDatasetId(input.to_string()));
        }
        let config = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let split = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("train")
            .to_string();

        Ok(Self::Dataset {
            dataset_id,
            config,
            split,
            trust_remote_code,
        })
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Files { pattern } => write!(f, "{pattern}"),
            Self::Dataset {
                dataset_id,
                config,
                split,
                trust_remote_code,
            } => {
                write!(f, "hub:{dataset_id}:{}:{split}", config.as_deref().unwrap_or(""))?;
                if *trust_remote_code {
                    write!(f, "@trust")?;
                }
                Ok(())
            }
        }
    }
}

impl TryFrom<String> for SourceLocator {
    type Error = SourceLocatorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SourceLocator> for String {
    fn from(value: SourceLocator) -> Self {
        value.to_string()
    }
}

/// One entry in a profile's ordered source list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub locator: SourceLocator,
    /// Stable `source` string stamped on every record drawn through this
    /// descriptor (unless the record carries its own `_source`).
    pub label: String,
    #[serde(default)]
    pub bucket: BucketOverride,
    #[serde(default)]
    pub max_examples: Option<u64>,
    /// Higher-priority sources are ingested first; ties keep list order.
    /// Because dedup is first-wins, priority decides which source keeps a
    /// contested record.
    #[serde(default)]
    pub priority: i32,
}

impl SourceDescriptor {
    pub fn files(pattern: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            locator: SourceLocator::Files {
                pattern: pattern.into(),
            },
            label: label.into(),
            bucket: BucketOverride::Auto,
            max_examples: None,
            priority: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Bucket;

    #[test]
    fn parse_file_pattern() {
        let loc = SourceLocator::parse("data/*.jsonl").unwrap();
        assert_eq!(
            loc,
            SourceLocator::Files {
                pattern: "data/*.jsonl".to_string()
            }
        );
    }

    #[test]
    fn parse_hub_defaults_split() {
        let loc = SourceLocator::parse("hub:org/dataset").unwrap();
        assert_eq!(
            loc,
            SourceLocator::Dataset {
                dataset_id: "org/dataset".to_string(),
                config: None,
                split: "train".to_string(),
                trust_remote_code: false,
            }
        );
    }

    #[test]
    fn parse_hub_full_form() {
        let loc = SourceLocator::parse("hub:org/ds:main:test@trust").unwrap();
        assert_eq!(
            loc,
            SourceLocator::Dataset {
                dataset_id: "org/ds".to_string(),
                config: Some("main".to_string()),
                split: "test".to_string(),
                trust_remote_code: true,
            }
        );
    }

    #[test]
    fn parse_hub_empty_config_segment() {
        let loc = SourceLocator::parse("hub:org/ds::validation").unwrap();
        assert_eq!(
            loc,
            SourceLocator::Dataset {
                dataset_id: "org/ds".to_string(),
                config: None,
                split: "validation".to_string(),
                trust_remote_code: false,
            }
        );
    }

    #[test]
    fn parse_rejects_empty_forms() {
        assert_eq!(
            SourceLocator::parse("  "),
            Err(SourceLocatorParseError::Empty)
        );
        assert!(matches!(
            SourceLocator::parse("hub:"),
            Err(SourceLocatorParseError::MissingDatasetId(_))
        ));
    }

    #[test]
    fn display_round_trips_hub_locators() {
        for input in ["hub:org/ds::validation", "hub:org/ds:main:test@trust"] {
            let loc = SourceLocator::parse(input).unwrap();
            assert_eq!(SourceLocator::parse(&loc.to_string()).unwrap(), loc);
        }
    }

    #[test]
    fn descriptor_serde_defaults() -> anyhow::Result<()> {
        let d: SourceDescriptor = serde_json::from_str(
            "{\"locator\": \"data/a.jsonl\", \"label\": \"a\"}",
        )?;
        assert_eq!(d.bucket, BucketOverride::Auto);
        assert_eq!(d.max_examples, None);
        assert_eq!(d.priority, 0);

        let d: SourceDescriptor = serde_json::from_str(
            "{\"locator\": \"hub:org/ds\", \"label\": \"ds\", \"bucket\": \"code\", \"max_examples\": 10, \"priority\": 5}",
        )?;
        assert_eq!(d.bucket, BucketOverride::Fixed(Bucket::Code));
        assert_eq!(d.max_examples, Some(10));
        Ok(())
    }
}
