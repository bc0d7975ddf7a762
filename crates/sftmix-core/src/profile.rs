use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bucket::Bucket;
use crate::fingerprint::sha256_hex;
use crate::source::SourceDescriptor;

/// A named mixing recipe. Profiles are data, not code: this struct is the
/// observable schema of the profile documents loaded from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Relative bucket weights; normalized by their sum at planning time.
    pub bucket_weights: BTreeMap<Bucket, f64>,
    /// Ordered source list. Ingestion follows descending priority, ties in
    /// list order.
    pub sources: Vec<SourceDescriptor>,
    /// Optional per-source oversampling weights, keyed by source label.
    #[serde(default)]
    pub oversample: BTreeMap<String, f64>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProfileError {
    #[error("profile name must be non-empty")]
    EmptyName,
    #[error("profile has no sources")]
    NoSources,
    #[error("profile has no bucket weights")]
    NoWeights,
    #[error("weight for bucket {bucket} must be finite and >= 0, got {weight}")]
    BadWeight { bucket: Bucket, weight: f64 },
    #[error("bucket weights sum to zero")]
    ZeroWeightSum,
    #[error("source label {0:?} appears more than once")]
    DuplicateLabel(String),
    #[error("oversample weight for {label:?} must be finite and > 0, got {weight}")]
    BadOversample { label: String, weight: f64 },
    #[error("oversample entry {0:?} matches no source label")]
    UnknownOversampleLabel(String),
}

impl Profile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::EmptyName);
        }
        if self.sources.is_empty() {
            return Err(ProfileError::NoSources);
        }
        if self.bucket_weights.is_empty() {
            return Err(ProfileError::NoWeights);
        }

        let mut sum = 0.0f64;
        for (bucket, weight) in &self.bucket_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ProfileError::BadWeight {
                    bucket: *bucket,
                    weight: *weight,
                });
            }
            sum += weight;
        }
        if sum <= 0.0 {
            return Err(ProfileError::ZeroWeightSum);
        }

        let mut seen = std::collections::BTreeSet::new();
        for desc in &self.sources {
            if !seen.insert(desc.label.as_str()) {
                return Err(ProfileError::DuplicateLabel(desc.label.clone()));
            }
        }

        for (label, weight) in &self.oversample {
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(ProfileError::BadOversample {
                    label: label.clone(),
                    weight: *weight,
                });
            }
            if !seen.contains(label.as_str()) {
                return Err(ProfileError::UnknownOversampleLabel(label.clone()));
            }
        }

        Ok(())
    }

    /// Content hash of the profile definition, recorded in the manifest for
    /// reproducibility. Struct field order is fixed and every map is
    /// BTree-backed, so the serialization is canonical.
    pub fn profile_hash(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(sha256_hex(&bytes))
    }

    /// Default deterministic seed: the first eight bytes of the profile hash.
    pub fn default_seed(&self) -> Result<u64, serde_json::Error> {
        let hex = self.profile_hash()?;
        let mut seed: u64 = 0;
        for b in hex.as_bytes().iter().take(16) {
            let nibble = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b - b'a' + 10,
                _ => 0,
            };
            seed = (seed << 4) | u64::from(nibble);
        }
        Ok(seed)
    }
}
