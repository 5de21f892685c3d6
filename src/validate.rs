//! Submission validation.
//!
//! `validate` is total: whatever a miner managed to smuggle through
//! decryption, the output is one vector per configured challenge with the
//! configured dimension. Malformed entries degrade to zeros instead of
//! erroring, so a bad submission can neither crash the pipeline nor block
//! other miners' data, and never earns a reward.

use serde_json::Value;
use std::collections::HashMap;

use crate::config::ChallengeSpec;

/// Normalizes decrypted submissions into fixed-dimension per-challenge
/// vectors.
#[derive(Debug, Clone)]
pub struct SubmissionValidator {
    challenges: Vec<ChallengeSpec>,
}

impl SubmissionValidator {
    pub fn new(challenges: &[ChallengeSpec]) -> Self {
        Self {
            challenges: challenges.to_vec(),
        }
    }

    /// All-zero vector set with the configured per-challenge dimensions.
    pub fn zero_vecs(&self) -> HashMap<String, Vec<f64>> {
        self.challenges
            .iter()
            .map(|c| (c.ticker.clone(), vec![0.0; c.dim]))
            .collect()
    }

    /// Validate a decoded submission.
    ///
    /// Accepts either a sequence of vectors positionally aligned with the
    /// challenge registry, or a map keyed by ticker or display name (a
    /// `hotkey` key is attribution metadata and skipped). Vectors with the
    /// wrong dimension or elements outside `[-1, 1]` become zeros; so does
    /// everything else.
    pub fn validate(&self, submission: &Value) -> HashMap<String, Vec<f64>> {
        if let Some(items) = submission.as_array() {
            if items.len() != self.challenges.len() {
                return self.zero_vecs();
            }
            return items
                .iter()
                .zip(&self.challenges)
                .map(|(value, spec)| {
                    let vec = checked_vector(value, spec.dim).unwrap_or_else(|| vec![0.0; spec.dim]);
                    (spec.ticker.clone(), vec)
                })
                .collect();
        }

        if let Some(map) = submission.as_object() {
            let mut out = self.zero_vecs();
            for (key, value) in map {
                if key == "hotkey" {
                    continue;
                }
                let Some(spec) = self.resolve(key) else {
                    continue;
                };
                if let Some(vec) = checked_vector(value, spec.dim) {
                    out.insert(spec.ticker.clone(), vec);
                }
            }
            return out;
        }

        self.zero_vecs()
    }

    fn resolve(&self, key: &str) -> Option<&ChallengeSpec> {
        self.challenges
            .iter()
            .find(|c| c.ticker == key || c.name == key)
    }
}

fn checked_vector(value: &Value, dim: usize) -> Option<Vec<f64>> {
    let items = value.as_array()?;
    if items.len() != dim {
        return None;
    }
    let mut out = Vec::with_capacity(dim);
    for item in items {
        let v = item.as_f64()?;
        if !(-1.0..=1.0).contains(&v) {
            return None;
        }
        out.push(v);
    }
    Some(out)
}
