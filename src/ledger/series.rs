//! Time-indexed per-challenge storage.
//!
//! The ledger's native time axis is the *sample index*: block height
//! divided by the sampling interval. Each challenge keeps one [`Sample`]
//! per index with the observed price and the decrypted embedding per
//! hotkey.

use half::f16;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One observation point for a challenge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sample {
    /// Price at this sample, when the feed returned one
    pub price: Option<f64>,
    /// Decrypted embedding per hotkey, stored at half precision
    pub embeddings: HashMap<String, Vec<f16>>,
    /// Hotkeys in insertion order. A hotkey appears here iff it has an
    /// embedding entry; the order keeps matrix row layout reproducible.
    pub hotkeys: Vec<String>,
}

impl Sample {
    pub fn set_embedding(&mut self, hotkey: &str, vec: Vec<f16>) {
        self.embeddings.insert(hotkey.to_string(), vec);
        if !self.hotkeys.iter().any(|hk| hk == hotkey) {
            self.hotkeys.push(hotkey.to_string());
        }
    }

    /// True when at least one stored embedding has a non-zero element.
    pub fn has_nonzero_embedding(&self) -> bool {
        self.embeddings
            .values()
            .any(|vec| vec.iter().any(|v| *v != f16::ZERO))
    }
}

/// Append-mostly series of samples for one challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSeries {
    /// Embedding width for this challenge
    pub dim: usize,
    /// Label horizon in blocks
    pub blocks_ahead: u64,
    /// Sample index → sample; BTreeMap for deterministic ascending walks
    pub samples: BTreeMap<u64, Sample>,
}

impl ChallengeSeries {
    pub fn new(dim: usize, blocks_ahead: u64) -> Self {
        Self {
            dim,
            blocks_ahead,
            samples: BTreeMap::new(),
        }
    }

    pub fn set_price(&mut self, sidx: u64, price: f64) {
        self.samples.entry(sidx).or_default().price = Some(price);
    }

    /// Record a decrypted embedding, converting to half precision.
    pub fn set_embedding(&mut self, sidx: u64, hotkey: &str, vec: &[f64]) {
        let vec = vec.iter().map(|v| f16::from_f64(*v)).collect();
        self.samples
            .entry(sidx)
            .or_default()
            .set_embedding(hotkey, vec);
    }

    /// Drop embeddings for hotkeys no longer in the active set. Prices are
    /// untouched.
    pub fn prune_hotkeys(&mut self, active: &HashSet<String>) {
        for sample in self.samples.values_mut() {
            sample.embeddings.retain(|hk, _| active.contains(hk));
            sample.hotkeys.retain(|hk| active.contains(hk));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_keeps_hotkey_order_invariant() {
        let mut series = ChallengeSeries::new(2, 300);
        series.set_embedding(0, "hk_b", &[0.1, 0.2]);
        series.set_embedding(0, "hk_a", &[0.3, 0.4]);
        series.set_embedding(0, "hk_b", &[0.5, 0.6]); // overwrite, no duplicate

        let sample = &series.samples[&0];
        assert_eq!(sample.hotkeys, vec!["hk_b", "hk_a"]);
        assert_eq!(sample.embeddings.len(), 2);
        assert_eq!(sample.embeddings["hk_b"][0], f16::from_f64(0.5));
    }

    #[test]
    fn test_prune_hotkeys_keeps_prices() {
        let mut series = ChallengeSeries::new(1, 300);
        series.set_price(0, 100.0);
        series.set_embedding(0, "gone", &[0.5]);
        series.set_embedding(0, "kept", &[0.7]);

        let active: HashSet<String> = ["kept".to_string()].into();
        series.prune_hotkeys(&active);

        let sample = &series.samples[&0];
        assert_eq!(sample.price, Some(100.0));
        assert_eq!(sample.hotkeys, vec!["kept"]);
        assert!(!sample.embeddings.contains_key("gone"));
    }

    #[test]
    fn test_has_nonzero_embedding() {
        let mut sample = Sample::default();
        assert!(!sample.has_nonzero_embedding());
        sample.set_embedding("hk", vec![f16::ZERO, f16::ZERO]);
        assert!(!sample.has_nonzero_embedding());
        sample.set_embedding("hk", vec![f16::ZERO, f16::from_f64(0.5)]);
        assert!(sample.has_nonzero_embedding());
    }
}
