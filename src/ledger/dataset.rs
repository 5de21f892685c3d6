//! Training-set construction.
//!
//! Pure function over a ledger snapshot: no mutation, no locking. The
//! anti-gaming filters drop samples a miner could exploit — frozen price
//! feeds (long unchanged-price streaks), non-positive prices, and samples
//! carrying nothing but zero vectors.

use half::f16;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::ledger::series::ChallengeSeries;

/// Supervised-learning matrices for one challenge.
#[derive(Debug, Clone)]
pub struct ChallengeDataset {
    /// One row per retained sample: the `hotkeys × dim` embedding matrix
    /// flattened in hotkey-index order; absent hotkeys contribute zeros
    pub features: Vec<Vec<f16>>,
    /// Column layout: hotkey → row block index, stable by sort order
    pub hotkey_index: BTreeMap<String, usize>,
    /// Relative price change `(future - current) / current` per row
    pub labels: Vec<f32>,
}

/// Per-challenge datasets keyed by ticker.
pub type TrainingData = HashMap<String, ChallengeDataset>;

/// Build training data from a challenge-series snapshot.
///
/// `max_block` caps the newest sample considered; `max_unchanged` is the
/// longest tolerated run of identical prices (0 disables the filter).
pub fn build(
    challenges: &BTreeMap<String, ChallengeSeries>,
    sample_every: u64,
    max_unchanged: u64,
    max_block: Option<u64>,
) -> TrainingData {
    let mut out = TrainingData::new();

    for (ticker, series) in challenges {
        let ahead = series.blocks_ahead / sample_every;

        let all_hotkeys: BTreeSet<&str> = series
            .samples
            .values()
            .flat_map(|s| s.embeddings.keys())
            .map(String::as_str)
            .collect();
        if all_hotkeys.is_empty() {
            continue;
        }
        let hotkey_index: BTreeMap<String, usize> = all_hotkeys
            .iter()
            .enumerate()
            .map(|(i, hk)| (hk.to_string(), i))
            .collect();

        let mut features = Vec::new();
        let mut labels = Vec::new();
        let mut prev_price: Option<f64> = None;
        let mut unchanged_streak: u64 = 0;

        for (&sidx, sample) in &series.samples {
            let block = sidx * sample_every;
            if max_block.is_some_and(|max| block > max) {
                break;
            }

            // Streak accounting runs on every priced sample, retained or not
            if let Some(price) = sample.price {
                if prev_price != Some(price) {
                    prev_price = Some(price);
                    unchanged_streak = 0;
                } else {
                    unchanged_streak += 1;
                }
            }
            if max_unchanged > 0 && unchanged_streak > max_unchanged {
                continue;
            }

            let Some(price_now) = sample.price else {
                continue;
            };
            let Some(price_future) = series
                .samples
                .get(&(sidx + ahead))
                .and_then(|future| future.price)
            else {
                continue;
            };
            if price_now <= 0.0 || price_future <= 0.0 {
                continue;
            }
            if sample.embeddings.is_empty() || !sample.has_nonzero_embedding() {
                continue;
            }

            let mut row = vec![f16::ZERO; hotkey_index.len() * series.dim];
            for (hotkey, vec) in &sample.embeddings {
                let base = hotkey_index[hotkey] * series.dim;
                let width = vec.len().min(series.dim);
                row[base..base + width].copy_from_slice(&vec[..width]);
            }

            features.push(row);
            labels.push(((price_future - price_now) / price_now) as f32);
        }

        if !features.is_empty() {
            out.insert(
                ticker.clone(),
                ChallengeDataset {
                    features,
                    hotkey_index,
                    labels,
                },
            );
        }
    }

    out
}
