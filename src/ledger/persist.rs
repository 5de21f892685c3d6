//! Snapshot serialization.
//!
//! The whole ledger persists as one bincode artifact, gzip-compressed when
//! the path carries a `.gz` suffix. Durability is best effort: the chain
//! and beacon data can be replayed, so a load failure of any kind falls
//! back to a fresh ledger instead of failing startup.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::Path;

use crate::ledger::series::ChallengeSeries;

/// Bumped on any incompatible change to the snapshot layout; a mismatch
/// loads as an empty ledger.
pub(crate) const SNAPSHOT_VERSION: u32 = 1;

/// Point-in-time copy of the full ledger state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub version: u32,
    pub blocks: Vec<u64>,
    pub challenges: BTreeMap<String, ChallengeSeries>,
    pub raw_payloads: BTreeMap<usize, HashMap<String, Vec<u8>>>,
    pub beacon_cache: HashMap<u64, Vec<u8>>,
}

pub(crate) fn is_gzip_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

pub(crate) fn encode(snapshot: &Snapshot, gzip: bool) -> Result<Vec<u8>> {
    let raw = bincode::serialize(snapshot).context("Failed to serialize ledger snapshot")?;
    if !gzip {
        return Ok(raw);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .context("Failed to compress ledger snapshot")?;
    encoder.finish().context("Failed to finish gzip stream")
}

/// Decode a snapshot, returning `None` on any corruption or version
/// mismatch.
pub(crate) fn decode(bytes: &[u8], gzip: bool) -> Option<Snapshot> {
    let raw: Vec<u8> = if gzip {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).ok()?;
        out
    } else {
        bytes.to_vec()
    };
    let snapshot: Snapshot = bincode::deserialize(&raw).ok()?;
    if snapshot.version != SNAPSHOT_VERSION {
        return None;
    }
    Some(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> Snapshot {
        let mut series = ChallengeSeries::new(2, 300);
        series.set_price(3, 42.5);
        series.set_embedding(3, "hk1", &[0.5, -0.5]);
        Snapshot {
            version: SNAPSHOT_VERSION,
            blocks: vec![10, 15, 20],
            challenges: BTreeMap::from([("BTC".to_string(), series)]),
            raw_payloads: BTreeMap::from([(2usize, HashMap::from([("hk1".to_string(), b"{}".to_vec())]))]),
            beacon_cache: HashMap::from([(9u64, vec![1, 2, 3])]),
        }
    }

    #[test]
    fn test_round_trip_plain_and_gzip() {
        let snapshot = sample_snapshot();
        for gzip in [false, true] {
            let bytes = encode(&snapshot, gzip).unwrap();
            let back = decode(&bytes, gzip).unwrap();
            assert_eq!(back.blocks, snapshot.blocks);
            assert_eq!(back.beacon_cache[&9], vec![1, 2, 3]);
            let series = &back.challenges["BTC"];
            assert_eq!(series.samples[&3].price, Some(42.5));
            assert_eq!(series.samples[&3].hotkeys, vec!["hk1"]);
        }
    }

    #[test]
    fn test_corrupt_bytes_decode_to_none() {
        assert!(decode(b"not a snapshot", false).is_none());
        assert!(decode(b"not gzip either", true).is_none());
    }

    #[test]
    fn test_version_mismatch_decodes_to_none() {
        let mut snapshot = sample_snapshot();
        snapshot.version = SNAPSHOT_VERSION + 1;
        let bytes = encode(&snapshot, false).unwrap();
        assert!(decode(&bytes, false).is_none());
    }

    #[test]
    fn test_gzip_path_detection() {
        assert!(is_gzip_path(Path::new("/tmp/datalog.bin.gz")));
        assert!(!is_gzip_path(Path::new("/tmp/datalog.bin")));
        assert!(!is_gzip_path(Path::new("datalog")));
    }
}
