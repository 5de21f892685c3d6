//! The submission ledger.
//!
//! Single logical owner of all validator state: the observed block
//! sequence, per-challenge price/embedding series, the pending
//! raw-payload queue and the beacon signature cache. Every mutation goes
//! through one mutex, and the lock is never held across a network call or
//! a decrypt attempt — `process_pending` snapshots the queue, does all
//! crypto and beacon I/O off-lock, and merges results back under the lock.

pub mod dataset;
pub mod persist;
pub mod series;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::beacon::BeaconClient;
use crate::config::Config;
use crate::crypto::timelock::{DrandTimelock, TimelockDecryptor};
use crate::crypto::unlock::{classify, decrypt_v2_payload, open_v1, PayloadKind};
use crate::ledger::dataset::TrainingData;
use crate::ledger::persist::{Snapshot, SNAPSHOT_VERSION};
use crate::ledger::series::ChallengeSeries;
use crate::validate::SubmissionValidator;

/// Placeholder stored for hotkeys that submitted nothing this step.
const EMPTY_PAYLOAD: &[u8] = b"{}";

/// Aggregate counters from one decrypt pass. Observability only; nothing
/// reads these to make decisions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecryptStats {
    /// Decrypt attempts actually made (signature present, recognized format)
    pub payloads: u64,
    /// Attempts that failed to produce a valid plaintext
    pub decrypt_failures: u64,
    /// Matured V1 payloads seen
    pub v1: u64,
    /// Matured V2 payloads seen
    pub v2: u64,
    pub v1_failures: u64,
    pub v2_failures: u64,
    /// Rounds a signature fetch was attempted for
    pub signature_fetch_attempts: u64,
    /// Rounds where all attempts failed
    pub signature_fetch_failures: u64,
}

impl DecryptStats {
    fn merge(&mut self, other: DecryptStats) {
        self.payloads += other.payloads;
        self.decrypt_failures += other.decrypt_failures;
        self.v1 += other.v1;
        self.v2 += other.v2;
        self.v1_failures += other.v1_failures;
        self.v2_failures += other.v2_failures;
        self.signature_fetch_attempts += other.signature_fetch_attempts;
        self.signature_fetch_failures += other.signature_fetch_failures;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerState {
    /// Observed block heights; position is the timestep
    blocks: Vec<u64>,
    /// Ticker → series
    challenges: BTreeMap<String, ChallengeSeries>,
    /// Timestep → hotkey → raw ciphertext bytes, the write-ahead queue
    raw_payloads: BTreeMap<usize, HashMap<String, Vec<u8>>>,
}

/// One mature payload queued for a decrypt worker.
struct WorkItem {
    ts: usize,
    hotkey: String,
    data: Value,
    kind: PayloadKind,
}

/// Decrypted vectors keyed back to their origin.
type Decrypted = (usize, String, HashMap<String, Vec<f64>>);

/// Append-only time-indexed store of encrypted submissions, with the
/// maturity-gated decrypt pipeline over it.
pub struct Ledger {
    config: Config,
    validator: SubmissionValidator,
    state: Mutex<LedgerState>,
    beacon: BeaconClient,
    tlock: Arc<dyn TimelockDecryptor>,
}

impl Ledger {
    pub fn new(config: Config) -> Self {
        Self::with_timelock(config, Arc::new(DrandTimelock))
    }

    /// Build a ledger with a custom time-lock backend (tests stub this).
    pub fn with_timelock(config: Config, tlock: Arc<dyn TimelockDecryptor>) -> Self {
        let beacon = BeaconClient::new(&config.drand);
        let state = empty_state(&config);
        Self {
            validator: SubmissionValidator::new(&config.challenges),
            state: Mutex::new(state),
            beacon,
            tlock,
            config,
        }
    }

    /// Restore from a snapshot file, or start empty if the file is
    /// missing, corrupt or from an incompatible schema.
    pub fn load(config: Config, path: &Path) -> Self {
        Self::load_with_timelock(config, path, Arc::new(DrandTimelock))
    }

    pub fn load_with_timelock(
        config: Config,
        path: &Path,
        tlock: Arc<dyn TimelockDecryptor>,
    ) -> Self {
        let snapshot = std::fs::read(path)
            .ok()
            .and_then(|bytes| persist::decode(&bytes, persist::is_gzip_path(path)));

        match snapshot {
            Some(snapshot) => {
                info!(
                    "Restored ledger snapshot from {} ({} blocks, {} pending timesteps)",
                    path.display(),
                    snapshot.blocks.len(),
                    snapshot.raw_payloads.len()
                );
                Self::from_snapshot(config, snapshot, tlock)
            }
            None => {
                warn!(
                    "No usable ledger snapshot at {}; starting empty",
                    path.display()
                );
                Self::with_timelock(config, tlock)
            }
        }
    }

    fn from_snapshot(config: Config, snapshot: Snapshot, tlock: Arc<dyn TimelockDecryptor>) -> Self {
        let mut challenges = snapshot.challenges;
        // Challenges added to the config since the snapshot start empty
        for spec in &config.challenges {
            challenges
                .entry(spec.ticker.clone())
                .or_insert_with(|| ChallengeSeries::new(spec.dim, spec.blocks_ahead));
        }
        let state = LedgerState {
            blocks: snapshot.blocks,
            challenges,
            raw_payloads: snapshot.raw_payloads,
        };
        Self {
            validator: SubmissionValidator::new(&config.challenges),
            state: Mutex::new(state),
            beacon: BeaconClient::with_cache(&config.drand, snapshot.beacon_cache),
            tlock,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Beacon client, exposed so tests and snapshot tooling can seed
    /// signatures.
    pub fn beacon(&self) -> &BeaconClient {
        &self.beacon
    }

    /// Record one sampled block: its prices and one raw payload per known
    /// hotkey (an empty-object placeholder when a hotkey sent nothing).
    pub async fn append(
        &self,
        block: u64,
        prices: &HashMap<String, f64>,
        payloads: &HashMap<String, Vec<u8>>,
        hotkeys: &[String],
    ) {
        let mut state = self.state.lock().await;
        state.blocks.push(block);
        let ts = state.blocks.len() - 1;
        let sidx = block / self.config.sample_every;

        for spec in &self.config.challenges {
            if let Some(&price) = prices.get(&spec.ticker) {
                if let Some(series) = state.challenges.get_mut(&spec.ticker) {
                    series.set_price(sidx, price);
                }
            }
        }

        let entry = state.raw_payloads.entry(ts).or_default();
        for hotkey in hotkeys {
            let raw = payloads
                .get(hotkey)
                .filter(|raw| !raw.is_empty())
                .cloned()
                .unwrap_or_else(|| EMPTY_PAYLOAD.to_vec());
            entry.insert(hotkey.clone(), raw);
        }
    }

    /// Decrypt every matured pending payload and merge the results.
    ///
    /// Payloads are mature once `current_block - block_at_timestep >=
    /// maturity_blocks`. Mature entries are grouped by beacon round and
    /// processed in bounded concurrent batches; each round's signature is
    /// fetched with a bounded retry. Whatever the outcome, processed
    /// entries leave the queue; only non-all-zero vectors are written into
    /// the series, so "submitted zeros" stays indistinguishable from
    /// "never submitted" by design.
    pub async fn process_pending(&self) -> DecryptStats {
        let (payloads, blocks) = {
            let state = self.state.lock().await;
            (state.raw_payloads.clone(), state.blocks.clone())
        };

        let mut stats = DecryptStats::default();
        let Some(&current_block) = blocks.last() else {
            return stats;
        };
        if payloads.is_empty() {
            return stats;
        }

        let mut mature: Vec<(usize, String)> = Vec::new();
        let mut rounds: BTreeMap<u64, Vec<WorkItem>> = BTreeMap::new();

        for (&ts, by_hotkey) in &payloads {
            let Some(&block_at) = blocks.get(ts) else {
                continue;
            };
            if current_block.saturating_sub(block_at) < self.config.maturity_blocks {
                continue;
            }
            for (hotkey, raw) in by_hotkey {
                mature.push((ts, hotkey.clone()));
                let data: Value =
                    serde_json::from_slice(raw).unwrap_or_else(|_| Value::Object(Default::default()));
                let kind = classify(&data);
                match kind {
                    PayloadKind::V1 { .. } => stats.v1 += 1,
                    PayloadKind::V2 { .. } => stats.v2 += 1,
                    PayloadKind::Opaque => continue,
                }
                rounds.entry(kind.round()).or_default().push(WorkItem {
                    ts,
                    hotkey: hotkey.clone(),
                    data,
                    kind,
                });
            }
        }

        if mature.is_empty() {
            return stats;
        }

        let owner_pk = self.config.owner_pk_bytes();
        let round_items: Vec<(u64, Vec<WorkItem>)> = rounds.into_iter().collect();
        let mut decrypted: Vec<Decrypted> = Vec::new();

        for batch in round_items.chunks(self.config.round_batch) {
            let workers = batch
                .iter()
                .map(|(round, items)| self.decrypt_round(*round, items, owner_pk));
            for (results, batch_stats) in futures::future::join_all(workers).await {
                decrypted.extend(results);
                stats.merge(batch_stats);
            }
            tokio::time::sleep(Duration::from_millis(self.config.batch_pause_ms)).await;
        }

        {
            let mut state = self.state.lock().await;
            for (ts, hotkey, vecs) in decrypted {
                let Some(&block) = blocks.get(ts) else {
                    continue;
                };
                if block % self.config.sample_every != 0 {
                    continue;
                }
                let sidx = block / self.config.sample_every;
                for (ticker, vec) in vecs {
                    if vec.iter().any(|v| *v != 0.0) {
                        if let Some(series) = state.challenges.get_mut(&ticker) {
                            series.set_embedding(sidx, &hotkey, &vec);
                        }
                    }
                }
            }
            for (ts, hotkey) in &mature {
                if let Some(by_hotkey) = state.raw_payloads.get_mut(ts) {
                    by_hotkey.remove(hotkey);
                    if by_hotkey.is_empty() {
                        state.raw_payloads.remove(ts);
                    }
                }
            }
        }

        log_summary(&stats);
        stats
    }

    /// Resolve one round's signature (bounded retry) and decrypt its items.
    async fn decrypt_round(
        &self,
        round: u64,
        items: &[WorkItem],
        owner_pk: Option<[u8; 32]>,
    ) -> (Vec<Decrypted>, DecryptStats) {
        let mut stats = DecryptStats::default();
        let mut results = Vec::new();

        let mut signature: Option<Vec<u8>> = None;
        if round > 0 {
            stats.signature_fetch_attempts += 1;
            let retries = self.config.drand.signature_retries.max(1);
            for attempt in 0..retries {
                signature = self.beacon.get_signature(round).await;
                if signature.is_some() {
                    break;
                }
                if attempt + 1 < retries {
                    tokio::time::sleep(Duration::from_millis(
                        self.config.drand.signature_retry_delay_ms,
                    ))
                    .await;
                }
            }
            if signature.is_none() && !items.is_empty() {
                warn!(
                    "Failed to fetch drand signature for round {} after {} attempts",
                    round, retries
                );
                stats.signature_fetch_failures += 1;
            }
        }

        // Without a signature every item in the round degrades to zeros,
        // which the merge phase simply does not record.
        let Some(signature) = signature else {
            return (results, stats);
        };

        for item in items {
            match item.kind {
                PayloadKind::V1 { .. } => {
                    if !item
                        .data
                        .get("ciphertext")
                        .is_some_and(Value::is_string)
                    {
                        continue;
                    }
                    stats.payloads += 1;
                    match open_v1(&item.data, &signature, &item.hotkey, &*self.tlock) {
                        Some(submission) => {
                            results.push((
                                item.ts,
                                item.hotkey.clone(),
                                self.validator.validate(&submission),
                            ));
                        }
                        None => {
                            stats.decrypt_failures += 1;
                            stats.v1_failures += 1;
                        }
                    }
                }
                PayloadKind::V2 { .. } => {
                    stats.payloads += 1;
                    let plaintext =
                        decrypt_v2_payload(&item.data, &signature, owner_pk, &*self.tlock);
                    let submission = plaintext.and_then(|pt| {
                        let obj: Value = serde_json::from_slice(&pt).ok()?;
                        if obj.get("hotkey").and_then(Value::as_str) != Some(item.hotkey.as_str()) {
                            return None;
                        }
                        Some(obj)
                    });
                    match submission {
                        Some(submission) => {
                            results.push((
                                item.ts,
                                item.hotkey.clone(),
                                self.validator.validate(&submission),
                            ));
                        }
                        None => {
                            stats.decrypt_failures += 1;
                            stats.v2_failures += 1;
                        }
                    }
                }
                PayloadKind::Opaque => {}
            }
        }

        (results, stats)
    }

    /// Remove embeddings for hotkeys that left the metagraph. Prices and
    /// the pending queue are untouched.
    pub async fn prune_hotkeys(&self, active: &HashSet<String>) {
        let mut state = self.state.lock().await;
        for series in state.challenges.values_mut() {
            series.prune_hotkeys(active);
        }
    }

    /// Build training matrices from a point-in-time copy of the series.
    /// The lock is released before any matrix work happens.
    pub async fn get_training_data(&self, max_block: Option<u64>) -> TrainingData {
        let challenges = {
            let state = self.state.lock().await;
            state.challenges.clone()
        };
        dataset::build(
            &challenges,
            self.config.sample_every,
            self.config.max_unchanged_timesteps,
            max_block,
        )
    }

    /// First block at which each hotkey stored a non-zero embedding, for
    /// downstream age-based weighting.
    pub async fn first_nonzero_blocks(&self) -> HashMap<String, u64> {
        let state = self.state.lock().await;
        let mut first: HashMap<String, u64> = HashMap::new();
        for series in state.challenges.values() {
            for (&sidx, sample) in &series.samples {
                let block = sidx * self.config.sample_every;
                for (hotkey, vec) in &sample.embeddings {
                    if vec.iter().any(|v| *v != half::f16::ZERO) {
                        first
                            .entry(hotkey.clone())
                            .and_modify(|b| *b = (*b).min(block))
                            .or_insert(block);
                    }
                }
            }
        }
        first
    }

    /// Observed block sequence.
    pub async fn blocks(&self) -> Vec<u64> {
        self.state.lock().await.blocks.clone()
    }

    /// Copy of one challenge's series.
    pub async fn challenge(&self, ticker: &str) -> Option<ChallengeSeries> {
        self.state.lock().await.challenges.get(ticker).cloned()
    }

    /// Pending queue contents, keyed by timestep.
    pub async fn pending_payloads(&self) -> BTreeMap<usize, HashMap<String, Vec<u8>>> {
        self.state.lock().await.raw_payloads.clone()
    }

    async fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().await;
        Snapshot {
            version: SNAPSHOT_VERSION,
            blocks: state.blocks.clone(),
            challenges: state.challenges.clone(),
            raw_payloads: state.raw_payloads.clone(),
            beacon_cache: self.beacon.snapshot().await,
        }
    }

    /// Serialize the full ledger to `path`; a `.gz` suffix selects gzip.
    /// The state lock is held only while cloning, not during the write.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot().await;
        let gzip = persist::is_gzip_path(path);
        let bytes = persist::encode(&snapshot, gzip)?;
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::write(&target, bytes)
                .with_context(|| format!("Failed to write ledger snapshot to {}", target.display()))
        })
        .await
        .context("Snapshot write task panicked")??;
        info!("Saved ledger snapshot to {}", path.display());
        Ok(())
    }
}

fn empty_state(config: &Config) -> LedgerState {
    LedgerState {
        blocks: Vec::new(),
        challenges: config
            .challenges
            .iter()
            .map(|c| (c.ticker.clone(), ChallengeSeries::new(c.dim, c.blocks_ahead)))
            .collect(),
        raw_payloads: BTreeMap::new(),
    }
}

fn log_summary(stats: &DecryptStats) {
    if stats.payloads > 0 {
        info!(
            "Payload decryption failures: {}/{} ({:.2}%)",
            stats.decrypt_failures,
            stats.payloads,
            100.0 * stats.decrypt_failures as f64 / stats.payloads as f64
        );
    }
    let version_total = stats.v1 + stats.v2;
    if version_total > 0 {
        let pct = |part: u64, total: u64| {
            if total > 0 {
                100.0 * part as f64 / total as f64
            } else {
                0.0
            }
        };
        info!(
            "Payload mix (matured): V2 {}/{} ({:.1}%), V1 {}/{} ({:.1}%); failures V2 {}/{} ({:.1}%), V1 {}/{} ({:.1}%)",
            stats.v2,
            version_total,
            pct(stats.v2, version_total),
            stats.v1,
            version_total,
            pct(stats.v1, version_total),
            stats.v2_failures,
            stats.v2,
            pct(stats.v2_failures, stats.v2),
            stats.v1_failures,
            stats.v1,
            pct(stats.v1_failures, stats.v1),
        );
    }
    if stats.signature_fetch_attempts > 0 {
        info!(
            "Drand signature fetch failures: {}/{} rounds ({:.2}%)",
            stats.signature_fetch_failures,
            stats.signature_fetch_attempts,
            100.0 * stats.signature_fetch_failures as f64 / stats.signature_fetch_attempts as f64
        );
    }
}
