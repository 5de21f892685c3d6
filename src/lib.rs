//! MANTIS validator ledger
//!
//! Data backbone for a subnet validator: ingests encrypted miner
//! submissions, unlocks them once the drand beacon publishes the round
//! signature they were locked to, and turns the decrypted embeddings into
//! training data for downstream scoring.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── lib.rs       - Crate root with re-exports
//! ├── config.rs    - Challenge registry and runtime configuration
//! ├── beacon.rs    - Drand signature fetch + permanent per-round cache
//! ├── crypto/      - Unlock protocol
//! │   ├── timelock.rs - Time-lock decryption seam (drand quicknet tld)
//! │   └── unlock.rs   - V1 (plain tlock) and V2 (owner + tlock hybrid)
//! │                     payload formats
//! ├── validate.rs  - Fail-to-zero submission validation
//! ├── ledger/      - Append-only time-indexed store
//! │   ├── series.rs  - Block sequence, per-challenge samples
//! │   ├── dataset.rs - Training matrices with anti-gaming filters
//! │   └── persist.rs - Snapshot save/load (bincode, optional gzip)
//! └── runtime.rs   - Decrypt/save loops and the single-flight scoring slot
//! ```

pub mod beacon;
pub mod config;
pub mod crypto;
pub mod ledger;
pub mod runtime;
pub mod validate;

// Re-export main types for convenience
pub use beacon::BeaconClient;
pub use config::{ChallengeSpec, Config};
pub use crypto::timelock::{DrandTimelock, TimelockDecryptor};
pub use crypto::unlock::{decrypt_v2_payload, PayloadKind};
pub use ledger::dataset::{ChallengeDataset, TrainingData};
pub use ledger::series::{ChallengeSeries, Sample};
pub use ledger::{DecryptStats, Ledger};
pub use runtime::{decrypt_loop, save_loop, ScoringSlot};
pub use validate::SubmissionValidator;
