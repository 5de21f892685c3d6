use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// One tradable asset the subnet scores predictions for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSpec {
    /// Ticker symbol, the primary challenge key ("BTC")
    pub ticker: String,
    /// Human-readable display name ("Bitcoin"); accepted as an alternate
    /// submission key
    pub name: String,
    /// Embedding width miners must submit for this challenge
    pub dim: usize,
    /// Label horizon in blocks: price change is measured this far ahead
    pub blocks_ahead: u64,
}

/// Drand beacon endpoints and fetch policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrandConfig {
    /// Beacon API base URL
    pub api_url: String,
    /// Beacon chain identifier
    pub beacon_id: String,
    /// Per-request timeout in seconds (applies to both transports)
    pub timeout_secs: u64,
    /// Signature fetch attempts per round during a decrypt pass
    pub signature_retries: u32,
    /// Fixed delay between attempts, in milliseconds
    pub signature_retry_delay_ms: u64,
}

impl Default for DrandConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.drand.sh/v2".to_string(),
            beacon_id: "quicknet".to_string(),
            timeout_secs: 10,
            signature_retries: 3,
            signature_retry_delay_ms: 1000,
        }
    }
}

/// Runtime configuration for the ledger and decrypt pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Challenge registry; order defines the positional submission layout
    pub challenges: Vec<ChallengeSpec>,
    /// Sampling interval: only blocks divisible by this are recorded
    pub sample_every: u64,
    /// Blocks a payload must age before a decrypt attempt is made
    pub maturity_blocks: u64,
    /// Maximum run of identical prices tolerated by the dataset
    /// constructor; 0 disables the filter
    pub max_unchanged_timesteps: u64,
    /// Validator's X25519 owner public key (hex). When absent, V2
    /// payloads are skipped rather than decrypted.
    pub owner_pk_hex: Option<String>,
    /// Drand beacon settings
    pub drand: DrandConfig,
    /// Rounds decrypted concurrently per batch
    pub round_batch: usize,
    /// Pause between round batches, in milliseconds
    pub batch_pause_ms: u64,
    /// Seconds between decrypt passes
    pub decrypt_interval_secs: u64,
    /// Snapshot path; None disables periodic saves
    pub datalog_path: Option<PathBuf>,
    /// Seconds between periodic snapshot saves
    pub save_every_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            challenges: vec![
                ChallengeSpec {
                    ticker: "BTC".to_string(),
                    name: "Bitcoin".to_string(),
                    dim: 100,
                    blocks_ahead: 300,
                },
                ChallengeSpec {
                    ticker: "ETH".to_string(),
                    name: "Ethereum".to_string(),
                    dim: 2,
                    blocks_ahead: 300,
                },
                ChallengeSpec {
                    ticker: "EURUSD".to_string(),
                    name: "Euro".to_string(),
                    dim: 2,
                    blocks_ahead: 300,
                },
                ChallengeSpec {
                    ticker: "XAUUSD".to_string(),
                    name: "Gold".to_string(),
                    dim: 2,
                    blocks_ahead: 300,
                },
            ],
            sample_every: 5,
            maturity_blocks: 300,
            max_unchanged_timesteps: 0,
            owner_pk_hex: None,
            drand: DrandConfig::default(),
            round_batch: 16,
            batch_pause_ms: 100,
            decrypt_interval_secs: 5,
            datalog_path: None,
            save_every_secs: 480 * 12,
        }
    }
}

impl Config {
    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = env::var("MANTIS_CHALLENGES") {
            config.challenges = serde_json::from_str(&raw)
                .context("Invalid MANTIS_CHALLENGES value (expected JSON array)")?;
        }

        if let Ok(every) = env::var("MANTIS_SAMPLE_EVERY") {
            config.sample_every = every.parse().context("Invalid MANTIS_SAMPLE_EVERY value")?;
        }

        if let Ok(blocks) = env::var("MANTIS_MATURITY_BLOCKS") {
            config.maturity_blocks = blocks
                .parse()
                .context("Invalid MANTIS_MATURITY_BLOCKS value")?;
        }

        if let Ok(max) = env::var("MANTIS_MAX_UNCHANGED_TIMESTEPS") {
            config.max_unchanged_timesteps = max
                .parse()
                .context("Invalid MANTIS_MAX_UNCHANGED_TIMESTEPS value")?;
        }

        if let Ok(key) = env::var("MANTIS_OWNER_PUBLIC_KEY_HEX") {
            let key = key.trim().to_string();
            if !key.is_empty() {
                config.owner_pk_hex = Some(key);
            }
        }

        if let Ok(url) = env::var("MANTIS_DRAND_API") {
            config.drand.api_url = url;
        }

        if let Ok(id) = env::var("MANTIS_DRAND_BEACON_ID") {
            config.drand.beacon_id = id;
        }

        if let Ok(path) = env::var("MANTIS_DATALOG_PATH") {
            config.datalog_path = Some(PathBuf::from(path));
        }

        if let Ok(secs) = env::var("MANTIS_SAVE_EVERY_SECONDS") {
            config.save_every_secs = secs
                .parse()
                .context("Invalid MANTIS_SAVE_EVERY_SECONDS value")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.challenges.is_empty() {
            return Err(anyhow::anyhow!("At least one challenge must be configured"));
        }

        if self.sample_every == 0 {
            return Err(anyhow::anyhow!("Sample interval must be non-zero"));
        }

        for (i, a) in self.challenges.iter().enumerate() {
            if a.ticker.is_empty() {
                return Err(anyhow::anyhow!("Challenge {} has an empty ticker", i));
            }
            if a.dim == 0 {
                return Err(anyhow::anyhow!(
                    "Challenge {} has a zero embedding dimension",
                    a.ticker
                ));
            }
            if self.challenges[..i].iter().any(|b| b.ticker == a.ticker) {
                return Err(anyhow::anyhow!("Duplicate challenge ticker: {}", a.ticker));
            }
        }

        // Owner key is optional, but a provided one must be a 32-byte hex key
        if let Some(key) = &self.owner_pk_hex {
            let bytes = hex::decode(key)
                .map_err(|_| anyhow::anyhow!("Owner public key is not valid hex"))?;
            if bytes.len() != 32 {
                return Err(anyhow::anyhow!(
                    "Owner public key must be 32 bytes, got {}",
                    bytes.len()
                ));
            }
        }

        if self.round_batch == 0 {
            return Err(anyhow::anyhow!("Round batch size must be non-zero"));
        }

        Ok(())
    }

    /// Look up a challenge by its ticker.
    pub fn challenge(&self, ticker: &str) -> Option<&ChallengeSpec> {
        self.challenges.iter().find(|c| c.ticker == ticker)
    }

    /// Resolve a submission key to a ticker: either the ticker itself or a
    /// challenge display name.
    pub fn resolve_ticker(&self, key: &str) -> Option<&str> {
        self.challenges
            .iter()
            .find(|c| c.ticker == key || c.name == key)
            .map(|c| c.ticker.as_str())
    }

    /// Decoded owner public key, if one is configured and well-formed.
    pub fn owner_pk_bytes(&self) -> Option<[u8; 32]> {
        let hex_key = self.owner_pk_hex.as_deref()?;
        let bytes = hex::decode(hex_key.trim()).ok()?;
        bytes.try_into().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_duplicate_ticker_rejected() {
        let mut config = Config::default();
        let dup = config.challenges[0].clone();
        config.challenges.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_owner_key_must_be_32_byte_hex() {
        let mut config = Config::default();
        config.owner_pk_hex = Some("abcd".to_string());
        assert!(config.validate().is_err());

        config.owner_pk_hex = Some(hex::encode([7u8; 32]));
        assert!(config.validate().is_ok());
        assert_eq!(config.owner_pk_bytes(), Some([7u8; 32]));
    }

    #[test]
    fn test_resolve_ticker_accepts_names() {
        let config = Config::default();
        assert_eq!(config.resolve_ticker("BTC"), Some("BTC"));
        assert_eq!(config.resolve_ticker("Bitcoin"), Some("BTC"));
        assert_eq!(config.resolve_ticker("Dogecoin"), None);
    }
}
