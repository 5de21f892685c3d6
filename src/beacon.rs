//! Drand beacon signature acquisition.
//!
//! Signatures for past rounds are immutable facts, so a successful fetch is
//! cached forever and never re-requested. Fetching tries the pooled async
//! client first and falls back to a one-shot blocking client on a worker
//! thread, so a wedged async transport never makes signatures unavailable.
//! No retry happens here; retry policy belongs to the decrypt pass.

use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DrandConfig;

#[derive(Debug, Deserialize)]
struct RoundBody {
    signature: String,
}

/// Drand HTTP client with a permanent per-round signature cache.
pub struct BeaconClient {
    api_url: String,
    beacon_id: String,
    timeout: Duration,
    http: Client,
    cache: Mutex<HashMap<u64, Vec<u8>>>,
}

impl BeaconClient {
    pub fn new(drand: &DrandConfig) -> Self {
        Self::with_cache(drand, HashMap::new())
    }

    /// Build a client with a pre-populated cache, used when restoring a
    /// snapshot.
    pub fn with_cache(drand: &DrandConfig, cache: HashMap<u64, Vec<u8>>) -> Self {
        let timeout = Duration::from_secs(drand.timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("mantis-ledger/0.3")
            .build()
            .unwrap_or_default();

        Self {
            api_url: drand.api_url.trim_end_matches('/').to_string(),
            beacon_id: drand.beacon_id.clone(),
            timeout,
            http,
            cache: Mutex::new(cache),
        }
    }

    fn round_url(&self, round: u64) -> String {
        format!(
            "{}/beacons/{}/rounds/{}",
            self.api_url, self.beacon_id, round
        )
    }

    /// Fetch the signature for `round`, consulting the cache first.
    ///
    /// Returns `None` on any transport or decoding failure; the caller
    /// decides whether and when to try again.
    pub async fn get_signature(&self, round: u64) -> Option<Vec<u8>> {
        if let Some(sig) = self.cache.lock().await.get(&round).cloned() {
            return Some(sig);
        }

        let url = self.round_url(round);

        if let Some(sig) = self.fetch_async(&url).await {
            self.cache.lock().await.insert(round, sig.clone());
            return Some(sig);
        }

        if let Some(sig) = self.fetch_blocking(&url).await {
            self.cache.lock().await.insert(round, sig.clone());
            return Some(sig);
        }

        None
    }

    async fn fetch_async(&self, url: &str) -> Option<Vec<u8>> {
        let resp = match self.http.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!("async beacon fetch failed for {}: {}", url, e);
                return None;
            }
        };
        if !resp.status().is_success() {
            debug!("beacon returned {} for {}", resp.status(), url);
            return None;
        }
        let body: RoundBody = resp.json().await.ok()?;
        decode_signature(&body.signature)
    }

    async fn fetch_blocking(&self, url: &str) -> Option<Vec<u8>> {
        let url = url.to_string();
        let timeout = self.timeout;
        let result = tokio::task::spawn_blocking(move || {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()
                .ok()?;
            let resp = client.get(&url).send().ok()?;
            if !resp.status().is_success() {
                return None;
            }
            let body: RoundBody = resp.json().ok()?;
            decode_signature(&body.signature)
        })
        .await;

        match result {
            Ok(sig) => sig,
            Err(e) => {
                debug!("blocking beacon fetch task failed: {}", e);
                None
            }
        }
    }

    /// Insert a known signature, used when restoring a snapshot and by
    /// tests that stub out the beacon.
    pub async fn seed(&self, round: u64, signature: Vec<u8>) {
        self.cache.lock().await.insert(round, signature);
    }

    /// Point-in-time copy of the cache, for persistence.
    pub async fn snapshot(&self) -> HashMap<u64, Vec<u8>> {
        self.cache.lock().await.clone()
    }
}

fn decode_signature(sig_hex: &str) -> Option<Vec<u8>> {
    let sig = hex::decode(sig_hex.trim()).ok()?;
    if sig.is_empty() {
        return None;
    }
    Some(sig)
}
