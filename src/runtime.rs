//! Long-running validator tasks.
//!
//! Two background loops drive the ledger: a decrypt loop that sweeps the
//! pending queue on a fixed cadence, and a save loop that snapshots the
//! ledger to disk. Both shut down cleanly on a watch-channel stop signal.
//! [`ScoringSlot`] keeps the CPU-bound scoring work single-flight so a
//! slow scoring run never stacks up behind itself.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ledger::Ledger;

/// Sweep the pending queue forever, decrypting whatever has matured.
pub async fn decrypt_loop(ledger: Arc<Ledger>, mut stop: watch::Receiver<bool>) {
    let interval = Duration::from_secs(ledger.config().decrypt_interval_secs.max(1));
    info!("Decrypt loop started (every {:?})", interval);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                ledger.process_pending().await;
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("Decrypt loop stopping");
                    return;
                }
            }
        }
    }
}

/// Periodically snapshot the ledger to its configured datalog path.
///
/// Returns immediately when no path is configured. A failed save is
/// logged and retried on the next tick; the loop never dies on I/O
/// errors.
pub async fn save_loop(ledger: Arc<Ledger>, mut stop: watch::Receiver<bool>) {
    let Some(path) = ledger.config().datalog_path.clone() else {
        info!("No datalog path configured; save loop disabled");
        return;
    };
    let interval = Duration::from_secs(ledger.config().save_every_secs.max(1));
    info!("Save loop started (every {:?}, -> {})", interval, path.display());
    if let Err(e) = ledger.save(&path).await {
        warn!("Initial ledger save failed: {:#}", e);
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = ledger.save(&path).await {
                    warn!("Ledger save failed: {:#}", e);
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    if let Err(e) = ledger.save(&path).await {
                        warn!("Final ledger save failed: {:#}", e);
                    }
                    info!("Save loop stopping");
                    return;
                }
            }
        }
    }
}

/// Single-flight slot for CPU-bound scoring work.
///
/// `try_start` refuses to launch while a previous run is still going, so
/// at most one scoring job occupies a blocking thread at a time.
#[derive(Default)]
pub struct ScoringSlot {
    handle: Option<JoinHandle<()>>,
}

impl ScoringSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Launch `job` on a blocking thread unless a previous run is still
    /// in flight. Returns whether the job was started.
    pub fn try_start<F>(&mut self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_busy() {
            return false;
        }
        self.handle = Some(tokio::task::spawn_blocking(job));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_scoring_slot_is_single_flight() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut slot = ScoringSlot::new();

        let (block_tx, block_rx) = std::sync::mpsc::channel::<()>();
        let runs_first = runs.clone();
        assert!(slot.try_start(move || {
            runs_first.fetch_add(1, Ordering::SeqCst);
            block_rx.recv().ok();
        }));

        // second launch is refused while the first still holds the slot
        let runs_second = runs.clone();
        assert!(!slot.try_start(move || {
            runs_second.fetch_add(1, Ordering::SeqCst);
        }));

        block_tx.send(()).unwrap();
        while slot.is_busy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // slot is reusable once the first run finishes
        let runs_third = runs.clone();
        assert!(slot.try_start(move || {
            runs_third.fetch_add(1, Ordering::SeqCst);
        }));
    }

    #[tokio::test]
    async fn test_loops_stop_on_signal() {
        let ledger = Arc::new(Ledger::new(Config::default()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let decrypt = tokio::spawn(decrypt_loop(ledger.clone(), stop_rx.clone()));
        // no datalog path configured, so the save loop exits on its own
        let save = tokio::spawn(save_loop(ledger, stop_rx));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), decrypt)
            .await
            .expect("decrypt loop should stop promptly")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), save)
            .await
            .expect("save loop should stop promptly")
            .unwrap();
    }
}
