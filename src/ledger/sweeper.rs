//! Background eviction for the idempotency ledger.
//!
//! Lazy eviction only touches keys that are looked up again; the sweeper
//! bounds memory for keys that never are.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};

use super::IdempotencyLedger;

/// Statistics from a sweep cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepStats {
    /// Number of expired keys removed
    pub evicted: usize,
    /// Keys still retained afterwards
    pub retained: usize,
    /// When the sweep completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// Periodic ledger sweep running in a spawned task.
#[derive(Debug)]
pub struct LedgerSweeper {
    ledger: Arc<Mutex<IdempotencyLedger>>,
    period: Duration,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl LedgerSweeper {
    pub fn new(ledger: Arc<Mutex<IdempotencyLedger>>, period: Duration) -> Self {
        Self {
            ledger,
            period,
            stop_tx: None,
        }
    }

    /// Start the sweep loop in the background.
    /// Returns immediately; sweeping runs in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let ledger = self.ledger.clone();
        let period = self.period.max(Duration::from_millis(10));
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_once(&ledger).await;
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("ledger_sweeper_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweep loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single sweep.
    pub async fn run_once(ledger: &Arc<Mutex<IdempotencyLedger>>) -> SweepStats {
        let now = Utc::now();
        let mut guard = ledger.lock().await;
        let evicted = guard.sweep(now);
        SweepStats {
            evicted,
            retained: guard.len(),
            completed_at: Some(now),
        }
    }
}

impl Drop for LedgerSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
