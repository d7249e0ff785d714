//! # Sweep Workers
//!
//! Background loops that drive persisted work forward: notification retries
//! and scheduled closes, lote building and submission, and lote polling.
//!
//! ## Worker Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SweepWorker<S: Sweep>                           │
//! │                                                                         │
//! │   interval.tick() ──► sweep.sweep() ──► observer.record(name, result)   │
//! │        ▲                                          │                     │
//! │        └──────────────────────────────────────────┘                     │
//! │                                                                         │
//! │   shutdown_rx.recv() ──► break                                          │
//! │                                                                         │
//! │  • Missed ticks are delayed, never bunched                              │
//! │  • A failed sweep is logged; the next tick tries again                  │
//! │  • Workers share nothing but the database                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::batcher::LoteBatcher;
use crate::contingency::ContingencyManager;
use crate::error::{SyncError, SyncResult};
use crate::poller::LotePoller;

// =============================================================================
// Sweep Trait
// =============================================================================

/// What one pass moved forward and what it left behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub progressed: usize,
    pub pending: usize,
}

/// One idempotent pass over persisted state.
#[async_trait]
pub trait Sweep: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn sweep(&self) -> SyncResult<SweepSummary>;
}

/// Notified after every pass.
#[async_trait]
pub trait SweepObserver: Send + Sync {
    async fn record(&self, name: &'static str, result: &SyncResult<SweepSummary>);
}

pub struct NoOpObserver;

#[async_trait]
impl SweepObserver for NoOpObserver {
    async fn record(&self, _name: &'static str, _result: &SyncResult<SweepSummary>) {}
}

// =============================================================================
// Sweeps
// =============================================================================

/// Moves stranded submissions to contingency, closes periods the authority
/// has recovered from or that passed their maximum age, then retries
/// pending notifications.
#[async_trait]
impl Sweep for ContingencyManager {
    fn name(&self) -> &'static str {
        "contingency"
    }

    async fn sweep(&self) -> SyncResult<SweepSummary> {
        let recovered = self.recover_stranded_submissions(self.submission_lease()).await?;

        if self.settings().close_on_recovery {
            self.close_recovered_periods().await?;
        }
        if let Some(max_age) = self.settings().max_period_age() {
            self.close_expired_periods(max_age).await?;
        }

        let sweep = self.retry_pending_notifications().await?;
        Ok(SweepSummary {
            progressed: recovered + sweep.accepted + sweep.healed,
            pending: sweep.deferred,
        })
    }
}

#[async_trait]
impl Sweep for LoteBatcher {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn sweep(&self) -> SyncResult<SweepSummary> {
        let sweep = LoteBatcher::sweep(self).await?;
        Ok(SweepSummary {
            progressed: sweep.submitted,
            pending: sweep.deferred,
        })
    }
}

#[async_trait]
impl Sweep for LotePoller {
    fn name(&self) -> &'static str {
        "poll"
    }

    async fn sweep(&self) -> SyncResult<SweepSummary> {
        let sweep = self.poll_once().await?;
        Ok(SweepSummary {
            progressed: sweep.completed,
            pending: sweep.processing + sweep.query_failed,
        })
    }
}

// =============================================================================
// Sweep Worker
// =============================================================================

/// Runs a [`Sweep`] on a fixed interval until shut down.
pub struct SweepWorker<S: Sweep> {
    sweep: S,
    period: Duration,
    observer: Arc<dyn SweepObserver>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a running worker.
#[derive(Clone)]
pub struct SweepWorkerHandle {
    name: &'static str,
    shutdown_tx: mpsc::Sender<()>,
}

impl SweepWorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::Internal(format!("{} worker already stopped", self.name)))
    }
}

impl<S: Sweep> SweepWorker<S> {
    pub fn new(sweep: S, period: Duration) -> (Self, SweepWorkerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = SweepWorkerHandle {
            name: sweep.name(),
            shutdown_tx,
        };
        let worker = SweepWorker {
            sweep,
            period: period.max(Duration::from_millis(1)),
            observer: Arc::new(NoOpObserver),
            shutdown_rx,
        };
        (worker, handle)
    }

    pub fn with_observer(mut self, observer: Arc<dyn SweepObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Runs the sweep loop. Spawn this as a background task.
    pub async fn run(mut self) {
        let name = self.sweep.name();
        info!(worker = name, period_secs = self.period.as_secs_f64(), "Sweep worker starting");

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let result = self.sweep.sweep().await;
                    match &result {
                        Ok(summary) => debug!(worker = name, ?summary, "Sweep finished"),
                        Err(e) => error!(worker = name, ?e, "Sweep failed"),
                    }
                    self.observer.record(name, &result).await;
                }

                _ = self.shutdown_rx.recv() => {
                    info!(worker = name, "Sweep worker shutting down");
                    break;
                }
            }
        }

        info!(worker = name, "Sweep worker stopped");
    }
}
