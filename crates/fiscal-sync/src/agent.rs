//! # Contingency Agent
//!
//! Owns the background sweeps and reports their progress.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ContingencyAgent Architecture                      │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                       ContingencyAgent                           │  │
//! │  │                                                                  │  │
//! │  │  • Spawns one SweepWorker per sweep                              │  │
//! │  │  • Folds sweep results into AgentStatus                          │  │
//! │  │  • Emits status / progress / error events                        │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  contingency   │  │     batch      │  │        poll            │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Scheduled      │  │ Builds lotes   │  │ Queries outstanding    │    │
//! │  │ closes, notif- │  │ for closed     │  │ lotes and applies      │    │
//! │  │ ication retry  │  │ periods        │  │ per-document results   │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  The workers never talk to each other: each reads what the previous   │
//! │  stage persisted.                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fiscal_db::Database;

use crate::config::FiscalConfig;
use crate::contingency::{EventSigner, PassthroughSigner};
use crate::engine::FiscalEngine;
use crate::error::{SyncError, SyncResult};
use crate::gateway::AuthorityGateway;
use crate::worker::{Sweep, SweepObserver, SweepSummary, SweepWorker, SweepWorkerHandle};

// =============================================================================
// Agent Status
// =============================================================================

/// Last known state of one worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatus {
    pub name: &'static str,
    pub runs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_summary: Option<SweepSummary>,
    pub last_error: Option<String>,
}

/// Current agent status for external queries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub workers: Vec<WorkerStatus>,
}

impl AgentStatus {
    pub fn worker(&self, name: &str) -> Option<&WorkerStatus> {
        self.workers.iter().find(|w| w.name == name)
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives agent events (log shipping, a status endpoint, a UI).
pub trait AgentEventEmitter: Send + Sync {
    fn emit_status(&self, status: &AgentStatus);

    /// `progressed` and `pending` come from the worker's last sweep.
    fn emit_progress(&self, worker: &str, progressed: usize, pending: usize);

    fn emit_error(&self, worker: &str, message: &str, retryable: bool);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl AgentEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &AgentStatus) {}
    fn emit_progress(&self, _worker: &str, _progressed: usize, _pending: usize) {}
    fn emit_error(&self, _worker: &str, _message: &str, _retryable: bool) {}
}

/// Folds sweep results into the shared status.
struct StatusObserver {
    status: Arc<RwLock<AgentStatus>>,
    emitter: Arc<dyn AgentEventEmitter>,
}

#[async_trait]
impl SweepObserver for StatusObserver {
    async fn record(&self, name: &'static str, result: &SyncResult<SweepSummary>) {
        let mut status = self.status.write().await;
        let Some(worker) = status.workers.iter_mut().find(|w| w.name == name) else {
            return;
        };
        worker.runs += 1;
        worker.last_run = Some(Utc::now());

        match result {
            Ok(summary) => {
                worker.last_summary = Some(*summary);
                worker.last_error = None;
                if summary.progressed > 0 || summary.pending > 0 {
                    self.emitter.emit_progress(name, summary.progressed, summary.pending);
                }
            }
            Err(e) => {
                worker.last_error = Some(e.to_string());
                self.emitter.emit_error(name, &e.to_string(), e.is_retryable());
            }
        }
    }
}

// =============================================================================
// Contingency Agent
// =============================================================================

pub struct ContingencyAgent {
    config: Arc<FiscalConfig>,
    engine: FiscalEngine,
    status: Arc<RwLock<AgentStatus>>,
    emitter: Arc<dyn AgentEventEmitter>,
    workers: Vec<SweepWorkerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ContingencyAgent {
    pub fn new(config: FiscalConfig, engine: FiscalEngine) -> Self {
        Self::with_emitter(config, engine, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(
        config: FiscalConfig,
        engine: FiscalEngine,
        emitter: Arc<dyn AgentEventEmitter>,
    ) -> Self {
        ContingencyAgent {
            config: Arc::new(config),
            engine,
            status: Arc::new(RwLock::new(AgentStatus::default())),
            emitter,
            workers: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn engine(&self) -> &FiscalEngine {
        &self.engine
    }

    pub async fn status(&self) -> AgentStatus {
        self.status.read().await.clone()
    }

    /// Handle for querying and stopping the agent from elsewhere.
    pub fn handle(&self) -> ContingencyAgentHandle {
        ContingencyAgentHandle {
            workers: self.workers.clone(),
            status: self.status.clone(),
        }
    }

    /// Spawns the sweep workers. A second call while running is a no-op.
    pub async fn start(&mut self) -> SyncResult<()> {
        if !self.config.workers.enabled {
            info!("Background workers are disabled");
            return Ok(());
        }
        if !self.workers.is_empty() {
            return Ok(());
        }

        self.config.validate()?;

        let workers = &self.config.workers;
        let contingency_every = Duration::from_secs(workers.contingency_interval_secs);
        let batch_every = Duration::from_secs(workers.batch_interval_secs);
        let poll_every = self.config.poll_interval();

        info!(
            contingency_secs = contingency_every.as_secs(),
            batch_secs = batch_every.as_secs(),
            poll_secs = poll_every.as_secs(),
            "Starting contingency agent"
        );

        {
            let mut status = self.status.write().await;
            *status = AgentStatus {
                running: true,
                started_at: Some(Utc::now()),
                workers: Vec::new(),
            };
        }

        self.spawn(self.engine.contingency.clone(), contingency_every).await;
        self.spawn(self.engine.batcher.clone(), batch_every).await;
        self.spawn(self.engine.poller.clone(), poll_every).await;

        let status = self.status.read().await.clone();
        self.emitter.emit_status(&status);

        info!("Contingency agent started");
        Ok(())
    }

    async fn spawn<S: Sweep>(&mut self, sweep: S, period: Duration) {
        self.status.write().await.workers.push(WorkerStatus {
            name: sweep.name(),
            ..Default::default()
        });

        let observer = Arc::new(StatusObserver {
            status: self.status.clone(),
            emitter: self.emitter.clone(),
        });
        let (worker, handle) = SweepWorker::new(sweep, period);
        self.tasks.push(tokio::spawn(worker.with_observer(observer).run()));
        self.workers.push(handle);
    }

    /// Stops every worker and waits for in-flight sweeps to finish.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down contingency agent");

        for handle in self.workers.drain(..) {
            if let Err(e) = handle.shutdown().await {
                warn!(worker = handle.name(), ?e, "Worker was already stopped");
            }
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(?e, "Worker task ended abnormally");
            }
        }

        {
            let mut status = self.status.write().await;
            status.running = false;
        }
        let status = self.status.read().await.clone();
        self.emitter.emit_status(&status);

        info!("Contingency agent stopped");
        Ok(())
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

#[derive(Clone)]
pub struct ContingencyAgentHandle {
    workers: Vec<SweepWorkerHandle>,
    status: Arc<RwLock<AgentStatus>>,
}

impl ContingencyAgentHandle {
    pub async fn status(&self) -> AgentStatus {
        self.status.read().await.clone()
    }

    /// Signals every worker to stop. Does not wait for them.
    pub async fn shutdown(&self) {
        for handle in &self.workers {
            let _ = handle.shutdown().await;
        }
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

pub struct ContingencyAgentBuilder {
    config: FiscalConfig,
    db: Option<Arc<Database>>,
    gateway: Option<Arc<dyn AuthorityGateway>>,
    signer: Option<Arc<dyn EventSigner>>,
    emitter: Option<Arc<dyn AgentEventEmitter>>,
}

impl ContingencyAgentBuilder {
    pub fn new(config: FiscalConfig) -> Self {
        ContingencyAgentBuilder {
            config,
            db: None,
            gateway: None,
            signer: None,
            emitter: None,
        }
    }

    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn AuthorityGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn EventSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn AgentEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> SyncResult<ContingencyAgent> {
        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let gateway = self
            .gateway
            .ok_or_else(|| SyncError::InvalidConfig("Authority gateway required".into()))?;
        let signer = self.signer.unwrap_or_else(|| Arc::new(PassthroughSigner));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let engine = FiscalEngine::with_signer(db, gateway, &self.config, signer)?;
        Ok(ContingencyAgent::with_emitter(self.config, engine, emitter))
    }
}
