//! Wiring of the engine components from one [`FiscalConfig`].

use std::sync::Arc;

use fiscal_db::Database;

use crate::batcher::LoteBatcher;
use crate::config::{AuthorityMode, FiscalConfig};
use crate::contingency::{ContingencyManager, EventSigner, PassthroughSigner};
use crate::error::SyncResult;
use crate::gateway::AuthorityGateway;
use crate::http_gateway::HttpAuthorityGateway;
use crate::pipeline::SubmissionPipeline;
use crate::poller::LotePoller;
use crate::reconcile::ReconciliationEngine;
use crate::simulated::SimulatedAuthority;

/// Every component sharing one database and one gateway.
#[derive(Clone)]
pub struct FiscalEngine {
    pub pipeline: SubmissionPipeline,
    pub contingency: ContingencyManager,
    pub batcher: LoteBatcher,
    pub poller: LotePoller,
    pub reconciler: ReconciliationEngine,
}

impl FiscalEngine {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn AuthorityGateway>,
        config: &FiscalConfig,
    ) -> SyncResult<Self> {
        Self::with_signer(db, gateway, config, Arc::new(PassthroughSigner))
    }

    pub fn with_signer(
        db: Arc<Database>,
        gateway: Arc<dyn AuthorityGateway>,
        config: &FiscalConfig,
        signer: Arc<dyn EventSigner>,
    ) -> SyncResult<Self> {
        let policy = config.retry_policy();
        let claim_ttl = config.contingency.claim_ttl();

        let contingency = ContingencyManager::new(
            db.clone(),
            gateway.clone(),
            policy,
            config.contingency.clone(),
            config.authority.issuer_nit.clone(),
        )
        .with_signer(signer);

        let pipeline = SubmissionPipeline::new(db.clone(), gateway.clone(), contingency.clone(), policy);

        let batcher = LoteBatcher::new(
            db.clone(),
            gateway.clone(),
            policy,
            config.batching.max_batch_size,
            claim_ttl,
        )?
        .with_pending_limit(config.batching.pending_limit);

        let poller = LotePoller::new(
            db.clone(),
            gateway.clone(),
            &config.polling,
            policy.attempt_timeout,
            claim_ttl,
        );

        let reconciler = ReconciliationEngine::new(
            db,
            gateway,
            config.timestamp_tolerance(),
            config.reconciliation.concurrency,
            policy.attempt_timeout,
        );

        Ok(FiscalEngine {
            pipeline,
            contingency,
            batcher,
            poller,
            reconciler,
        })
    }
}

/// Builds the gateway named by `[authority] mode`.
pub fn build_gateway(config: &FiscalConfig) -> SyncResult<Arc<dyn AuthorityGateway>> {
    Ok(match config.authority.mode {
        AuthorityMode::Http => Arc::new(HttpAuthorityGateway::new(&config.authority)?),
        AuthorityMode::Simulated => Arc::new(SimulatedAuthority::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiscal_db::DbConfig;

    #[tokio::test]
    async fn test_wires_from_default_config() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let mut config = FiscalConfig::default();
        config.authority.mode = AuthorityMode::Simulated;

        let gateway = build_gateway(&config).unwrap();
        assert!(FiscalEngine::new(db, gateway, &config).is_ok());
    }

    #[tokio::test]
    async fn test_refuses_oversized_batches() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let mut config = FiscalConfig::default();
        config.batching.max_batch_size = 101;

        let gateway: Arc<dyn AuthorityGateway> = Arc::new(SimulatedAuthority::new());
        assert!(FiscalEngine::new(db, gateway, &config).is_err());
    }
}
