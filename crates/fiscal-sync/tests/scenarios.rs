//! End-to-end contingency scenarios against the simulated authority.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use fiscal_core::{
    Classification, ContingencyType, DateRange, DocumentKind, DocumentStatus, Environment,
    LoteStatus, NewDocument, PeriodStatus, Scope,
};
use fiscal_db::{Database, DbConfig, LoteFilter, PeriodFilter};
use fiscal_sync::poller::DocumentOutcome;
use fiscal_sync::{
    AuthorityError, AuthorityMode, FiscalConfig, FiscalEngine, PollOutcome, ReconcileOptions,
    SimulatedAuthority, SubmissionOutcome, Sweep,
};

struct Harness {
    db: Arc<Database>,
    authority: Arc<SimulatedAuthority>,
    engine: FiscalEngine,
}

fn config() -> FiscalConfig {
    let mut config = FiscalConfig::default();
    config.authority.mode = AuthorityMode::Simulated;
    config.authority.issuer_nit = "06140101001010".into();
    config.authority.timeout_secs = 5;
    config.retry.max_attempts = 3;
    config.retry.initial_interval_ms = 0;
    config.retry.max_interval_ms = 0;
    config
}

impl Harness {
    async fn new() -> Self {
        Self::with_db(Database::new(DbConfig::in_memory()).await.unwrap()).await
    }

    async fn with_db(db: Database) -> Self {
        let db = Arc::new(db);
        let authority = Arc::new(SimulatedAuthority::new());
        let engine = FiscalEngine::new(db.clone(), authority.clone(), &config()).unwrap();
        Harness { db, authority, engine }
    }

    async fn finalize(&self, n: u32) -> SubmissionOutcome {
        self.engine.pipeline.finalize(document(n)).await.unwrap()
    }

    /// Finalizes documents `range` while the authority is unreachable and
    /// returns their ids.
    async fn finalize_during_outage(&self, range: std::ops::RangeInclusive<u32>) -> Vec<String> {
        self.authority
            .outage(AuthorityError::Timeout(Duration::from_secs(8)));
        let mut ids = Vec::new();
        for n in range {
            let outcome = self.finalize(n).await;
            assert!(outcome.is_contingency());
            ids.push(outcome.document().id.clone());
        }
        self.authority.restore();
        ids
    }

    async fn active_period_id(&self) -> String {
        let active = self
            .db
            .periods()
            .list(&PeriodFilter {
                status: Some(PeriodStatus::Active),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        active[0].id.clone()
    }
}

fn scope() -> Scope {
    Scope::new("company-1", "M001", "P001", Environment::Test)
}

fn document(n: u32) -> NewDocument {
    NewDocument {
        generation_code: None,
        control_number: format!("DTE-01-M001P001-{:015}", n),
        kind: DocumentKind::Invoice,
        scope: scope(),
        issued_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        signed_payload: format!("signed-{}", n),
    }
}

#[tokio::test]
async fn contingency_round_trip_ends_like_a_direct_submission() {
    let h = Harness::new().await;

    let direct = h.finalize(1).await;
    let direct = match direct {
        SubmissionOutcome::Accepted(doc) => doc,
        other => panic!("expected direct acceptance, got {:?}", other),
    };

    let ids = h.finalize_during_outage(2..=2).await;
    let period_id = h.active_period_id().await;

    let closed = h.engine.contingency.close_period(&period_id).await.unwrap();
    assert_eq!(closed.period.status, PeriodStatus::Closed);

    let lotes = h.engine.batcher.build(&period_id).await.unwrap();
    assert_eq!(lotes.len(), 1);
    let result = h.engine.poller.poll_lote(&lotes[0].lote_id).await.unwrap();
    assert_eq!(result.lote.status, LoteStatus::Completed);

    let late = h.db.documents().get_by_id(&ids[0]).await.unwrap().unwrap();
    assert_eq!(late.status, direct.status);
    assert_eq!(late.authority.state, direct.authority.state);
    assert!(late.authority.received_seal.is_some());
    assert_eq!(late.contingency_period_id.as_deref(), Some(period_id.as_str()));
}

#[tokio::test]
async fn reachable_authority_closes_the_period_without_an_operator() {
    let h = Harness::new().await;
    let ids = h.finalize_during_outage(1..=2).await;
    let period_id = h.active_period_id().await;

    h.engine.contingency.sweep().await.unwrap();
    let period = h.db.periods().get_by_id(&period_id).await.unwrap().unwrap();
    assert_eq!(period.status, PeriodStatus::Closed);

    h.engine.batcher.sweep().await.unwrap();
    h.engine.poller.poll_once().await.unwrap();
    for id in &ids {
        let doc = h.db.documents().get_by_id(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Accepted);
    }
}

#[tokio::test]
async fn constant_timeout_opens_exactly_one_period() {
    let h = Harness::new().await;
    let ids = h.finalize_during_outage(1..=3).await;
    let period_id = h.active_period_id().await;

    for id in &ids {
        let doc = h.db.documents().get_by_id(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::ContingencyPending);
        assert_eq!(doc.contingency_period_id.as_deref(), Some(period_id.as_str()));
    }

    let period = h.db.periods().get_by_id(&period_id).await.unwrap().unwrap();
    assert_eq!(period.contingency_type, ContingencyType::AuthorityUnavailable);
}

#[tokio::test]
async fn one_hundred_fifty_documents_make_two_lotes() {
    let h = Harness::new().await;
    let ids = h.finalize_during_outage(1..=150).await;
    let period_id = h.active_period_id().await;

    h.engine.contingency.close_period(&period_id).await.unwrap();
    let reports = h.engine.batcher.build(&period_id).await.unwrap();
    let mut counts: Vec<i64> = reports.iter().map(|r| r.document_count).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![50, 100]);

    let mut seen = HashSet::new();
    for report in &reports {
        let lote = h.db.lotes().get_by_id(&report.lote_id).await.unwrap().unwrap();
        for doc in h.db.documents().list_for_lote(&report.lote_id).await.unwrap() {
            assert_eq!(doc.scope, lote.scope);
            assert!(seen.insert(doc.id));
        }
    }
    assert_eq!(seen, ids.into_iter().collect::<HashSet<_>>());
}

#[tokio::test]
async fn unknown_batch_code_releases_documents() {
    let h = Harness::new().await;
    let ids = h.finalize_during_outage(1..=2).await;
    let period_id = h.active_period_id().await;
    h.engine.contingency.close_period(&period_id).await.unwrap();
    let reports = h.engine.batcher.build(&period_id).await.unwrap();
    let lote = h.db.lotes().get_by_id(&reports[0].lote_id).await.unwrap().unwrap();

    h.authority.forget_batch(lote.batch_code.as_deref().unwrap());
    let result = h.engine.poller.poll_lote(&lote.id).await.unwrap();
    assert!(matches!(result.outcome, PollOutcome::Unknown { released: 2 }));
    assert_eq!(result.lote.status, LoteStatus::Failed);

    for id in &ids {
        let doc = h.db.documents().get_by_id(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::ContingencyPending);
        assert!(doc.lote_id.is_none());
    }

    // The next batching sweep picks them up again.
    let sweep = h.engine.batcher.sweep().await.unwrap();
    assert_eq!(sweep.built, 1);
    let lotes = h
        .db
        .lotes()
        .list(&LoteFilter {
            period_id: Some(period_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(lotes.len(), 2);
}

#[tokio::test]
async fn polling_a_completed_lote_twice_is_stable() {
    let h = Harness::new().await;
    h.finalize_during_outage(1..=3).await;
    let period_id = h.active_period_id().await;
    h.engine.contingency.close_period(&period_id).await.unwrap();
    let reports = h.engine.batcher.build(&period_id).await.unwrap();

    let first = h.engine.poller.poll_lote(&reports[0].lote_id).await.unwrap();
    let second = h.engine.poller.poll_lote(&reports[0].lote_id).await.unwrap();

    assert!(matches!(first.outcome, PollOutcome::Completed { applied: 3 }));
    assert_eq!(second.outcome, PollOutcome::AlreadyCompleted);

    assert_eq!(by_code(first.documents), by_code(second.documents));
}

fn by_code(mut documents: Vec<DocumentOutcome>) -> Vec<DocumentOutcome> {
    documents.sort_by(|a, b| a.generation_code.cmp(&b.generation_code));
    documents
}

#[tokio::test]
async fn accepted_document_unknown_remotely_is_flagged() {
    let h = Harness::new().await;
    let accepted = h.finalize(1).await.document().clone();
    assert_eq!(accepted.status, DocumentStatus::Accepted);
    h.authority.remove_record(&accepted.generation_code);

    let report = h
        .engine
        .reconciler
        .reconcile(
            &scope(),
            &DateRange::new(
                NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            ),
            ReconcileOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.summary.missing_remotely, 1);
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].classification, Classification::MissingRemotely);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignment_shares_one_period() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(DbConfig::new(dir.path().join("fiscal.db")).max_connections(8))
        .await
        .unwrap();
    let h = Arc::new(Harness::with_db(db).await);
    h.authority
        .outage(AuthorityError::Connection("connection refused".into()));

    let mut tasks = Vec::new();
    for n in 1..=12 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move { h.finalize(n).await }));
    }

    let mut periods = HashSet::new();
    for task in tasks {
        let outcome = task.await.unwrap();
        assert!(outcome.is_contingency());
        periods.insert(outcome.document().contingency_period_id.clone().unwrap());
    }

    assert_eq!(periods.len(), 1);
    let active = h.active_period_id().await;
    assert!(periods.contains(&active));
}
