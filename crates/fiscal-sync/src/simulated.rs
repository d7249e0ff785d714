//! # Simulated Authority
//!
//! An in-memory [`AuthorityGateway`] with scriptable failures. Used by the
//! engine's tests and by the daemon when `authority.mode = "simulated"`.
//!
//! ## Scripting
//! ```text
//! outage(err)              every call fails with `err` until restored
//! fail_next(op, [errs])    the next calls to `op` fail in order
//! reject(code)             the document is RECHAZADO on direct or batch
//! batch_polls(n)           a batch answers "processing" n times first
//! partial_results(n)       first result poll covers only n documents
//! enable_listing()         `list_documents` returns every known record
//! latency(d)               every call sleeps `d` first
//! ```
//!
//! Accepted documents are remembered, so later status queries and
//! reconciliation see them like the real authority would.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::gateway::{
    AuthorityError, AuthorityGateway, AuthorityResult, BatchReceipt, BatchState, BatchStatusReport,
    BatchSubmission, ContingencyEventSubmission, Credential, DocumentQuery, DocumentSubmission,
    EventReceipt,
};
use fiscal_core::reconcile::AUTHORITY_TIMESTAMP_FORMAT;
use fiscal_core::{
    AuthorityFields, AuthorityVerdict, DateRange, RemoteDocumentStatus, Scope, STATE_PROCESSED,
    STATE_RECEIVED, STATE_REJECTED,
};

/// Gateway operations, for scripting and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Authenticate,
    SubmitDocument,
    SubmitBatch,
    QueryBatchStatus,
    QueryDocumentStatus,
    SubmitContingencyEvent,
    ListDocuments,
}

#[derive(Debug)]
struct SimulatedBatch {
    documents: Vec<String>,
    polls_left: u32,
    partial: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    outage: Option<AuthorityError>,
    scripted: HashMap<Operation, VecDeque<AuthorityError>>,
    calls: HashMap<Operation, usize>,
    rejected_codes: HashSet<String>,
    records: HashMap<String, RemoteDocumentStatus>,
    batches: HashMap<String, SimulatedBatch>,
    events: Vec<ContingencyEventSubmission>,
    batch_polls: u32,
    partial_results: Option<usize>,
    listing: bool,
    latency: Duration,
    seals: u64,
}

/// In-memory tax authority.
#[derive(Debug, Default)]
pub struct SimulatedAuthority {
    state: Mutex<State>,
}

impl SimulatedAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Every call fails with `error` until [`restore`](Self::restore).
    pub fn outage(&self, error: AuthorityError) {
        self.state().outage = Some(error);
    }

    pub fn restore(&self) {
        self.state().outage = None;
    }

    /// The next calls to `operation` fail with `errors`, in order.
    pub fn fail_next(&self, operation: Operation, errors: impl IntoIterator<Item = AuthorityError>) {
        self.state().scripted.entry(operation).or_default().extend(errors);
    }

    pub fn reject(&self, generation_code: &str) {
        self.state().rejected_codes.insert(generation_code.to_uppercase());
    }

    /// New batches answer "processing" this many times before results.
    pub fn batch_polls(&self, polls: u32) {
        self.state().batch_polls = polls;
    }

    /// The first result poll of each new batch covers only `count` documents.
    pub fn partial_results(&self, count: usize) {
        self.state().partial_results = Some(count);
    }

    pub fn enable_listing(&self) {
        self.state().listing = true;
    }

    pub fn latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Forgets a batch code, as if the authority lost it.
    pub fn forget_batch(&self, batch_code: &str) {
        self.state().batches.remove(batch_code);
    }

    /// Plants or overwrites the authority's record of a document.
    pub fn insert_record(&self, record: RemoteDocumentStatus) {
        self.state()
            .records
            .insert(record.generation_code.to_uppercase(), record);
    }

    pub fn remove_record(&self, generation_code: &str) {
        self.state().records.remove(&generation_code.to_uppercase());
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn calls(&self, operation: Operation) -> usize {
        self.state().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn record(&self, generation_code: &str) -> Option<RemoteDocumentStatus> {
        self.state().records.get(&generation_code.to_uppercase()).cloned()
    }

    pub fn batch_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.state().batches.keys().cloned().collect();
        codes.sort();
        codes
    }

    pub fn batch_documents(&self, batch_code: &str) -> Vec<String> {
        self.state()
            .batches
            .get(batch_code)
            .map(|b| b.documents.clone())
            .unwrap_or_default()
    }

    pub fn received_events(&self) -> Vec<ContingencyEventSubmission> {
        self.state().events.clone()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Counts the call, applies latency, then any outage or scripted failure.
    async fn enter(&self, operation: Operation) -> AuthorityResult<()> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(operation).or_default() += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(err) = state.outage.clone() {
            return Err(err);
        }
        if let Some(err) = state.scripted.get_mut(&operation).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }

    fn verdict_for(state: &mut State, generation_code: &str) -> AuthorityVerdict {
        let code = generation_code.to_uppercase();
        let now = Utc::now();

        if state.rejected_codes.contains(&code) {
            let fields = AuthorityFields {
                state: Some(STATE_REJECTED.to_string()),
                received_seal: None,
                processed_at: Some(now),
                message_code: Some("004".to_string()),
                message_description: Some("Documento rechazado".to_string()),
                observations: vec!["rejected by simulated authority".to_string()],
            };
            Self::remember(state, &code, &fields);
            return AuthorityVerdict::from_state(code, fields);
        }

        // Already accepted earlier: answer with the same seal.
        if let Some(existing) = state.records.get(&code) {
            if existing.state == STATE_PROCESSED {
                let fields = AuthorityFields {
                    state: Some(STATE_PROCESSED.to_string()),
                    received_seal: existing.received_seal.clone(),
                    processed_at: existing
                        .processed_at
                        .as_deref()
                        .and_then(fiscal_core::reconcile::parse_authority_timestamp),
                    message_code: Some("001".to_string()),
                    message_description: Some("RECIBIDO".to_string()),
                    observations: Vec::new(),
                };
                return AuthorityVerdict::from_state(code, fields);
            }
        }

        state.seals += 1;
        let fields = AuthorityFields {
            state: Some(STATE_PROCESSED.to_string()),
            received_seal: Some(format!("{}SIM{:08}", now.format("%Y"), state.seals)),
            // Second precision, like the authority's own timestamps.
            processed_at: fiscal_core::reconcile::parse_authority_timestamp(
                &now.format(AUTHORITY_TIMESTAMP_FORMAT).to_string(),
            ),
            message_code: Some("001".to_string()),
            message_description: Some("RECIBIDO".to_string()),
            observations: Vec::new(),
        };
        Self::remember(state, &code, &fields);
        AuthorityVerdict::from_state(code, fields)
    }

    fn remember(state: &mut State, code: &str, fields: &AuthorityFields) {
        let issued_on = state.records.get(code).and_then(|r| r.issued_on.clone());
        state.records.insert(
            code.to_string(),
            RemoteDocumentStatus {
                generation_code: code.to_string(),
                state: fields.state.clone().unwrap_or_default(),
                received_seal: fields.received_seal.clone(),
                processed_at: fields
                    .processed_at
                    .map(|t| t.format(AUTHORITY_TIMESTAMP_FORMAT).to_string()),
                issued_on,
                message_code: fields.message_code.clone(),
                message_description: fields.message_description.clone(),
                observations: fields.observations.clone(),
            },
        );
    }
}

#[async_trait]
impl AuthorityGateway for SimulatedAuthority {
    async fn authenticate(&self) -> AuthorityResult<Credential> {
        self.enter(Operation::Authenticate).await?;
        Ok(Credential {
            token: "simulated-token".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(12),
        })
    }

    async fn submit_document(&self, document: &DocumentSubmission) -> AuthorityResult<AuthorityVerdict> {
        self.enter(Operation::SubmitDocument).await?;
        let mut state = self.state();
        Ok(Self::verdict_for(&mut state, &document.generation_code))
    }

    async fn submit_batch(&self, batch: &BatchSubmission) -> AuthorityResult<BatchReceipt> {
        self.enter(Operation::SubmitBatch).await?;
        if batch.documents.is_empty() {
            return Err(AuthorityError::rejected("EMPTY_BATCH", "batch has no documents"));
        }

        let mut state = self.state();
        let batch_code = uuid::Uuid::new_v4().to_string().to_uppercase();
        let simulated = SimulatedBatch {
            documents: batch
                .documents
                .iter()
                .map(|d| d.generation_code.to_uppercase())
                .collect(),
            polls_left: state.batch_polls,
            partial: state.partial_results,
        };
        state.batches.insert(batch_code.clone(), simulated);

        Ok(BatchReceipt {
            raw_response: Some(format!(r#"{{"estado":"{}","codigoLote":"{}"}}"#, STATE_RECEIVED, batch_code)),
            batch_code,
        })
    }

    async fn query_batch_status(&self, batch_code: &str) -> AuthorityResult<BatchStatusReport> {
        self.enter(Operation::QueryBatchStatus).await?;
        let mut state = self.state();

        let (documents, partial) = match state.batches.get_mut(batch_code) {
            None => return Ok(BatchStatusReport::new(BatchState::Unknown)),
            Some(batch) if batch.polls_left > 0 => {
                batch.polls_left -= 1;
                return Ok(BatchStatusReport::new(BatchState::Processing));
            }
            Some(batch) => (batch.documents.clone(), batch.partial.take()),
        };

        let covered = partial.unwrap_or(documents.len()).min(documents.len());
        let verdicts = documents[..covered]
            .iter()
            .map(|code| Self::verdict_for(&mut state, code))
            .collect();
        Ok(BatchStatusReport::new(BatchState::Results(verdicts)))
    }

    async fn query_document_status(&self, query: &DocumentQuery) -> AuthorityResult<Option<RemoteDocumentStatus>> {
        self.enter(Operation::QueryDocumentStatus).await?;
        Ok(self.record(&query.generation_code))
    }

    async fn submit_contingency_event(&self, event: &ContingencyEventSubmission) -> AuthorityResult<EventReceipt> {
        self.enter(Operation::SubmitContingencyEvent).await?;
        let mut state = self.state();
        state.events.push(event.clone());
        state.seals += 1;
        Ok(EventReceipt {
            state: STATE_RECEIVED.to_string(),
            received_seal: Some(format!("{}SIMEVT{:06}", Utc::now().format("%Y"), state.seals)),
            message: Some("Evento de contingencia recibido".to_string()),
            observations: Vec::new(),
            raw_response: Some(format!(r#"{{"estado":"{}"}}"#, STATE_RECEIVED)),
        })
    }

    async fn list_documents(
        &self,
        _scope: &Scope,
        _range: &DateRange,
    ) -> AuthorityResult<Option<Vec<RemoteDocumentStatus>>> {
        self.enter(Operation::ListDocuments).await?;
        let state = self.state();
        if !state.listing {
            return Ok(None);
        }
        let mut records: Vec<RemoteDocumentStatus> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.generation_code.cmp(&b.generation_code));
        Ok(Some(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiscal_core::{DocumentKind, Environment};

    fn submission(code: &str) -> DocumentSubmission {
        DocumentSubmission {
            generation_code: code.to_string(),
            kind: DocumentKind::Invoice,
            environment: Environment::Test,
            signed_payload: format!("signed.{}", code),
        }
    }

    fn batch(codes: &[&str]) -> BatchSubmission {
        BatchSubmission {
            lote_id: "lote-1".to_string(),
            scope: Scope::new("c", "M001", "P001", Environment::Test),
            documents: codes.iter().map(|c| submission(c)).collect(),
        }
    }

    #[tokio::test]
    async fn test_accepts_and_remembers() {
        let authority = SimulatedAuthority::new();
        let verdict = authority.submit_document(&submission("abc")).await.unwrap();
        assert!(verdict.accepted);
        assert_eq!(verdict.generation_code, "ABC");

        let again = authority.submit_document(&submission("ABC")).await.unwrap();
        assert_eq!(again.fields.received_seal, verdict.fields.received_seal);

        let record = authority.record("abc").unwrap();
        assert_eq!(record.state, STATE_PROCESSED);
        assert_eq!(authority.calls(Operation::SubmitDocument), 2);
    }

    #[tokio::test]
    async fn test_outage_and_scripted_failures() {
        let authority = SimulatedAuthority::new();
        authority.outage(AuthorityError::Connection("refused".into()));
        assert!(authority.submit_document(&submission("a")).await.is_err());
        authority.restore();

        authority.fail_next(Operation::SubmitDocument, [AuthorityError::RateLimited]);
        assert_eq!(
            authority.submit_document(&submission("a")).await.unwrap_err(),
            AuthorityError::RateLimited
        );
        assert!(authority.submit_document(&submission("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_batch_lifecycle() {
        let authority = SimulatedAuthority::new();
        authority.batch_polls(1);
        authority.partial_results(1);
        authority.reject("b");

        let receipt = authority.submit_batch(&batch(&["a", "b"])).await.unwrap();
        let code = receipt.batch_code;

        assert_eq!(authority.query_batch_status(&code).await.unwrap().state, BatchState::Processing);

        match authority.query_batch_status(&code).await.unwrap().state {
            BatchState::Results(verdicts) => {
                assert_eq!(verdicts.len(), 1);
                assert!(verdicts[0].accepted);
            }
            other => panic!("unexpected {:?}", other),
        }

        match authority.query_batch_status(&code).await.unwrap().state {
            BatchState::Results(verdicts) => {
                assert_eq!(verdicts.len(), 2);
                assert!(!verdicts[1].accepted);
            }
            other => panic!("unexpected {:?}", other),
        }

        authority.forget_batch(&code);
        assert_eq!(authority.query_batch_status(&code).await.unwrap().state, BatchState::Unknown);
    }

    #[tokio::test]
    async fn test_listing_is_optional() {
        let authority = SimulatedAuthority::new();
        let scope = Scope::new("c", "M001", "P001", Environment::Test);
        let today = Utc::now().date_naive();
        let range = DateRange::new(today, today);

        assert!(authority.list_documents(&scope, &range).await.unwrap().is_none());
        authority.enable_listing();
        authority.submit_document(&submission("x")).await.unwrap();
        let listed = authority.list_documents(&scope, &range).await.unwrap().unwrap();
        assert_eq!(listed.len(), 1);
    }
}
