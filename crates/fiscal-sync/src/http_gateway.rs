//! # HTTP Authority Gateway
//!
//! [`AuthorityGateway`] over the authority's JSON REST API.
//!
//! ## Endpoints
//! ```text
//! POST {auth_url}                                   form user/pwd → token
//! POST {base}/fesv/recepciondte                     single document
//! POST {base}/fesv/recepcionlote                    batch
//! GET  {base}/fesv/recepcion/consultadtelote/{code} batch status
//! POST {consult_url}                                document status
//! POST {base}/fesv/contingencia                     contingency notification
//! ```
//!
//! The token goes in `Authorization` as-is, without a `Bearer` prefix.
//! A 401 drops the cached token so the next call authenticates again.
//!
//! This client never retries; callers own the retry budget.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{TokenCache, TOKEN_TTL};
use crate::config::AuthoritySettings;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{
    AuthorityError, AuthorityGateway, AuthorityResult, BatchReceipt, BatchState, BatchStatusReport,
    BatchSubmission, ContingencyEventSubmission, Credential, DocumentQuery, DocumentSubmission,
    EventReceipt,
};
use fiscal_core::reconcile::parse_authority_timestamp;
use fiscal_core::{AuthorityFields, AuthorityVerdict, RemoteDocumentStatus, STATE_PROCESSED, STATE_REJECTED};

const USER_AGENT: &str = concat!("fiscal-core/", env!("CARGO_PKG_VERSION"));
const BATCH_VERSION: u32 = 1;

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    status: Option<String>,
    body: Option<AuthBody>,
}

#[derive(Debug, Deserialize)]
struct AuthBody {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceptionRequest<'a> {
    ambiente: &'a str,
    id_envio: i64,
    version: u32,
    tipo_dte: &'a str,
    documento: &'a str,
    codigo_generacion: &'a str,
}

/// Per-document answer; shared by reception, batch results and status query.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResult {
    #[serde(default)]
    estado: Option<String>,
    #[serde(default)]
    codigo_generacion: Option<String>,
    #[serde(default)]
    sello_recibido: Option<String>,
    #[serde(default)]
    fh_procesamiento: Option<String>,
    #[serde(default)]
    fecha_emision: Option<String>,
    #[serde(default)]
    codigo_msg: Option<String>,
    #[serde(default)]
    descripcion_msg: Option<String>,
    #[serde(default)]
    observaciones: Option<Vec<String>>,
}

impl DocumentResult {
    fn fields(&self, default_state: Option<&str>) -> AuthorityFields {
        AuthorityFields {
            state: non_empty(&self.estado).or_else(|| default_state.map(str::to_string)),
            received_seal: non_empty(&self.sello_recibido),
            processed_at: self
                .fh_procesamiento
                .as_deref()
                .and_then(parse_authority_timestamp),
            message_code: non_empty(&self.codigo_msg),
            message_description: non_empty(&self.descripcion_msg),
            observations: self.observaciones.clone().unwrap_or_default(),
        }
    }

    fn into_verdict(self, fallback_code: &str, default_state: Option<&str>) -> AuthorityVerdict {
        let fields = self.fields(default_state);
        let code = non_empty(&self.codigo_generacion).unwrap_or_else(|| fallback_code.to_string());
        AuthorityVerdict::from_state(code.to_uppercase(), fields)
    }

    fn into_remote(self, fallback_code: &str) -> RemoteDocumentStatus {
        RemoteDocumentStatus {
            generation_code: non_empty(&self.codigo_generacion)
                .unwrap_or_else(|| fallback_code.to_string())
                .to_uppercase(),
            state: self.estado.unwrap_or_default(),
            received_seal: non_empty(&self.sello_recibido),
            processed_at: non_empty(&self.fh_procesamiento),
            issued_on: non_empty(&self.fecha_emision),
            message_code: non_empty(&self.codigo_msg),
            message_description: non_empty(&self.descripcion_msg),
            observations: self.observaciones.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest<'a> {
    ambiente: &'a str,
    id_envio: String,
    version: u32,
    nit_emisor: &'a str,
    documentos: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchResponse {
    #[serde(default)]
    estado: Option<String>,
    #[serde(default)]
    codigo_lote: Option<String>,
    #[serde(default)]
    descripcion_msg: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchStatusResponse {
    #[serde(default)]
    procesados: Option<Vec<DocumentResult>>,
    #[serde(default)]
    rechazados: Option<Vec<DocumentResult>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsultRequest<'a> {
    nit_emisor: &'a str,
    tdte: &'a str,
    codigo_generacion: &'a str,
}

#[derive(Debug, Serialize)]
struct ContingencyRequest<'a> {
    nit: &'a str,
    documento: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContingencyResponse {
    #[serde(default)]
    estado: Option<String>,
    #[serde(default)]
    sello_recibido: Option<String>,
    #[serde(default)]
    mensaje: Option<String>,
    #[serde(default)]
    observaciones: Option<Vec<String>>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// =============================================================================
// Gateway
// =============================================================================

/// REST client for the tax authority.
pub struct HttpAuthorityGateway {
    client: reqwest::Client,
    base_url: String,
    auth_url: String,
    consult_url: String,
    issuer_nit: String,
    password: Option<String>,
    timeout: Duration,
    tokens: TokenCache,
    next_send_id: AtomicI64,
}

impl HttpAuthorityGateway {
    pub fn new(settings: &AuthoritySettings) -> SyncResult<Self> {
        let timeout = settings.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            auth_url: settings.auth_url.clone(),
            consult_url: settings.consult_url.clone(),
            issuer_nit: settings.issuer_nit.clone(),
            password: settings.password.clone(),
            timeout,
            tokens: TokenCache::new(),
            next_send_id: AtomicI64::new(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn token(&self) -> AuthorityResult<String> {
        self.tokens.token(|| self.authenticate()).await
    }

    fn transport_error(&self, err: reqwest::Error) -> AuthorityError {
        if err.is_timeout() {
            AuthorityError::Timeout(self.timeout)
        } else if err.is_decode() || err.is_body() {
            AuthorityError::Malformed(err.to_string())
        } else {
            AuthorityError::Connection(err.to_string())
        }
    }

    /// Sends the request and returns status plus body text.
    async fn send(&self, request: reqwest::RequestBuilder) -> AuthorityResult<(StatusCode, String)> {
        let resp = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.transport_error(e))?;
        Ok((status, body))
    }

    /// Sends with the cached token. A 401 invalidates it.
    async fn send_authorized(&self, request: reqwest::RequestBuilder) -> AuthorityResult<(StatusCode, String)> {
        let token = self.token().await?;
        let (status, body) = self
            .send(request.header(reqwest::header::AUTHORIZATION, token))
            .await?;
        if status == StatusCode::UNAUTHORIZED {
            warn!("Authority refused the cached token");
            self.tokens.invalidate().await;
        }
        Ok((status, body))
    }

    fn parse<T: for<'de> Deserialize<'de>>(body: &str) -> AuthorityResult<T> {
        serde_json::from_str(body).map_err(|e| AuthorityError::Malformed(e.to_string()))
    }
}

/// Maps a non-success HTTP status onto the failure taxonomy.
fn status_error(status: StatusCode, body: String) -> AuthorityError {
    match status.as_u16() {
        401 | 403 => AuthorityError::Auth(format!("HTTP {}: {}", status.as_u16(), body)),
        429 => AuthorityError::RateLimited,
        503 => AuthorityError::Unavailable(body),
        500..=599 => AuthorityError::Server {
            status: status.as_u16(),
            body,
        },
        code => AuthorityError::Rejected {
            code: format!("HTTP_{}", code),
            message: body.clone(),
            raw_response: Some(body),
        },
    }
}

#[async_trait]
impl AuthorityGateway for HttpAuthorityGateway {
    async fn authenticate(&self) -> AuthorityResult<Credential> {
        let password = self
            .password
            .as_deref()
            .ok_or_else(|| AuthorityError::Auth("FISCAL_AUTHORITY_PASSWORD is not set".to_string()))?;

        debug!(url = %self.auth_url, "Authenticating with authority");
        let request = self
            .client
            .post(&self.auth_url)
            .form(&[("user", self.issuer_nit.as_str()), ("pwd", password)]);
        let (status, body) = self.send(request).await?;
        if !status.is_success() {
            return Err(match status_error(status, body) {
                AuthorityError::Rejected { message, .. } => AuthorityError::Auth(message),
                other => other,
            });
        }

        let parsed: AuthResponse = Self::parse(&body)?;
        let token = parsed
            .body
            .and_then(|b| b.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AuthorityError::Auth(format!(
                    "no token in auth response (status {})",
                    parsed.status.unwrap_or_default()
                ))
            })?;

        let ttl = chrono::Duration::from_std(TOKEN_TTL).unwrap_or_else(|_| chrono::Duration::hours(12));
        Ok(Credential {
            token,
            expires_at: Utc::now() + ttl,
        })
    }

    async fn submit_document(&self, document: &DocumentSubmission) -> AuthorityResult<AuthorityVerdict> {
        let payload = ReceptionRequest {
            ambiente: document.environment.code(),
            id_envio: self.next_send_id.fetch_add(1, Ordering::Relaxed),
            version: document.kind.wire_version(),
            tipo_dte: document.kind.code(),
            documento: &document.signed_payload,
            codigo_generacion: &document.generation_code,
        };

        debug!(generation_code = %document.generation_code, "Submitting document to authority");
        let request = self.client.post(self.url("/fesv/recepciondte")).json(&payload);
        let (status, body) = self.send_authorized(request).await?;

        if !status.is_success() {
            // A refused document comes back as 400 with a RECHAZADO body.
            if status == StatusCode::BAD_REQUEST {
                if let Ok(result) = Self::parse::<DocumentResult>(&body) {
                    if result.estado.as_deref() == Some(STATE_REJECTED) {
                        return Ok(result.into_verdict(&document.generation_code, None));
                    }
                }
            }
            return Err(status_error(status, body));
        }

        let result: DocumentResult = Self::parse(&body)?;
        let decided = matches!(result.estado.as_deref(), Some(STATE_PROCESSED) | Some(STATE_REJECTED));
        if !decided {
            return Err(AuthorityError::Malformed(format!(
                "unexpected reception state {:?}",
                result.estado
            )));
        }
        Ok(result.into_verdict(&document.generation_code, None))
    }

    async fn submit_batch(&self, batch: &BatchSubmission) -> AuthorityResult<BatchReceipt> {
        let payload = BatchRequest {
            ambiente: batch.scope.environment.code(),
            id_envio: uuid::Uuid::new_v4().to_string().to_uppercase(),
            version: BATCH_VERSION,
            nit_emisor: &self.issuer_nit,
            documentos: batch.documents.iter().map(|d| d.signed_payload.as_str()).collect(),
        };

        info!(lote_id = %batch.lote_id, documents = batch.documents.len(), "Submitting batch to authority");
        let request = self.client.post(self.url("/fesv/recepcionlote")).json(&payload);
        let (status, body) = self.send_authorized(request).await?;
        if !status.is_success() {
            return Err(status_error(status, body));
        }

        let parsed: BatchResponse = Self::parse(&body)?;
        if parsed.estado.as_deref() == Some(STATE_REJECTED) {
            return Err(AuthorityError::Rejected {
                code: STATE_REJECTED.to_string(),
                message: parsed.descripcion_msg.unwrap_or_default(),
                raw_response: Some(body),
            });
        }
        let batch_code = non_empty(&parsed.codigo_lote)
            .ok_or_else(|| AuthorityError::Malformed("batch response without codigoLote".to_string()))?;

        Ok(BatchReceipt {
            batch_code,
            raw_response: Some(body),
        })
    }

    async fn query_batch_status(&self, batch_code: &str) -> AuthorityResult<BatchStatusReport> {
        let url = self.url(&format!("/fesv/recepcion/consultadtelote/{}", batch_code));
        let (status, body) = self.send_authorized(self.client.get(url)).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(BatchStatusReport {
                state: BatchState::Unknown,
                raw_response: Some(body),
            });
        }
        if !status.is_success() {
            return Err(status_error(status, body));
        }

        let parsed: BatchStatusResponse = Self::parse(&body)?;
        let processed = parsed.procesados.unwrap_or_default();
        let rejected = parsed.rechazados.unwrap_or_default();
        if processed.is_empty() && rejected.is_empty() {
            return Ok(BatchStatusReport {
                state: BatchState::Processing,
                raw_response: Some(body),
            });
        }

        let mut verdicts = Vec::with_capacity(processed.len() + rejected.len());
        for result in processed {
            verdicts.push(result.into_verdict("", Some(STATE_PROCESSED)));
        }
        for result in rejected {
            verdicts.push(result.into_verdict("", Some(STATE_REJECTED)));
        }
        verdicts.retain(|v| !v.generation_code.is_empty());

        Ok(BatchStatusReport {
            state: BatchState::Results(verdicts),
            raw_response: Some(body),
        })
    }

    async fn query_document_status(&self, query: &DocumentQuery) -> AuthorityResult<Option<RemoteDocumentStatus>> {
        let payload = ConsultRequest {
            nit_emisor: &self.issuer_nit,
            tdte: query.kind.code(),
            codigo_generacion: &query.generation_code,
        };
        let request = self.client.post(&self.consult_url).json(&payload);
        let (status, body) = self.send_authorized(request).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, body));
        }

        let parsed: DocumentResult = Self::parse(&body)?;
        if non_empty(&parsed.estado).is_none() {
            return Ok(None);
        }
        Ok(Some(parsed.into_remote(&query.generation_code)))
    }

    async fn submit_contingency_event(&self, event: &ContingencyEventSubmission) -> AuthorityResult<EventReceipt> {
        let payload = ContingencyRequest {
            nit: &self.issuer_nit,
            documento: &event.signed_event,
        };

        info!(generation_code = %event.generation_code, "Submitting contingency notification");
        let request = self.client.post(self.url("/fesv/contingencia")).json(&payload);
        let (status, body) = self.send_authorized(request).await?;

        if !status.is_success() {
            // The authority explains refusals in the same body shape.
            if status.is_client_error() && status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN {
                if let Ok(parsed) = Self::parse::<ContingencyResponse>(&body) {
                    return Err(AuthorityError::Rejected {
                        code: parsed.estado.unwrap_or_else(|| format!("HTTP_{}", status.as_u16())),
                        message: parsed.mensaje.unwrap_or_default(),
                        raw_response: Some(body),
                    });
                }
            }
            return Err(status_error(status, body));
        }

        let parsed: ContingencyResponse = Self::parse(&body)?;
        Ok(EventReceipt {
            state: parsed.estado.unwrap_or_default(),
            received_seal: non_empty(&parsed.sello_recibido),
            message: non_empty(&parsed.mensaje),
            observations: parsed.observaciones.unwrap_or_default(),
            raw_response: Some(body),
        })
    }
}
