//! # Contingency Notice
//!
//! The document a closing period sends to the authority to report its own
//! outage window and the documents issued during it.
//!
//! ```text
//! identificacion  version, ambiente, codigoGeneracion, transmission date/time
//! emisor          nit, establishment, point of sale
//! detalleDTE      [{ noItem, codigoGeneracion, tipoDoc }, ...]
//! motivo          window start/end, tipoContingencia, motivoContingencia
//! ```
//!
//! Signing happens outside this crate; the notice is only built and
//! serialized here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ContingencyPeriod, DocumentKind};

const NOTICE_VERSION: u32 = 3;

/// One document reported inside a notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeItem {
    pub no_item: u32,
    pub codigo_generacion: String,
    pub tipo_doc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeIdentification {
    pub version: u32,
    pub ambiente: String,
    pub codigo_generacion: String,
    pub f_transmision: String,
    pub h_transmision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeIssuer {
    pub nit: String,
    pub cod_establecimiento: String,
    pub cod_punto_venta: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeReason {
    pub f_inicio: String,
    pub f_fin: String,
    pub h_inicio: String,
    pub h_fin: String,
    pub tipo_contingencia: i32,
    pub motivo_contingencia: Option<String>,
}

/// Unsigned contingency notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContingencyNotice {
    pub identificacion: NoticeIdentification,
    pub emisor: NoticeIssuer,
    #[serde(rename = "detalleDTE")]
    pub detalle_dte: Vec<NoticeItem>,
    pub motivo: NoticeReason,
}

impl ContingencyNotice {
    /// Builds the notice for a period that has been closed at `closed_at`.
    ///
    /// `documents` is the list of (generation code, kind) issued in the window.
    pub fn for_period(
        period: &ContingencyPeriod,
        generation_code: &str,
        issuer_nit: &str,
        closed_at: DateTime<Utc>,
        transmitted_at: DateTime<Utc>,
        documents: &[(String, DocumentKind)],
    ) -> Self {
        let detalle_dte = documents
            .iter()
            .enumerate()
            .map(|(i, (code, kind))| NoticeItem {
                no_item: (i + 1) as u32,
                codigo_generacion: code.clone(),
                tipo_doc: kind.code().to_string(),
            })
            .collect();

        // Type 5 always carries its reason; other types only when one was given.
        let motivo_contingencia = period
            .reason
            .as_ref()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        ContingencyNotice {
            identificacion: NoticeIdentification {
                version: NOTICE_VERSION,
                ambiente: period.scope.environment.code().to_string(),
                codigo_generacion: generation_code.to_string(),
                f_transmision: transmitted_at.format("%Y-%m-%d").to_string(),
                h_transmision: transmitted_at.format("%H:%M:%S").to_string(),
            },
            emisor: NoticeIssuer {
                nit: issuer_nit.to_string(),
                cod_establecimiento: period.scope.establishment_id.clone(),
                cod_punto_venta: period.scope.point_of_sale_id.clone(),
            },
            detalle_dte,
            motivo: NoticeReason {
                f_inicio: period.started_at.format("%Y-%m-%d").to_string(),
                f_fin: closed_at.format("%Y-%m-%d").to_string(),
                h_inicio: period.started_at.format("%H:%M:%S").to_string(),
                h_fin: closed_at.format("%H:%M:%S").to_string(),
                tipo_contingencia: period.contingency_type.code(),
                motivo_contingencia,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
