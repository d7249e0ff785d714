//! # Validation Module
//!
//! Input and invariant checks that run before anything is persisted or sent.
//!
//! ## Usage
//! ```rust
//! use fiscal_core::validation::{partition_into_lotes, validate_batch_size};
//!
//! validate_batch_size(100).unwrap();
//! let lotes = partition_into_lotes((0..150).collect::<Vec<_>>(), 100).unwrap();
//! assert_eq!(lotes.len(), 2);
//! ```

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{ContingencyType, DateRange, Document, Scope};
use crate::{MAX_AUTHORITY_BATCH_SIZE, MAX_CONTINGENCY_REASON_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Scope / Identifiers
// =============================================================================

/// Every component of a scope must be present.
pub fn validate_scope(scope: &Scope) -> ValidationResult<()> {
    for (field, value) in [
        ("company_id", &scope.company_id),
        ("establishment_id", &scope.establishment_id),
        ("point_of_sale_id", &scope.point_of_sale_id),
    ] {
        if value.trim().is_empty() {
            return Err(ValidationError::Required {
                field: field.to_string(),
            });
        }
    }
    Ok(())
}

/// Generation codes are UUIDs, written uppercase by convention.
pub fn validate_generation_code(code: &str) -> ValidationResult<()> {
    if code.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "generation_code".to_string(),
        });
    }

    uuid::Uuid::parse_str(code).map_err(|_| ValidationError::InvalidFormat {
        field: "generation_code".to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

/// Control numbers are at most 31 characters (`DTE-TT-EEEEPPPP-NNNNNNNNNNNNNNN`).
pub fn validate_control_number(control_number: &str) -> ValidationResult<()> {
    let control_number = control_number.trim();
    if control_number.is_empty() {
        return Err(ValidationError::Required {
            field: "control_number".to_string(),
        });
    }
    if control_number.len() > 31 {
        return Err(ValidationError::TooLong {
            field: "control_number".to_string(),
            max: 31,
        });
    }
    Ok(())
}

/// Checks a document about to enter the pipeline.
pub fn validate_document(document: &Document) -> ValidationResult<()> {
    validate_scope(&document.scope)?;
    validate_generation_code(&document.generation_code)?;
    validate_control_number(&document.control_number)?;
    if document.signed_payload.is_empty() {
        return Err(ValidationError::Required {
            field: "signed_payload".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Contingency
// =============================================================================

/// Type 5 (other) needs a reason; every reason fits the authority's limit.
pub fn validate_contingency_reason(
    contingency_type: ContingencyType,
    reason: Option<&str>,
) -> ValidationResult<()> {
    let reason = reason.map(str::trim).unwrap_or_default();

    if contingency_type.requires_reason() && reason.is_empty() {
        return Err(ValidationError::Required {
            field: "reason".to_string(),
        });
    }

    if reason.chars().count() > MAX_CONTINGENCY_REASON_LEN {
        return Err(ValidationError::TooLong {
            field: "reason".to_string(),
            max: MAX_CONTINGENCY_REASON_LEN,
        });
    }

    Ok(())
}

// =============================================================================
// Batching
// =============================================================================

/// Batch size must be between 1 and the authority cap.
pub fn validate_batch_size(size: usize) -> ValidationResult<()> {
    if size == 0 || size > MAX_AUTHORITY_BATCH_SIZE {
        return Err(ValidationError::OutOfRange {
            field: "max_batch_size".to_string(),
            min: 1,
            max: MAX_AUTHORITY_BATCH_SIZE as i64,
        });
    }
    Ok(())
}

/// Splits items into consecutive chunks of at most `cap`, preserving order.
pub fn partition_into_lotes<T>(items: Vec<T>, cap: usize) -> ValidationResult<Vec<Vec<T>>> {
    if cap == 0 {
        return Err(ValidationError::OutOfRange {
            field: "max_batch_size".to_string(),
            min: 1,
            max: MAX_AUTHORITY_BATCH_SIZE as i64,
        });
    }

    let mut lotes = Vec::with_capacity(items.len().div_ceil(cap));
    let mut current = Vec::with_capacity(cap.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == cap {
            lotes.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        lotes.push(current);
    }
    Ok(lotes)
}

/// Every document grouped into a lote must share the lote's scope.
pub fn ensure_same_scope<'a>(
    expected: &Scope,
    documents: impl IntoIterator<Item = &'a Document>,
) -> CoreResult<()> {
    for doc in documents {
        if &doc.scope != expected {
            return Err(CoreError::ScopeMismatch {
                generation_code: doc.generation_code.clone(),
                expected: expected.to_string(),
                found: doc.scope.to_string(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Dates
// =============================================================================

pub fn validate_date_range(range: &DateRange) -> ValidationResult<()> {
    if range.from > range.to {
        return Err(ValidationError::InvalidFormat {
            field: "date_range".to_string(),
            reason: format!("start {} is after end {}", range.from, range.to),
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
