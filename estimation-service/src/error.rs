//! Domain error taxonomy.
//!
//! Validation failures carry every violation found so callers can present them
//! together. Concurrency conflicts are kept apart from validation so callers can
//! re-fetch and retry instead of treating them as user error.

use crate::models::{DocumentKind, StableId};
use crate::pricing::PricingError;
use crate::services::metrics::{ERRORS_TOTAL, VIOLATIONS_TOTAL};
use serde::Serialize;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// SQLSTATEs that mean "someone else holds or changed this row".
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DuplicateStableId,
    UnknownCategory,
    InvalidQuantity,
    InvalidAmount,
    QuantityExceeded,
    WeightageOutOfRange,
    WeightageMismatch,
    IncompleteComponent,
    UnknownEstimationItem,
    DirectItemLinked,
    ImmutableItem,
    AllocatedItemRemoved,
    InvalidStatusTransition,
    EmptyDocument,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateStableId => "duplicate_stable_id",
            Self::UnknownCategory => "unknown_category",
            Self::InvalidQuantity => "invalid_quantity",
            Self::InvalidAmount => "invalid_amount",
            Self::QuantityExceeded => "quantity_exceeded",
            Self::WeightageOutOfRange => "weightage_out_of_range",
            Self::WeightageMismatch => "weightage_mismatch",
            Self::IncompleteComponent => "incomplete_component",
            Self::UnknownEstimationItem => "unknown_estimation_item",
            Self::DirectItemLinked => "direct_item_linked",
            Self::ImmutableItem => "immutable_item",
            Self::AllocatedItemRemoved => "allocated_item_removed",
            Self::InvalidStatusTransition => "invalid_status_transition",
            Self::EmptyDocument => "empty_document",
        }
    }
}

/// One problem with a proposed revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_item_id: Option<StableId>,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stable_item_id: None,
            message: message.into(),
        }
    }

    pub fn for_item(kind: ViolationKind, item: StableId, message: impl Into<String>) -> Self {
        Self {
            kind,
            stable_item_id: Some(item),
            message: message.into(),
        }
    }
}

impl Violation {
    /// Map a pricing failure on one line to a violation.
    pub fn from_pricing(item: StableId, item_name: &str, err: PricingError) -> Self {
        let kind = match err {
            PricingError::Negative(_) => ViolationKind::InvalidQuantity,
            PricingError::OutOfRange(_) => ViolationKind::InvalidAmount,
        };
        Self::for_item(kind, item, format!("'{}': {}", item_name, err))
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.stable_item_id {
            Some(id) => write!(f, "{} ({}): {}", self.kind.as_str(), id, self.message),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Validation failed: {}", summarize(.0))]
    Validation(Vec<Violation>),

    #[error("Conflict on {kind} {document_id}: {reason}")]
    Conflict {
        kind: DocumentKind,
        document_id: Uuid,
        reason: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    App(#[from] AppError),
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ServiceError {
    /// Build a validation error, counting each violation by kind.
    pub fn invalid(violations: Vec<Violation>) -> Self {
        for v in &violations {
            VIOLATIONS_TOTAL.with_label_values(&[v.kind.as_str()]).inc();
        }
        Self::Validation(violations)
    }

    pub fn conflict(kind: DocumentKind, document_id: Uuid, reason: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            document_id,
            reason: reason.into(),
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Validation(v) => v,
            _ => &[],
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// True when the database refused because of a lock wait, serialization
/// failure or deadlock.
pub fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some(LOCK_NOT_AVAILABLE | SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
        ),
        _ => false,
    }
}

/// Map a database failure on a document into a conflict or a database error.
pub fn db_error(
    kind: DocumentKind,
    document_id: Uuid,
    context: &'static str,
) -> impl FnOnce(sqlx::Error) -> ServiceError {
    move |e| {
        if is_contention(&e) {
            ERRORS_TOTAL.with_label_values(&["conflict"]).inc();
            ServiceError::conflict(kind, document_id, format!("{}: {}", context, e))
        } else {
            ERRORS_TOTAL.with_label_values(&["db_error"]).inc();
            ServiceError::App(AppError::DatabaseError(anyhow::anyhow!(
                "{}: {}",
                context,
                e
            )))
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::App(AppError::ValidationError(err))
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(violations) => AppError::Violations(
                serde_json::to_value(&violations)
                    .unwrap_or_else(|_| serde_json::Value::String(summarize(&violations))),
            ),
            ServiceError::Conflict {
                kind,
                document_id,
                reason,
            } => AppError::Conflict(anyhow::anyhow!(
                "Conflict on {} {}: {}",
                kind,
                document_id,
                reason
            )),
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!(what)),
            ServiceError::App(app) => app,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_keeps_every_violation() {
        let err = ServiceError::invalid(vec![
            Violation::new(ViolationKind::EmptyDocument, "no items"),
            Violation::for_item(ViolationKind::InvalidQuantity, StableId::new(), "negative"),
        ]);

        assert_eq!(err.violations().len(), 2);
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("empty_document"));
        assert!(err.to_string().contains("invalid_quantity"));
    }

    #[test]
    fn test_conflict_maps_to_app_conflict() {
        let err = ServiceError::conflict(DocumentKind::Estimation, Uuid::nil(), "stale version");
        assert!(err.is_conflict());
        assert!(matches!(AppError::from(err), AppError::Conflict(_)));
    }

    #[test]
    fn test_validation_maps_to_structured_violations() {
        let err = ServiceError::invalid(vec![Violation::new(ViolationKind::EmptyDocument, "x")]);
        match AppError::from(err) {
            AppError::Violations(details) => {
                assert_eq!(details[0]["kind"], "empty_document");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_non_database_errors_are_not_contention() {
        assert!(!is_contention(&sqlx::Error::RowNotFound));
    }
}
