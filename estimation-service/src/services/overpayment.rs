//! Overpayment detection and the approve/reject callback.

use crate::error::{db_error, ServiceError, Violation, ViolationKind};
use crate::models::{
    CustomerPayment, DocumentKind, OverpaymentStatus, PaymentType, RecordCustomerPayment,
};
use crate::services::ledger::insert_customer_payment;
use crate::services::metrics::{DB_QUERY_DURATION, OVERPAYMENTS_DETECTED};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnection, PgPool};
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overpayment {
    pub has_overpayment: bool,
    /// Excess of collected over the candidate total; zero when none.
    pub amount: Decimal,
    pub collected: Decimal,
}

/// Compare approved collections against a candidate final value.
pub fn detect(collected: Decimal, candidate_final_value: Decimal) -> Overpayment {
    let excess = collected - candidate_final_value;
    if excess > Decimal::ZERO {
        Overpayment {
            has_overpayment: true,
            amount: excess,
            collected,
        }
    } else {
        Overpayment {
            has_overpayment: false,
            amount: Decimal::ZERO,
            collected,
        }
    }
}

/// Decision delivered by the external approval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverpaymentDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverpaymentResolution {
    pub estimation_id: Uuid,
    pub status: OverpaymentStatus,
    /// Pending credit note raised for the overpaid amount on approval.
    pub credit_note: Option<CustomerPayment>,
}

/// Sum of approved customer payments for a project. Credit notes are stored
/// negative and reduce the total.
#[instrument(skip(conn), fields(project_id = %project_id))]
pub async fn collected_amount(
    conn: &mut PgConnection,
    project_id: Uuid,
) -> Result<Decimal, ServiceError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["collected_amount"])
        .start_timer();

    let collected: Decimal = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(amount), 0)
        FROM customer_payments
        WHERE project_id = $1 AND status = 'approved'
        "#,
    )
    .bind(project_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error(
        DocumentKind::Estimation,
        project_id,
        "Failed to sum approved payments",
    ))?;

    timer.observe_duration();
    Ok(collected)
}

/// Advisory check of a candidate estimation total against collections.
pub async fn check_overpayment(
    conn: &mut PgConnection,
    project_id: Uuid,
    candidate_final_value: Decimal,
    source: &str,
) -> Result<Overpayment, ServiceError> {
    let collected = collected_amount(conn, project_id).await?;
    let result = detect(collected, candidate_final_value);
    if result.has_overpayment {
        OVERPAYMENTS_DETECTED.with_label_values(&[source]).inc();
    }
    Ok(result)
}

/// Status an estimation should carry after a check.
///
/// A fresh excess waits for approval; an excess already decided keeps its
/// decision; no excess clears the status.
pub fn next_status(current: OverpaymentStatus, overpayment: &Overpayment) -> OverpaymentStatus {
    match (overpayment.has_overpayment, current) {
        (false, _) => OverpaymentStatus::None,
        (true, OverpaymentStatus::None) => OverpaymentStatus::PendingApproval,
        (true, decided) => decided,
    }
}

/// Recompute the overpayment fields on a project's estimation from its current
/// final value. Does nothing when the project has no estimation yet.
#[instrument(skip(conn), fields(project_id = %project_id))]
pub async fn refresh_overpayment_flag(
    conn: &mut PgConnection,
    project_id: Uuid,
) -> Result<Option<Overpayment>, ServiceError> {
    let row: Option<(Uuid, Decimal, String)> = sqlx::query_as(
        r#"
        SELECT estimation_id, final_value, overpayment_status
        FROM estimations
        WHERE project_id = $1
        FOR UPDATE
        "#,
    )
    .bind(project_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error(
        DocumentKind::Estimation,
        project_id,
        "Failed to load estimation totals",
    ))?;

    let Some((estimation_id, final_value, status)) = row else {
        return Ok(None);
    };

    let overpayment = check_overpayment(conn, project_id, final_value, "payment").await?;
    let current = OverpaymentStatus::from_string(&status).unwrap_or(OverpaymentStatus::None);
    let status = next_status(current, &overpayment);

    sqlx::query(
        r#"
        UPDATE estimations
        SET has_overpayment = $2, overpayment_amount = $3, overpayment_status = $4
        WHERE estimation_id = $1
        "#,
    )
    .bind(estimation_id)
    .bind(overpayment.has_overpayment)
    .bind(overpayment.amount)
    .bind(status.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_error(
        DocumentKind::Estimation,
        estimation_id,
        "Failed to update overpayment flag",
    ))?;

    info!(
        estimation_id = %estimation_id,
        has_overpayment = overpayment.has_overpayment,
        amount = %overpayment.amount,
        status = %status,
        "Overpayment flag refreshed"
    );

    Ok(Some(overpayment))
}

/// Reads and the approval callback for overpayments.
#[derive(Clone)]
pub struct OverpaymentDetector {
    pool: PgPool,
}

impl OverpaymentDetector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check a candidate final value against approved collections.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn check_overpayment(
        &self,
        project_id: Uuid,
        candidate_final_value: Decimal,
    ) -> Result<Overpayment, ServiceError> {
        let mut conn = self.pool.acquire().await.map_err(db_error(
            DocumentKind::Estimation,
            project_id,
            "Failed to acquire connection",
        ))?;
        check_overpayment(&mut conn, project_id, candidate_final_value, "check").await
    }

    /// Apply the external approval decision for a pending overpayment.
    ///
    /// Approval raises a pending credit note for the overpaid amount; it reaches
    /// the ledger only when that credit note is itself approved.
    #[instrument(skip(self), fields(estimation_id = %estimation_id, decision = ?decision))]
    pub async fn resolve_overpayment(
        &self,
        estimation_id: Uuid,
        decision: OverpaymentDecision,
        actor: Uuid,
    ) -> Result<OverpaymentResolution, ServiceError> {
        let kind = DocumentKind::Estimation;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, estimation_id, "Failed to begin transaction"))?;

        let row: Option<(Uuid, bool, Decimal, String)> = sqlx::query_as(
            r#"
            SELECT project_id, has_overpayment, overpayment_amount, overpayment_status
            FROM estimations
            WHERE estimation_id = $1
            FOR UPDATE
            "#,
        )
        .bind(estimation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error(kind, estimation_id, "Failed to lock estimation"))?;

        let (project_id, has_overpayment, amount, status) = row
            .ok_or_else(|| ServiceError::NotFound(format!("estimation {}", estimation_id)))?;

        if !has_overpayment
            || OverpaymentStatus::from_string(&status) != Some(OverpaymentStatus::PendingApproval)
        {
            return Err(ServiceError::invalid(vec![Violation::new(
                ViolationKind::InvalidStatusTransition,
                format!("estimation has no overpayment awaiting approval (status {})", status),
            )]));
        }

        let (next, credit_note) = match decision {
            OverpaymentDecision::Approve => {
                let input = RecordCustomerPayment {
                    project_id,
                    payment_type: PaymentType::CreditNote,
                    amount,
                    payment_date: Utc::now().date_naive(),
                    mode: "credit_note".to_string(),
                    reference_number: None,
                    remarks: Some("Credit note for estimation overpayment".to_string()),
                };
                let note =
                    insert_customer_payment(&mut *tx, &input, Some(estimation_id), actor).await?;
                (OverpaymentStatus::Approved, Some(note))
            }
            OverpaymentDecision::Reject => (OverpaymentStatus::Rejected, None),
        };

        sqlx::query("UPDATE estimations SET overpayment_status = $2 WHERE estimation_id = $1")
            .bind(estimation_id)
            .bind(next.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error(kind, estimation_id, "Failed to update overpayment status"))?;

        tx.commit()
            .await
            .map_err(db_error(kind, estimation_id, "Failed to commit transaction"))?;

        info!(status = %next, amount = %amount, "Overpayment resolved");

        Ok(OverpaymentResolution {
            estimation_id,
            status: next,
            credit_note,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_overpayment_reports_excess() {
        let result = detect(dec!(500000), dec!(450000));
        assert!(result.has_overpayment);
        assert_eq!(result.amount, dec!(50000));
        assert_eq!(result.collected, dec!(500000));
    }

    #[test]
    fn test_no_overpayment_at_or_above_collected() {
        for candidate in [dec!(500000), dec!(500000.01), dec!(750000)] {
            let result = detect(dec!(500000), candidate);
            assert!(!result.has_overpayment);
            assert_eq!(result.amount, Decimal::ZERO);
        }
    }

    #[test]
    fn test_next_status_transitions() {
        let over = detect(dec!(10), dec!(5));
        let clear = detect(dec!(5), dec!(10));

        assert_eq!(
            next_status(OverpaymentStatus::None, &over),
            OverpaymentStatus::PendingApproval
        );
        assert_eq!(
            next_status(OverpaymentStatus::Approved, &over),
            OverpaymentStatus::Approved
        );
        assert_eq!(
            next_status(OverpaymentStatus::PendingApproval, &clear),
            OverpaymentStatus::None
        );
    }
}
