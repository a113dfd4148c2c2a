//! Customer and vendor payments and the immutable project ledger.
//!
//! Customer payments reach the ledger only on approval. Vendor payments are
//! posted when recorded. Every entry is keyed by `(source_table, source_id)`,
//! which makes posting idempotent: a second post for the same source is a no-op.

use crate::error::{db_error, ServiceError, Violation, ViolationKind};
use crate::models::{
    CustomerPayment, DocumentKind, EntryType, LedgerEntry, PaymentStatus, PaymentType,
    ProjectLedger, RecordCustomerPayment, RecordVendorPayment, SourceTable, VendorPayment,
};
use crate::services::metrics::{record_ledger_posting, DB_QUERY_DURATION};
use crate::services::overpayment::{refresh_overpayment_flag, Overpayment};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnection, PgPool};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const CUSTOMER_PAYMENT_COLUMNS: &str = "payment_id, project_id, estimation_id, payment_type, \
     amount, status, payment_date, mode, reference_number, remarks, approved_by, approved_utc, \
     created_utc, created_by";

const LEDGER_COLUMNS: &str = "entry_id, project_id, source_table, source_id, entry_type, amount, \
     remarks, posted_by, entry_utc";

/// Ledger direction and magnitude for an approved customer payment.
///
/// Receipts are credits. Credit notes are stored negative and post as debits
/// of their magnitude.
pub fn entry_for_payment(payment_type: PaymentType, amount: Decimal) -> (EntryType, Decimal) {
    match payment_type {
        PaymentType::Payment => (EntryType::Credit, amount.abs()),
        PaymentType::CreditNote => (EntryType::Debit, amount.abs()),
    }
}

/// Result of an idempotent posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub entry: LedgerEntry,
    /// False when an entry for the same source already existed.
    pub created: bool,
}

/// Entry to post for a source record.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub project_id: Uuid,
    pub source_table: SourceTable,
    pub source_id: Uuid,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub remarks: Option<&'a str>,
    pub posted_by: Uuid,
}

/// Post one ledger entry unless the source already has one.
pub async fn post_entry(
    conn: &mut PgConnection,
    new: NewEntry<'_>,
) -> Result<Posting, ServiceError> {
    let NewEntry {
        project_id,
        source_table,
        source_id,
        entry_type,
        amount,
        remarks,
        posted_by,
    } = new;
    let kind = DocumentKind::LedgerEntry;
    let timer = DB_QUERY_DURATION
        .with_label_values(&["post_ledger_entry"])
        .start_timer();

    let existing_sql = format!(
        "SELECT {} FROM project_ledger WHERE source_table = $1 AND source_id = $2",
        LEDGER_COLUMNS
    );
    let existing = sqlx::query_as::<_, LedgerEntry>(&existing_sql)
        .bind(source_table.as_str())
        .bind(source_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error(kind, source_id, "Failed to check existing ledger entry"))?;

    if let Some(entry) = existing {
        timer.observe_duration();
        record_ledger_posting(entry_type.as_str(), "skipped");
        info!(entry_id = %entry.entry_id, source_id = %source_id, "Ledger entry already posted");
        return Ok(Posting {
            entry,
            created: false,
        });
    }

    // ON CONFLICT covers a concurrent poster that slipped in after the check.
    let insert_sql = format!(
        r#"
        INSERT INTO project_ledger (entry_id, project_id, source_table, source_id, entry_type, amount, remarks, posted_by, entry_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (source_table, source_id) DO NOTHING
        RETURNING {}
        "#,
        LEDGER_COLUMNS
    );
    let inserted = sqlx::query_as::<_, LedgerEntry>(&insert_sql)
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(source_table.as_str())
        .bind(source_id)
        .bind(entry_type.as_str())
        .bind(amount)
        .bind(remarks)
        .bind(posted_by)
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error(kind, source_id, "Failed to post ledger entry"))?;

    let posting = match inserted {
        Some(entry) => Posting {
            entry,
            created: true,
        },
        None => {
            let entry = sqlx::query_as::<_, LedgerEntry>(&existing_sql)
                .bind(source_table.as_str())
                .bind(source_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error(kind, source_id, "Failed to load concurrent ledger entry"))?;
            Posting {
                entry,
                created: false,
            }
        }
    };

    timer.observe_duration();
    record_ledger_posting(
        entry_type.as_str(),
        if posting.created { "posted" } else { "skipped" },
    );

    if posting.created {
        info!(
            entry_id = %posting.entry.entry_id,
            entry_type = %entry_type,
            amount = %amount,
            source_table = source_table.as_str(),
            "Ledger entry posted"
        );
    }

    Ok(posting)
}

/// Insert a pending customer payment. Credit notes are stored negative.
pub(crate) async fn insert_customer_payment(
    conn: &mut PgConnection,
    input: &RecordCustomerPayment,
    estimation_id: Option<Uuid>,
    actor: Uuid,
) -> Result<CustomerPayment, ServiceError> {
    let payment_id = Uuid::new_v4();
    let amount = match input.payment_type {
        PaymentType::Payment => input.amount.abs(),
        PaymentType::CreditNote => -input.amount.abs(),
    };

    let sql = format!(
        r#"
        INSERT INTO customer_payments (payment_id, project_id, estimation_id, payment_type, amount, status, payment_date, mode, reference_number, remarks, created_by)
        VALUES ($1, $2, COALESCE($3, (SELECT estimation_id FROM estimations WHERE project_id = $2)), $4, $5, 'pending', $6, $7, $8, $9, $10)
        RETURNING {}
        "#,
        CUSTOMER_PAYMENT_COLUMNS
    );
    sqlx::query_as::<_, CustomerPayment>(&sql)
        .bind(payment_id)
        .bind(input.project_id)
        .bind(estimation_id)
        .bind(input.payment_type.as_str())
        .bind(amount)
        .bind(input.payment_date)
        .bind(&input.mode)
        .bind(&input.reference_number)
        .bind(&input.remarks)
        .bind(actor)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error(
            DocumentKind::CustomerPayment,
            payment_id,
            "Failed to record customer payment",
        ))
}

/// Result of approving a customer payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub payment: CustomerPayment,
    pub posting: Posting,
    /// Overpayment state of the project's estimation after approval.
    pub overpayment: Option<Overpayment>,
}

/// Payment recording, approval and ledger reads.
#[derive(Clone)]
pub struct PaymentLedgerPoster {
    pool: PgPool,
}

impl PaymentLedgerPoster {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a customer receipt or credit note as pending. No ledger effect.
    #[instrument(skip(self, input), fields(project_id = %input.project_id, payment_type = input.payment_type.as_str()))]
    pub async fn record_customer_payment(
        &self,
        input: RecordCustomerPayment,
        actor: Uuid,
    ) -> Result<CustomerPayment, ServiceError> {
        input.validate()?;

        let mut conn = self.pool.acquire().await.map_err(db_error(
            DocumentKind::CustomerPayment,
            input.project_id,
            "Failed to acquire connection",
        ))?;
        let payment = insert_customer_payment(&mut conn, &input, None, actor).await?;

        info!(payment_id = %payment.payment_id, amount = %payment.amount, "Customer payment recorded");
        Ok(payment)
    }

    /// Approve a customer payment and post it to the ledger.
    ///
    /// Approving an already approved payment posts nothing new and returns the
    /// existing entry.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn approve_payment(
        &self,
        payment_id: Uuid,
        actor: Uuid,
    ) -> Result<ApprovalOutcome, ServiceError> {
        let kind = DocumentKind::CustomerPayment;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, payment_id, "Failed to begin transaction"))?;

        let payment = lock_customer_payment(&mut tx, payment_id).await?;

        let status = payment.parsed_status().unwrap_or(PaymentStatus::Pending);
        let payment = match status {
            PaymentStatus::Rejected => {
                return Err(ServiceError::invalid(vec![Violation::new(
                    ViolationKind::InvalidStatusTransition,
                    "a rejected payment cannot be approved",
                )]));
            }
            PaymentStatus::Approved => payment,
            PaymentStatus::Pending => {
                let sql = format!(
                    "UPDATE customer_payments SET status = 'approved', approved_by = $2, approved_utc = $3 \
                     WHERE payment_id = $1 RETURNING {}",
                    CUSTOMER_PAYMENT_COLUMNS
                );
                sqlx::query_as::<_, CustomerPayment>(&sql)
                    .bind(payment_id)
                    .bind(actor)
                    .bind(Utc::now())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_error(kind, payment_id, "Failed to approve payment"))?
            }
        };

        let payment_type = payment.parsed_type().unwrap_or(PaymentType::Payment);
        let (entry_type, amount) = entry_for_payment(payment_type, payment.amount);
        let remarks = match payment_type {
            PaymentType::Payment => "Customer payment approved",
            PaymentType::CreditNote => "Credit note approved",
        };
        let posting = post_entry(
            &mut tx,
            NewEntry {
                project_id: payment.project_id,
                source_table: SourceTable::CustomerPayments,
                source_id: payment.payment_id,
                entry_type,
                amount,
                remarks: Some(remarks),
                posted_by: actor,
            },
        )
        .await?;

        let overpayment = refresh_overpayment_flag(&mut tx, payment.project_id).await?;

        tx.commit()
            .await
            .map_err(db_error(kind, payment_id, "Failed to commit transaction"))?;

        Ok(ApprovalOutcome {
            payment,
            posting,
            overpayment,
        })
    }

    /// Reject a pending payment. Rejecting twice is a no-op.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn reject_payment(
        &self,
        payment_id: Uuid,
        actor: Uuid,
    ) -> Result<CustomerPayment, ServiceError> {
        let kind = DocumentKind::CustomerPayment;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, payment_id, "Failed to begin transaction"))?;

        let payment = lock_customer_payment(&mut tx, payment_id).await?;

        let payment = match payment.parsed_status() {
            Some(PaymentStatus::Approved) => {
                return Err(ServiceError::invalid(vec![Violation::new(
                    ViolationKind::InvalidStatusTransition,
                    "an approved payment cannot be rejected; reverse its ledger entry instead",
                )]));
            }
            Some(PaymentStatus::Rejected) => payment,
            _ => {
                let sql = format!(
                    "UPDATE customer_payments SET status = 'rejected', approved_by = $2, approved_utc = $3 \
                     WHERE payment_id = $1 RETURNING {}",
                    CUSTOMER_PAYMENT_COLUMNS
                );
                sqlx::query_as::<_, CustomerPayment>(&sql)
                    .bind(payment_id)
                    .bind(actor)
                    .bind(Utc::now())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_error(kind, payment_id, "Failed to reject payment"))?
            }
        };

        tx.commit()
            .await
            .map_err(db_error(kind, payment_id, "Failed to commit transaction"))?;

        info!(status = %payment.status, "Customer payment rejected");
        Ok(payment)
    }

    /// Record a vendor disbursement and post its debit in the same transaction.
    #[instrument(skip(self, input), fields(project_id = %input.project_id, vendor_id = %input.vendor_id))]
    pub async fn record_vendor_payment(
        &self,
        input: RecordVendorPayment,
        actor: Uuid,
    ) -> Result<(VendorPayment, Posting), ServiceError> {
        input.validate()?;

        let kind = DocumentKind::VendorPayment;
        let payment_id = Uuid::new_v4();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, payment_id, "Failed to begin transaction"))?;

        let payment = sqlx::query_as::<_, VendorPayment>(
            r#"
            INSERT INTO vendor_payments (payment_id, project_id, vendor_id, purchase_request_id, payment_stage, amount, payment_date, mode, reference_number, remarks, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING payment_id, project_id, vendor_id, purchase_request_id, payment_stage, amount, payment_date, mode, reference_number, remarks, created_utc, created_by
            "#,
        )
        .bind(payment_id)
        .bind(input.project_id)
        .bind(input.vendor_id)
        .bind(input.purchase_request_id)
        .bind(&input.payment_stage)
        .bind(input.amount)
        .bind(input.payment_date)
        .bind(&input.mode)
        .bind(&input.reference_number)
        .bind(&input.remarks)
        .bind(actor)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error(kind, payment_id, "Failed to record vendor payment"))?;

        let posting = post_entry(
            &mut tx,
            NewEntry {
                project_id: payment.project_id,
                source_table: SourceTable::VendorPayments,
                source_id: payment.payment_id,
                entry_type: EntryType::Debit,
                amount: payment.amount,
                remarks: Some("Vendor payment"),
                posted_by: actor,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(db_error(kind, payment_id, "Failed to commit transaction"))?;

        Ok((payment, posting))
    }

    /// Post the opposite of an existing entry. Reversing twice returns the
    /// first reversal. Reversals themselves cannot be reversed.
    #[instrument(skip(self, remarks), fields(entry_id = %entry_id))]
    pub async fn reverse_ledger_entry(
        &self,
        entry_id: Uuid,
        actor: Uuid,
        remarks: Option<String>,
    ) -> Result<Posting, ServiceError> {
        let kind = DocumentKind::LedgerEntry;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, entry_id, "Failed to begin transaction"))?;

        let sql = format!(
            "SELECT {} FROM project_ledger WHERE entry_id = $1",
            LEDGER_COLUMNS
        );
        let original = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error(kind, entry_id, "Failed to load ledger entry"))?
            .ok_or_else(|| ServiceError::NotFound(format!("ledger entry {}", entry_id)))?;

        if original.source_table == SourceTable::ProjectLedger.as_str() {
            warn!("Attempt to reverse a reversal");
            return Err(ServiceError::invalid(vec![Violation::new(
                ViolationKind::InvalidStatusTransition,
                "a reversal entry cannot itself be reversed",
            )]));
        }

        let entry_type = original
            .parsed_entry_type()
            .ok_or_else(|| {
                ServiceError::App(service_core::error::AppError::InternalError(anyhow::anyhow!(
                    "Ledger entry {} has unknown type '{}'",
                    entry_id,
                    original.entry_type
                )))
            })?
            .opposite();
        let remarks = remarks.unwrap_or_else(|| format!("Reversal of entry {}", entry_id));

        let posting = post_entry(
            &mut tx,
            NewEntry {
                project_id: original.project_id,
                source_table: SourceTable::ProjectLedger,
                source_id: original.entry_id,
                entry_type,
                amount: original.amount,
                remarks: Some(&remarks),
                posted_by: actor,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(db_error(kind, entry_id, "Failed to commit transaction"))?;

        Ok(posting)
    }

    /// All entries of a project in posting order, with running balance.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn project_ledger(&self, project_id: Uuid) -> Result<ProjectLedger, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["project_ledger"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM project_ledger WHERE project_id = $1 ORDER BY entry_utc, entry_id",
            LEDGER_COLUMNS
        );
        let entries = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error(
                DocumentKind::LedgerEntry,
                project_id,
                "Failed to load project ledger",
            ))?;

        timer.observe_duration();
        Ok(ProjectLedger::from_entries(project_id, entries))
    }

    /// Customer payments of a project, newest first.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn list_customer_payments(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<CustomerPayment>, ServiceError> {
        let sql = format!(
            "SELECT {} FROM customer_payments WHERE project_id = $1 ORDER BY payment_date DESC, created_utc DESC",
            CUSTOMER_PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, CustomerPayment>(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error(
                DocumentKind::CustomerPayment,
                project_id,
                "Failed to list customer payments",
            ))
    }
}

async fn lock_customer_payment(
    conn: &mut PgConnection,
    payment_id: Uuid,
) -> Result<CustomerPayment, ServiceError> {
    let sql = format!(
        "SELECT {} FROM customer_payments WHERE payment_id = $1 FOR UPDATE",
        CUSTOMER_PAYMENT_COLUMNS
    );
    sqlx::query_as::<_, CustomerPayment>(&sql)
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error(
            DocumentKind::CustomerPayment,
            payment_id,
            "Failed to lock payment",
        ))?
        .ok_or_else(|| ServiceError::NotFound(format!("customer payment {}", payment_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_receipts_post_as_credits() {
        assert_eq!(
            entry_for_payment(PaymentType::Payment, dec!(25000)),
            (EntryType::Credit, dec!(25000))
        );
    }

    #[test]
    fn test_credit_notes_post_as_debits_of_their_magnitude() {
        assert_eq!(
            entry_for_payment(PaymentType::CreditNote, dec!(-50000)),
            (EntryType::Debit, dec!(50000))
        );
    }
}
