//! Customer receipts and vendor disbursements.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Payment,
    /// Refund owed to the customer; stored with a negative amount.
    CreditNote,
}

impl PaymentType {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::CreditNote => "credit_note",
        }
    }

    pub fn from_string(value: &str) -> Option<Self> {
        match value {
            "payment" => Some(Self::Payment),
            "credit_note" => Some(Self::CreditNote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
}

impl PaymentStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_string(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Money received from (or credited back to) the customer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CustomerPayment {
    pub payment_id: Uuid,
    pub project_id: Uuid,
    pub estimation_id: Option<Uuid>,
    pub payment_type: String,
    pub amount: Decimal,
    pub status: String,
    pub payment_date: NaiveDate,
    pub mode: String,
    pub reference_number: Option<String>,
    pub remarks: Option<String>,
    pub approved_by: Option<Uuid>,
    pub approved_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
}

impl CustomerPayment {
    pub fn parsed_status(&self) -> Option<PaymentStatus> {
        PaymentStatus::from_string(&self.status)
    }

    pub fn parsed_type(&self) -> Option<PaymentType> {
        PaymentType::from_string(&self.payment_type)
    }
}

/// Money paid out to a vendor. Posted to the ledger on creation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VendorPayment {
    pub payment_id: Uuid,
    pub project_id: Uuid,
    pub vendor_id: Uuid,
    pub purchase_request_id: Option<Uuid>,
    pub payment_stage: Option<String>,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub mode: String,
    pub reference_number: Option<String>,
    pub remarks: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
}

fn validate_positive_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_positive() && !amount.is_zero() {
        Ok(())
    } else {
        Err(ValidationError::new("amount_must_be_positive"))
    }
}

/// Input for recording a customer receipt or credit note.
///
/// `amount` is always the positive magnitude; credit notes are negated on insert.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RecordCustomerPayment {
    pub project_id: Uuid,
    pub payment_type: PaymentType,
    #[validate(custom(function = "validate_positive_amount"))]
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    #[validate(length(min = 1, max = 32, message = "Payment mode is required"))]
    pub mode: String,
    #[validate(length(max = 128))]
    pub reference_number: Option<String>,
    pub remarks: Option<String>,
}

/// Input for recording a vendor disbursement.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RecordVendorPayment {
    pub project_id: Uuid,
    pub vendor_id: Uuid,
    pub purchase_request_id: Option<Uuid>,
    #[validate(length(max = 64))]
    pub payment_stage: Option<String>,
    #[validate(custom(function = "validate_positive_amount"))]
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    #[validate(length(min = 1, max = 32, message = "Payment mode is required"))]
    pub mode: String,
    #[validate(length(max = 128))]
    pub reference_number: Option<String>,
    pub remarks: Option<String>,
}
