//! Per-revision audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Why a document moved to a new version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Edited,
    Restored,
    Confirmed,
    Cancelled,
}

impl ChangeType {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Edited => "edited",
            Self::Restored => "restored",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_string(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "edited" => Some(Self::Edited),
            "restored" => Some(Self::Restored),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Informational summary of one revision. Not used to rebuild state.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: i32,
    pub change_type: String,
    pub items_added: i32,
    pub items_edited: i32,
    pub items_deleted: i32,
    pub total_items: i32,
    pub change_summary: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
}

/// Records that can be locked or conflicted on. Only estimations and purchase
/// requests are versioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Estimation,
    PurchaseRequest,
    CustomerPayment,
    VendorPayment,
    LedgerEntry,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Estimation => "estimation",
            Self::PurchaseRequest => "purchase_request",
            Self::CustomerPayment => "customer_payment",
            Self::VendorPayment => "vendor_payment",
            Self::LedgerEntry => "ledger_entry",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
