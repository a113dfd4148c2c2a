//! Vendor purchase requests, their items and allocation links.

use super::StableId;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Purchase request header status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrStatus {
    Draft,
    Confirmed,
    Cancelled,
}

impl PrStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_string(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for PrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-item lifecycle. Only `Pending` items may be edited or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Pending,
    Confirmed,
    Received,
    Cancelled,
}

impl LifecycleStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Received => "received",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_string(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "received" => Some(Self::Received),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a purchase request item draws on the estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfillmentMode {
    /// One vendor supplies the whole linked quantity (weightage 1).
    Full,
    /// One of several weighted vendors supplying a fraction of one logical item.
    Component,
    /// Purchased outside the estimation; carries no links.
    Direct,
}

impl FulfillmentMode {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Component => "component",
            Self::Direct => "direct",
        }
    }

    pub fn from_string(value: &str) -> Option<Self> {
        match value {
            "full" => Some(Self::Full),
            "component" => Some(Self::Component),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

impl std::fmt::Display for FulfillmentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Purchase request header. One live draft per project and vendor.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub purchase_request_id: Uuid,
    pub project_id: Uuid,
    pub vendor_id: Uuid,
    pub estimation_id: Uuid,
    pub pr_sequence: i32,
    pub pr_number: String,
    pub status: String,
    pub version: i32,
    pub items_value: Decimal,
    pub discount: Decimal,
    pub tax_amount: Decimal,
    pub final_value: Decimal,
    pub expected_delivery_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
    pub updated_utc: DateTime<Utc>,
    pub updated_by: Uuid,
}

impl PurchaseRequest {
    pub fn parsed_status(&self) -> Option<PrStatus> {
        PrStatus::from_string(&self.status)
    }

    /// Human-facing number, sequential per project.
    pub fn format_number(sequence: i32) -> String {
        format!("PR-{:03}", sequence)
    }
}

/// Current (or archived) purchase request line.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PurchaseRequestItem {
    pub purchase_request_item_id: Uuid,
    pub purchase_request_id: Uuid,
    pub stable_item_id: StableId,
    pub version: i32,
    pub item_name: String,
    pub category: Option<String>,
    pub room_name: Option<String>,
    pub unit: String,
    pub quantity: Decimal,
    pub width: Option<Decimal>,
    pub height: Option<Decimal>,
    pub unit_price: Decimal,
    pub item_discount_percentage: Decimal,
    pub tax_percentage: Decimal,
    pub subtotal: Decimal,
    pub item_discount_amount: Decimal,
    pub taxable_amount: Decimal,
    pub tax_amount: Decimal,
    pub line_total: Decimal,
    pub fulfillment_mode: String,
    pub lifecycle_status: String,
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
    pub updated_utc: DateTime<Utc>,
    pub updated_by: Uuid,
}

impl PurchaseRequestItem {
    pub fn parsed_lifecycle(&self) -> Option<LifecycleStatus> {
        LifecycleStatus::from_string(&self.lifecycle_status)
    }

    pub fn parsed_mode(&self) -> Option<FulfillmentMode> {
        FulfillmentMode::from_string(&self.fulfillment_mode)
    }
}

/// Proposed link from a purchase request line back to one estimation line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEstimationLink {
    pub stable_estimation_item_id: StableId,
    pub linked_qty: Decimal,
    pub weightage: Decimal,
    pub notes: Option<String>,
}

/// Caller-supplied shape of one proposed purchase request line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseRequestItemInput {
    pub stable_item_id: Option<StableId>,
    pub item_name: String,
    pub category: Option<String>,
    pub room_name: Option<String>,
    pub unit: String,
    pub quantity: Option<Decimal>,
    pub width: Option<Decimal>,
    pub height: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub item_discount_percentage: Option<Decimal>,
    /// Defaults to the project's tax rate.
    pub tax_percentage: Option<Decimal>,
    pub fulfillment_mode: FulfillmentMode,
    /// Carried as-is for items that already left `Pending`.
    pub lifecycle_status: LifecycleStatus,
    pub links: Vec<ProposedEstimationLink>,
}

/// Join row from a purchase request line to an estimation line, keyed on stable ids.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AllocationLink {
    pub link_id: Uuid,
    pub purchase_request_id: Uuid,
    pub stable_item_id: StableId,
    pub stable_estimation_item_id: StableId,
    pub version: i32,
    pub fulfillment_mode: String,
    pub linked_qty: Decimal,
    pub weightage: Decimal,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl AllocationLink {
    pub fn as_proposed(&self) -> ProposedEstimationLink {
        ProposedEstimationLink {
            stable_estimation_item_id: self.stable_estimation_item_id,
            linked_qty: self.linked_qty,
            weightage: self.weightage,
            notes: self.notes.clone(),
        }
    }
}
