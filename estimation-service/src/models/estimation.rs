//! Estimation header and line items.

use super::StableId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Discount approval state of an estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Pending,
}

impl ApprovalStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Pending => "pending",
        }
    }
}

/// Where an estimation stands with respect to collected payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverpaymentStatus {
    None,
    PendingApproval,
    Approved,
    Rejected,
}

impl OverpaymentStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_string(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "pending_approval" => Some(Self::PendingApproval),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for OverpaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Live estimation header. One per project.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Estimation {
    pub estimation_id: Uuid,
    pub project_id: Uuid,
    pub version: i32,
    pub status: String,
    pub items_value: Decimal,
    pub item_discount: Decimal,
    pub service_charge: Decimal,
    pub service_charge_discount: Decimal,
    pub discount: Decimal,
    pub taxable_value: Decimal,
    pub tax_amount: Decimal,
    pub final_value: Decimal,
    pub direct_billed_value: Decimal,
    pub category_breakdown: serde_json::Value,
    pub requires_approval: bool,
    pub approval_status: String,
    pub has_overpayment: bool,
    pub overpayment_amount: Decimal,
    pub overpayment_status: String,
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
    pub updated_utc: DateTime<Utc>,
    pub updated_by: Uuid,
}

impl Estimation {
    pub fn parsed_overpayment_status(&self) -> Option<OverpaymentStatus> {
        OverpaymentStatus::from_string(&self.overpayment_status)
    }
}

/// Current (or archived) estimation line item with its derived amounts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EstimationItem {
    pub estimation_item_id: Uuid,
    pub estimation_id: Uuid,
    pub stable_item_id: StableId,
    pub version: i32,
    pub category: String,
    pub room_name: Option<String>,
    pub item_name: String,
    pub unit: String,
    pub quantity: Decimal,
    pub width: Option<Decimal>,
    pub height: Option<Decimal>,
    pub unit_price: Decimal,
    pub item_discount_percentage: Decimal,
    pub service_charge_percentage: Decimal,
    pub service_charge_discount_percentage: Decimal,
    pub tax_percentage: Decimal,
    pub subtotal: Decimal,
    pub item_discount_amount: Decimal,
    pub discounted_subtotal: Decimal,
    pub service_charge_gross: Decimal,
    pub service_charge_discount_amount: Decimal,
    pub service_charge_net: Decimal,
    pub taxable_amount: Decimal,
    pub tax_amount: Decimal,
    pub line_total: Decimal,
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
    pub updated_utc: DateTime<Utc>,
    pub updated_by: Uuid,
}

/// Caller-supplied shape of one proposed estimation line.
///
/// Derived amounts are never accepted from callers. Absent percentages fall back
/// to the category's service charge and the project's tax rate, or zero for
/// discounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimationItemInput {
    /// `None` for a line that has never been saved.
    pub stable_item_id: Option<StableId>,
    pub category: String,
    pub room_name: Option<String>,
    pub item_name: String,
    pub unit: String,
    pub quantity: Option<Decimal>,
    pub width: Option<Decimal>,
    pub height: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub item_discount_percentage: Option<Decimal>,
    pub service_charge_percentage: Option<Decimal>,
    pub service_charge_discount_percentage: Option<Decimal>,
    pub tax_percentage: Option<Decimal>,
}

impl From<&EstimationItem> for EstimationItemInput {
    fn from(item: &EstimationItem) -> Self {
        Self {
            stable_item_id: Some(item.stable_item_id),
            category: item.category.clone(),
            room_name: item.room_name.clone(),
            item_name: item.item_name.clone(),
            unit: item.unit.clone(),
            quantity: Some(item.quantity),
            width: item.width,
            height: item.height,
            unit_price: Some(item.unit_price),
            item_discount_percentage: Some(item.item_discount_percentage),
            service_charge_percentage: Some(item.service_charge_percentage),
            service_charge_discount_percentage: Some(item.service_charge_discount_percentage),
            tax_percentage: Some(item.tax_percentage),
        }
    }
}
