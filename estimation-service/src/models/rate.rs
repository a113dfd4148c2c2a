//! Per-project rate card (read-only configuration).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Pricing rules for one category of work.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct CategoryRateConfig {
    pub category_id: String,
    pub category_name: String,
    pub service_charge_percentage: Decimal,
    pub max_item_discount_percentage: Decimal,
    pub max_service_charge_discount_percentage: Decimal,
    /// Customer pays the vendor directly; only the service charge is invoiced.
    pub billed_via_service_charge_only: bool,
    pub sort_order: i32,
}

impl CategoryRateConfig {
    /// Rate rules for vendor-facing purchase request lines: no service charge,
    /// no caps, always billed in full.
    pub fn vendor_purchase() -> Self {
        Self {
            category_id: "vendor_purchase".to_string(),
            category_name: "Vendor purchase".to_string(),
            service_charge_percentage: Decimal::ZERO,
            max_item_discount_percentage: Decimal::ONE_HUNDRED,
            max_service_charge_discount_percentage: Decimal::ONE_HUNDRED,
            billed_via_service_charge_only: false,
            sort_order: 0,
        }
    }
}

/// Everything pricing needs to know about a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateCard {
    pub tax_percentage: Decimal,
    /// Ordered by `sort_order`.
    pub categories: Vec<CategoryRateConfig>,
}

impl RateCard {
    pub fn category(&self, category_id: &str) -> Option<&CategoryRateConfig> {
        self.categories
            .iter()
            .find(|c| c.category_id == category_id)
    }
}
