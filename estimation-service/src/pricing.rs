//! Line pricing cascade and document aggregation.
//!
//! Everything here is pure. The same functions back validation, persistence and
//! any read path that needs totals, so derived amounts can never drift from
//! their inputs.
//!
//! Order of operations for one line:
//!
//! 1. `subtotal = quantity * unit_price`
//! 2. item discount on the subtotal
//! 3. service charge on the *discounted* subtotal
//! 4. service-charge discount on the gross service charge
//! 5. taxable base: discounted subtotal plus net service charge, or only the net
//!    service charge when the category is billed via service charge only
//! 6. tax on the taxable base
//! 7. `line_total = taxable + tax`
//!
//! Inputs are first brought to the scale their columns store (quantities and
//! dimensions 6 places, prices 2, percentages 4), so re-pricing a stored row
//! reproduces its stored amounts exactly.

use crate::models::{CategoryRateConfig, EstimationItemInput, PurchaseRequestItemInput, RateCard};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const QUANTITY_SCALE: u32 = 6;
pub const MONEY_SCALE: u32 = 2;
pub const PERCENT_SCALE: u32 = 4;

/// Units whose quantity is derived from width and height.
const AREA_UNITS: &[&str] = &["sqft", "sq.ft", "sft", "sqm", "sq.m"];

/// Raw numeric inputs of one line. Absent values price as zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineInputs {
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

impl LineInputs {
    /// Inputs for an estimation line, with the category's service charge and the
    /// project's tax rate standing in for absent percentages.
    pub fn for_estimation(
        input: &EstimationItemInput,
        category: &CategoryRateConfig,
        rates: &RateCard,
    ) -> Self {
        Self {
            unit: input.unit.clone(),
            quantity: input.quantity,
            width: input.width,
            height: input.height,
            unit_price: input.unit_price,
            item_discount_percentage: input.item_discount_percentage,
            service_charge_percentage: input
                .service_charge_percentage
                .or(Some(category.service_charge_percentage)),
            service_charge_discount_percentage: input.service_charge_discount_percentage,
            tax_percentage: input.tax_percentage.or(Some(rates.tax_percentage)),
        }
    }

    /// Inputs for a vendor-facing purchase request line. No service charge applies.
    pub fn for_purchase(input: &PurchaseRequestItemInput, rates: &RateCard) -> Self {
        Self {
            unit: input.unit.clone(),
            quantity: input.quantity,
            width: input.width,
            height: input.height,
            unit_price: input.unit_price,
            item_discount_percentage: input.item_discount_percentage,
            service_charge_percentage: None,
            service_charge_discount_percentage: None,
            tax_percentage: input.tax_percentage.or(Some(rates.tax_percentage)),
        }
    }
}

/// Every amount derived from a line's inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAmounts {
    /// Quantity actually priced (area units use width x height).
    pub quantity: Decimal,
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
}

/// Why a line could not be priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("{0} must not be negative")]
    Negative(&'static str),

    #[error("{0} is too large to store")]
    OutOfRange(&'static str),
}

/// Discount caps a line went over. Never blocks pricing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountFlags {
    pub item_discount_exceeded: bool,
    pub service_charge_discount_exceeded: bool,
}

impl DiscountFlags {
    pub fn any(&self) -> bool {
        self.item_discount_exceeded || self.service_charge_discount_exceeded
    }
}

fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a quantity, dimension, linked quantity or weightage to its stored scale.
pub fn scale_quantity(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(QUANTITY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

fn scale_percent(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PERCENT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Exclusive upper bound of a NUMERIC(18, 2) column.
fn money_limit() -> Decimal {
    Decimal::new(10_i64.pow(16), 0)
}

/// Exclusive upper bound of a NUMERIC(18, 6) column.
fn quantity_limit() -> Decimal {
    Decimal::new(10_i64.pow(12), 0)
}

/// Exclusive upper bound of a NUMERIC(7, 4) column.
fn percent_limit() -> Decimal {
    Decimal::new(1000, 0)
}

/// True when `value` fits a NUMERIC(18, 2) money column.
pub fn fits_money(value: Decimal) -> bool {
    value.abs() < money_limit()
}

fn bounded(value: Decimal, limit: Decimal, field: &'static str) -> Result<Decimal, PricingError> {
    if value.abs() < limit {
        Ok(value)
    } else {
        Err(PricingError::OutOfRange(field))
    }
}

fn add(a: Decimal, b: Decimal, field: &'static str) -> Result<Decimal, PricingError> {
    a.checked_add(b)
        .map(money)
        .ok_or(PricingError::OutOfRange(field))
        .and_then(|v| bounded(v, money_limit(), field))
}

fn sub(a: Decimal, b: Decimal, field: &'static str) -> Result<Decimal, PricingError> {
    a.checked_sub(b)
        .map(money)
        .ok_or(PricingError::OutOfRange(field))
        .and_then(|v| bounded(v, money_limit(), field))
}

fn percent_of(
    base: Decimal,
    percentage: Decimal,
    field: &'static str,
) -> Result<Decimal, PricingError> {
    base.checked_mul(percentage)
        .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
        .map(money)
        .ok_or(PricingError::OutOfRange(field))
        .and_then(|v| bounded(v, money_limit(), field))
}

/// True for units priced by area.
pub fn is_area_unit(unit: &str) -> bool {
    let unit = unit.trim().to_ascii_lowercase();
    AREA_UNITS.contains(&unit.as_str())
}

/// Quantity to price: width x height for area units when both are present,
/// otherwise the entered quantity. Always at the stored quantity scale.
pub fn effective_quantity(
    unit: &str,
    quantity: Option<Decimal>,
    width: Option<Decimal>,
    height: Option<Decimal>,
) -> Result<Decimal, PricingError> {
    let raw = match (width, height) {
        (Some(w), Some(h)) if is_area_unit(unit) => w
            .checked_mul(h)
            .ok_or(PricingError::OutOfRange("quantity"))?,
        _ => quantity.unwrap_or_default(),
    };
    bounded(scale_quantity(raw), quantity_limit(), "quantity")
}

fn scaled_dimension(
    value: Option<Decimal>,
    field: &'static str,
) -> Result<Option<Decimal>, PricingError> {
    match value {
        Some(v) if v < Decimal::ZERO => Err(PricingError::Negative(field)),
        Some(v) => bounded(scale_quantity(v), quantity_limit(), field).map(Some),
        None => Ok(None),
    }
}

fn scaled_percent(
    value: Option<Decimal>,
    field: &'static str,
) -> Result<Option<Decimal>, PricingError> {
    value
        .map(|v| bounded(scale_percent(v), percent_limit(), field))
        .transpose()
}

impl LineInputs {
    /// The same inputs rounded to their stored scales and checked against
    /// column bounds.
    pub fn to_storage_scale(&self) -> Result<Self, PricingError> {
        let unit_price = match self.unit_price {
            Some(v) if v < Decimal::ZERO => return Err(PricingError::Negative("unit price")),
            Some(v) => Some(bounded(money(v), money_limit(), "unit price")?),
            None => None,
        };

        Ok(Self {
            unit: self.unit.clone(),
            quantity: scaled_dimension(self.quantity, "quantity")?,
            width: scaled_dimension(self.width, "width")?,
            height: scaled_dimension(self.height, "height")?,
            unit_price,
            item_discount_percentage: scaled_percent(
                self.item_discount_percentage,
                "item discount",
            )?,
            service_charge_percentage: scaled_percent(
                self.service_charge_percentage,
                "service charge",
            )?,
            service_charge_discount_percentage: scaled_percent(
                self.service_charge_discount_percentage,
                "service charge discount",
            )?,
            tax_percentage: scaled_percent(self.tax_percentage, "tax")?,
        })
    }
}

/// Run the pricing cascade for one line.
///
/// Never panics: negative or oversized inputs, and amounts that would not fit
/// their columns, come back as a [`PricingError`].
pub fn compute_line_totals(
    inputs: &LineInputs,
    category: &CategoryRateConfig,
) -> Result<DerivedAmounts, PricingError> {
    let inputs = inputs.to_storage_scale()?;
    let quantity = effective_quantity(&inputs.unit, inputs.quantity, inputs.width, inputs.height)?;
    let unit_price = inputs.unit_price.unwrap_or_default();
    let item_discount_percentage = inputs.item_discount_percentage.unwrap_or_default();
    let service_charge_percentage = inputs.service_charge_percentage.unwrap_or_default();
    let service_charge_discount_percentage =
        inputs.service_charge_discount_percentage.unwrap_or_default();
    let tax_percentage = inputs.tax_percentage.unwrap_or_default();

    let subtotal = quantity
        .checked_mul(unit_price)
        .map(money)
        .ok_or(PricingError::OutOfRange("subtotal"))
        .and_then(|v| bounded(v, money_limit(), "subtotal"))?;
    let item_discount_amount = percent_of(subtotal, item_discount_percentage, "item discount")?;
    let discounted_subtotal = sub(subtotal, item_discount_amount, "discounted subtotal")?;

    let service_charge_gross =
        percent_of(discounted_subtotal, service_charge_percentage, "service charge")?;
    let service_charge_discount_amount = percent_of(
        service_charge_gross,
        service_charge_discount_percentage,
        "service charge discount",
    )?;
    let service_charge_net = sub(
        service_charge_gross,
        service_charge_discount_amount,
        "service charge",
    )?;

    let taxable_amount = if category.billed_via_service_charge_only {
        service_charge_net
    } else {
        add(discounted_subtotal, service_charge_net, "taxable amount")?
    };
    let tax_amount = percent_of(taxable_amount, tax_percentage, "tax")?;
    let line_total = add(taxable_amount, tax_amount, "line total")?;

    Ok(DerivedAmounts {
        quantity,
        unit_price,
        item_discount_percentage,
        service_charge_percentage,
        service_charge_discount_percentage,
        tax_percentage,
        subtotal,
        item_discount_amount,
        discounted_subtotal,
        service_charge_gross,
        service_charge_discount_amount,
        service_charge_net,
        taxable_amount,
        tax_amount,
        line_total,
    })
}

/// Compare a line's discounts against its category caps.
pub fn discount_flags(inputs: &LineInputs, category: &CategoryRateConfig) -> DiscountFlags {
    DiscountFlags {
        item_discount_exceeded: inputs.item_discount_percentage.unwrap_or_default()
            > category.max_item_discount_percentage,
        service_charge_discount_exceeded: inputs
            .service_charge_discount_percentage
            .unwrap_or_default()
            > category.max_service_charge_discount_percentage,
    }
}

/// Per-category sums of the derived fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub category_id: String,
    pub category_name: String,
    pub billed_via_service_charge_only: bool,
    pub sort_order: i32,
    pub item_count: i32,
    pub subtotal: Decimal,
    pub item_discount: Decimal,
    pub discounted_subtotal: Decimal,
    pub service_charge_gross: Decimal,
    pub service_charge_discount: Decimal,
    pub service_charge_net: Decimal,
    pub taxable_amount: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

impl CategoryTotals {
    fn add(&mut self, amounts: &DerivedAmounts) {
        self.item_count += 1;
        self.subtotal += amounts.subtotal;
        self.item_discount += amounts.item_discount_amount;
        self.discounted_subtotal += amounts.discounted_subtotal;
        self.service_charge_gross += amounts.service_charge_gross;
        self.service_charge_discount += amounts.service_charge_discount_amount;
        self.service_charge_net += amounts.service_charge_net;
        self.taxable_amount += amounts.taxable_amount;
        self.tax_amount += amounts.tax_amount;
        self.total += amounts.line_total;
    }
}

/// Document-level totals persisted on the header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTotals {
    /// Raw subtotal of billable categories.
    pub items_value: Decimal,
    pub item_discount: Decimal,
    pub service_charge: Decimal,
    pub service_charge_discount: Decimal,
    pub discount: Decimal,
    pub taxable_value: Decimal,
    pub tax_amount: Decimal,
    pub final_value: Decimal,
    /// Raw subtotal of categories the customer pays vendors for directly.
    /// Informational only; excluded from `final_value`.
    pub direct_billed_value: Decimal,
    pub categories: Vec<CategoryTotals>,
}

impl DocumentTotals {
    pub fn category_breakdown(&self) -> serde_json::Value {
        serde_json::to_value(&self.categories).unwrap_or(serde_json::Value::Null)
    }
}

/// Sum derived amounts per category and overall.
///
/// Categories missing from `categories` are grouped under their id and billed
/// normally. Output categories follow the configured sort order.
pub fn aggregate<'a, I>(lines: I, categories: &[CategoryRateConfig]) -> DocumentTotals
where
    I: IntoIterator<Item = (&'a str, &'a DerivedAmounts)>,
{
    let mut by_category: Vec<CategoryTotals> = Vec::new();

    for (category_id, amounts) in lines {
        let idx = match by_category.iter().position(|c| c.category_id == category_id) {
            Some(idx) => idx,
            None => {
                let config = categories.iter().find(|c| c.category_id == category_id);
                by_category.push(CategoryTotals {
                    category_id: category_id.to_string(),
                    category_name: config
                        .map(|c| c.category_name.clone())
                        .unwrap_or_else(|| category_id.to_string()),
                    billed_via_service_charge_only: config
                        .map(|c| c.billed_via_service_charge_only)
                        .unwrap_or(false),
                    sort_order: config.map(|c| c.sort_order).unwrap_or(i32::MAX),
                    ..Default::default()
                });
                by_category.len() - 1
            }
        };
        by_category[idx].add(amounts);
    }

    by_category.sort_by(|a, b| {
        a.sort_order
            .cmp(&b.sort_order)
            .then_with(|| a.category_id.cmp(&b.category_id))
    });

    let mut totals = DocumentTotals::default();
    for category in &by_category {
        if category.billed_via_service_charge_only {
            totals.direct_billed_value += category.subtotal;
        } else {
            totals.items_value += category.subtotal;
            totals.item_discount += category.item_discount;
        }
        totals.service_charge += category.service_charge_net;
        totals.service_charge_discount += category.service_charge_discount;
        totals.taxable_value += category.taxable_amount;
        totals.tax_amount += category.tax_amount;
        totals.final_value += category.total;
    }
    totals.discount = totals.item_discount + totals.service_charge_discount;
    totals.categories = by_category;

    totals
}
