//! Quantity and weightage conservation between estimation items and
//! purchase request items.
//!
//! An allocation link consumes `linked_qty * weightage` of its estimation item.
//! Full links carry weightage 1. Component links split one logical item across
//! vendors and, per estimation item, their weightages must add up to 1.
//!
//! The snapshot must be read after the estimation header is locked so that two
//! concurrent allocations against the same item serialize.

use crate::error::{db_error, ServiceError, Violation, ViolationKind};
use crate::models::{DocumentKind, FulfillmentMode, PurchaseRequestItemInput, StableId};
use crate::services::metrics::DB_QUERY_DURATION;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;
use sqlx::FromRow;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Comparison tolerance for quantities and weightages (1e-6).
pub const TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// One proposed link, flattened with the purchase request line it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedAllocation {
    pub purchase_request_item: StableId,
    pub estimation_item: StableId,
    pub mode: FulfillmentMode,
    pub vendor_id: Option<Uuid>,
    pub unit_price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub linked_qty: Decimal,
    pub weightage: Decimal,
}

impl ProposedAllocation {
    /// Flatten every link of a proposed purchase request line.
    pub fn from_item(
        stable_item_id: StableId,
        item: &PurchaseRequestItemInput,
        vendor_id: Option<Uuid>,
    ) -> Vec<Self> {
        item.links
            .iter()
            .map(|link| Self {
                purchase_request_item: stable_item_id,
                estimation_item: link.stable_estimation_item_id,
                mode: item.fulfillment_mode,
                vendor_id,
                unit_price: item.unit_price,
                quantity: item.quantity,
                linked_qty: link.linked_qty,
                weightage: link.weightage,
            })
            .collect()
    }

    /// Estimation quantity this link consumes.
    pub fn consumed_qty(&self) -> Decimal {
        self.linked_qty * self.weightage
    }
}

/// Allocation state of one estimation item, excluding the purchase requests
/// being rewritten.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ItemAllocation {
    pub stable_item_id: StableId,
    pub item_name: String,
    pub unit: String,
    pub quantity: Decimal,
    /// Sum of `linked_qty * weightage` over live links.
    pub allocated_qty: Decimal,
    /// Sum of component weightage over live links.
    pub component_weightage: Decimal,
}

impl ItemAllocation {
    pub fn available_qty(&self) -> Decimal {
        self.quantity - self.allocated_qty
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllocationSnapshot {
    items: HashMap<StableId, ItemAllocation>,
}

impl AllocationSnapshot {
    pub fn new(items: Vec<ItemAllocation>) -> Self {
        Self {
            items: items.into_iter().map(|i| (i.stable_item_id, i)).collect(),
        }
    }

    pub fn get(&self, id: &StableId) -> Option<&ItemAllocation> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &ItemAllocation> {
        self.items.values()
    }
}

#[derive(Default)]
struct Proposed {
    consumed: Decimal,
    component_weightage: Decimal,
    has_components: bool,
}

/// Check proposed links against the snapshot. An empty result means valid.
pub fn check_allocations(
    proposed: &[ProposedAllocation],
    snapshot: &AllocationSnapshot,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    // BTreeMap keeps violation order stable for callers and tests.
    let mut per_item: BTreeMap<StableId, Proposed> = BTreeMap::new();

    for link in proposed {
        let pr_item = link.purchase_request_item;

        if link.mode == FulfillmentMode::Direct {
            violations.push(Violation::for_item(
                ViolationKind::DirectItemLinked,
                pr_item,
                "direct purchases cannot draw on estimation items",
            ));
            continue;
        }

        if link.weightage <= Decimal::ZERO || link.weightage > Decimal::ONE + TOLERANCE {
            violations.push(Violation::for_item(
                ViolationKind::WeightageOutOfRange,
                pr_item,
                format!("weightage {} must be in (0, 1]", link.weightage),
            ));
            continue;
        }

        if link.mode == FulfillmentMode::Full && (link.weightage - Decimal::ONE).abs() > TOLERANCE {
            violations.push(Violation::for_item(
                ViolationKind::WeightageOutOfRange,
                pr_item,
                format!("full fulfillment requires weightage 1, got {}", link.weightage),
            ));
            continue;
        }

        if link.linked_qty < Decimal::ZERO {
            violations.push(Violation::for_item(
                ViolationKind::InvalidQuantity,
                pr_item,
                format!("linked quantity {} is negative", link.linked_qty),
            ));
            continue;
        }

        if link.mode == FulfillmentMode::Component {
            let positive = |v: Option<Decimal>| v.is_some_and(|v| v > Decimal::ZERO);
            let mut missing = Vec::new();
            if link.vendor_id.is_none() {
                missing.push("vendor");
            }
            if !positive(link.unit_price) {
                missing.push("price");
            }
            if !positive(link.quantity) {
                missing.push("quantity");
            }
            if !missing.is_empty() {
                violations.push(Violation::for_item(
                    ViolationKind::IncompleteComponent,
                    pr_item,
                    format!("component is missing {}", missing.join(", ")),
                ));
            }
        }

        if snapshot.get(&link.estimation_item).is_none() {
            violations.push(Violation::for_item(
                ViolationKind::UnknownEstimationItem,
                link.estimation_item,
                "estimation item does not exist in the current estimation",
            ));
            continue;
        }

        let entry = per_item.entry(link.estimation_item).or_default();
        entry.consumed += link.consumed_qty();
        if link.mode == FulfillmentMode::Component {
            entry.component_weightage += link.weightage;
            entry.has_components = true;
        }
    }

    for (id, proposal) in &per_item {
        let Some(item) = snapshot.get(id) else {
            continue;
        };

        let total = item.allocated_qty + proposal.consumed;
        if total > item.quantity + TOLERANCE {
            violations.push(Violation::for_item(
                ViolationKind::QuantityExceeded,
                *id,
                format!(
                    "'{}': allocated {} + proposed {} = {} exceeds quantity {}",
                    item.item_name,
                    item.allocated_qty.normalize(),
                    proposal.consumed.normalize(),
                    total.normalize(),
                    item.quantity.normalize()
                ),
            ));
        }

        if proposal.has_components {
            let weightage = item.component_weightage + proposal.component_weightage;
            if (weightage - Decimal::ONE).abs() > TOLERANCE {
                violations.push(Violation::for_item(
                    ViolationKind::WeightageMismatch,
                    *id,
                    format!(
                        "'{}': component weightage sums to {}, expected 1",
                        item.item_name,
                        weightage.normalize()
                    ),
                ));
            }
        }
    }

    violations
}

/// Guard an estimation revision against stranding allocations: an allocated
/// item may not disappear or shrink below what is already allocated.
pub fn check_estimation_revision(
    proposed: &[(StableId, Decimal)],
    snapshot: &AllocationSnapshot,
) -> Vec<Violation> {
    let proposed: HashMap<StableId, Decimal> = proposed.iter().copied().collect();
    let mut allocated: Vec<&ItemAllocation> = snapshot
        .items()
        .filter(|i| i.allocated_qty > TOLERANCE)
        .collect();
    allocated.sort_by_key(|i| i.stable_item_id);

    let mut violations = Vec::new();
    for item in allocated {
        match proposed.get(&item.stable_item_id) {
            None => violations.push(Violation::for_item(
                ViolationKind::AllocatedItemRemoved,
                item.stable_item_id,
                format!(
                    "'{}' is allocated to purchase requests ({}) and cannot be removed",
                    item.item_name,
                    item.allocated_qty.normalize()
                ),
            )),
            Some(quantity) if item.allocated_qty > *quantity + TOLERANCE => {
                violations.push(Violation::for_item(
                    ViolationKind::QuantityExceeded,
                    item.stable_item_id,
                    format!(
                        "'{}': quantity {} is below the allocated {}",
                        item.item_name,
                        quantity.normalize(),
                        item.allocated_qty.normalize()
                    ),
                ))
            }
            Some(_) => {}
        }
    }
    violations
}

/// Load allocation totals for every current estimation item of a project,
/// ignoring cancelled purchase requests, cancelled items, and `exclude_prs`.
#[instrument(skip(conn, exclude_prs), fields(project_id = %project_id, excluded = exclude_prs.len()))]
pub async fn load_snapshot(
    conn: &mut PgConnection,
    project_id: Uuid,
    exclude_prs: &[Uuid],
) -> Result<AllocationSnapshot, ServiceError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["load_allocation_snapshot"])
        .start_timer();

    let items = sqlx::query_as::<_, ItemAllocation>(
        r#"
        SELECT ei.stable_item_id, ei.item_name, ei.unit, ei.quantity,
               COALESCE(SUM(l.linked_qty * l.weightage)
                        FILTER (WHERE pri.purchase_request_item_id IS NOT NULL), 0) AS allocated_qty,
               COALESCE(SUM(l.weightage)
                        FILTER (WHERE pri.purchase_request_item_id IS NOT NULL
                                  AND l.fulfillment_mode = 'component'), 0) AS component_weightage
        FROM estimations e
        JOIN estimation_items ei ON ei.estimation_id = e.estimation_id
        LEFT JOIN purchase_request_estimation_links l
               ON l.stable_estimation_item_id = ei.stable_item_id
        LEFT JOIN purchase_requests pr
               ON pr.purchase_request_id = l.purchase_request_id
              AND pr.status <> 'cancelled'
              AND NOT (pr.purchase_request_id = ANY($2))
        LEFT JOIN purchase_request_items pri
               ON pri.purchase_request_id = pr.purchase_request_id
              AND pri.stable_item_id = l.stable_item_id
              AND pri.lifecycle_status <> 'cancelled'
        WHERE e.project_id = $1
        GROUP BY ei.stable_item_id, ei.item_name, ei.unit, ei.quantity
        "#,
    )
    .bind(project_id)
    .bind(exclude_prs)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error(
        DocumentKind::Estimation,
        project_id,
        "Failed to load allocation snapshot",
    ))?;

    timer.observe_duration();
    debug!(items = items.len(), "Allocation snapshot loaded");

    Ok(AllocationSnapshot::new(items))
}

/// Validate proposed links against a fresh snapshot read on `conn`.
pub async fn validate_allocations(
    conn: &mut PgConnection,
    project_id: Uuid,
    proposed: &[ProposedAllocation],
    exclude_prs: &[Uuid],
) -> Result<Vec<Violation>, ServiceError> {
    let snapshot = load_snapshot(conn, project_id, exclude_prs).await?;
    Ok(check_allocations(proposed, &snapshot))
}

/// Availability of one estimation item for procurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityLine {
    pub stable_item_id: StableId,
    pub item_name: String,
    pub unit: String,
    pub quantity: Decimal,
    pub allocated_qty: Decimal,
    pub available_qty: Decimal,
    pub component_weightage: Decimal,
}

impl From<&ItemAllocation> for AvailabilityLine {
    fn from(item: &ItemAllocation) -> Self {
        Self {
            stable_item_id: item.stable_item_id,
            item_name: item.item_name.clone(),
            unit: item.unit.clone(),
            quantity: item.quantity,
            allocated_qty: item.allocated_qty,
            available_qty: item.available_qty().max(Decimal::ZERO),
            component_weightage: item.component_weightage,
        }
    }
}

/// Per-item availability across every live purchase request of a project.
pub async fn availability(
    conn: &mut PgConnection,
    project_id: Uuid,
) -> Result<Vec<AvailabilityLine>, ServiceError> {
    let snapshot = load_snapshot(conn, project_id, &[]).await?;
    let mut lines: Vec<AvailabilityLine> = snapshot.items().map(AvailabilityLine::from).collect();
    lines.sort_by(|a, b| {
        a.item_name
            .cmp(&b.item_name)
            .then_with(|| a.stable_item_id.cmp(&b.stable_item_id))
    });
    Ok(lines)
}
