//! Purchase request workflow.
//!
//! Every write that changes allocations first locks the project's estimation
//! header, then the purchase request headers it touches in vendor order. The
//! estimation lock serializes allocation checks across purchase requests; the
//! fixed order keeps concurrent writers from deadlocking.

use crate::error::{db_error, ServiceError, Violation, ViolationKind};
use crate::models::{
    AllocationLink, CategoryRateConfig, ChangeType, DocumentKind, FulfillmentMode,
    LifecycleStatus, PrStatus, ProposedEstimationLink, PurchaseRequest, PurchaseRequestItem,
    PurchaseRequestItemInput, RateCard, StableId, VersionRecord,
};
use crate::pricing::{aggregate, compute_line_totals, scale_quantity, DerivedAmounts, LineInputs};
use crate::services::allocation::{
    self, check_allocations, load_snapshot, AvailabilityLine, ProposedAllocation,
};
use crate::services::database::load_rate_card;
use crate::services::estimations::{totals_fit, EstimationDocument};
use crate::services::versioning::{
    self, Archiver, Audit, CurrentRow, DocumentTables, LinkTables, LockedDocument, ProposedRow,
    Provenance, Revision, VersionedDocument,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnection, PgPool};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, instrument};
use uuid::Uuid;

const PR_COLUMNS: &str = "purchase_request_id, project_id, vendor_id, estimation_id, pr_sequence, \
     pr_number, status, version, items_value, discount, tax_amount, final_value, \
     expected_delivery_date, created_utc, created_by, updated_utc, updated_by";

const LINK_COLUMNS: &str = "link_id, purchase_request_id, stable_item_id, \
     stable_estimation_item_id, version, fulfillment_mode, linked_qty, weightage, notes, created_utc";

/// A proposed purchase request line after pricing.
#[derive(Debug, Clone)]
pub struct PurchaseLine {
    pub stable_item_id: StableId,
    pub input: PurchaseRequestItemInput,
    pub amounts: DerivedAmounts,
}

impl CurrentRow for PurchaseRequestItem {
    fn stable_id(&self) -> StableId {
        self.stable_item_id
    }

    fn provenance(&self) -> Provenance {
        Provenance {
            created_utc: self.created_utc,
            created_by: self.created_by,
        }
    }
}

impl ProposedRow<PurchaseRequestItem> for PurchaseLine {
    fn stable_id(&self) -> StableId {
        self.stable_item_id
    }

    fn matches(&self, current: &PurchaseRequestItem) -> bool {
        let a = &self.amounts;
        self.input.item_name == current.item_name
            && self.input.category == current.category
            && self.input.room_name == current.room_name
            && self.input.unit == current.unit
            && self.input.width == current.width
            && self.input.height == current.height
            && self.input.fulfillment_mode.as_str() == current.fulfillment_mode
            && self.input.lifecycle_status.as_str() == current.lifecycle_status
            && a.quantity == current.quantity
            && a.unit_price == current.unit_price
            && a.item_discount_percentage == current.item_discount_percentage
            && a.tax_percentage == current.tax_percentage
    }
}

/// Price proposed purchase lines at vendor rates, issuing stable ids to new lines.
///
/// Dimensions and link quantities are kept at their stored scale.
pub fn price_purchase_items(
    inputs: &[PurchaseRequestItemInput],
    rates: &RateCard,
) -> Result<Vec<PurchaseLine>, Vec<Violation>> {
    let vendor = CategoryRateConfig::vendor_purchase();
    let mut violations = Vec::new();
    let mut lines = Vec::with_capacity(inputs.len());
    let mut seen = HashSet::with_capacity(inputs.len());

    for input in inputs {
        let stable_item_id = input.stable_item_id.unwrap_or_default();
        if !seen.insert(stable_item_id) {
            violations.push(Violation::for_item(
                ViolationKind::DuplicateStableId,
                stable_item_id,
                format!("'{}' reuses a stable id already in this revision", input.item_name),
            ));
            continue;
        }

        let amounts = match compute_line_totals(&LineInputs::for_purchase(input, rates), &vendor) {
            Ok(amounts) => amounts,
            Err(err) => {
                violations.push(Violation::from_pricing(stable_item_id, &input.item_name, err));
                continue;
            }
        };

        let mut input = input.clone();
        input.width = input.width.map(scale_quantity);
        input.height = input.height.map(scale_quantity);
        for link in &mut input.links {
            link.linked_qty = scale_quantity(link.linked_qty);
            link.weightage = scale_quantity(link.weightage);
        }
        lines.push(PurchaseLine {
            stable_item_id,
            input,
            amounts,
        });
    }

    if violations.is_empty() {
        let totals = aggregate(
            lines
                .iter()
                .filter(|l| l.input.lifecycle_status != LifecycleStatus::Cancelled)
                .map(|l| (vendor.category_id.as_str(), &l.amounts)),
            std::slice::from_ref(&vendor),
        );
        if !totals_fit(&totals) {
            violations.push(Violation::new(
                ViolationKind::InvalidAmount,
                "purchase request total is too large to store",
            ));
        }
    }

    if violations.is_empty() {
        Ok(lines)
    } else {
        Err(violations)
    }
}

/// Links compared without regard to the order they were listed in.
fn same_links(a: &[ProposedEstimationLink], b: &[ProposedEstimationLink]) -> bool {
    fn sorted(links: &[ProposedEstimationLink]) -> Vec<&ProposedEstimationLink> {
        let mut links: Vec<_> = links.iter().collect();
        links.sort_by(|x, y| {
            x.stable_estimation_item_id
                .cmp(&y.stable_estimation_item_id)
                .then_with(|| x.linked_qty.cmp(&y.linked_qty))
                .then_with(|| x.weightage.cmp(&y.weightage))
                .then_with(|| x.notes.cmp(&y.notes))
        });
        links
    }
    a.len() == b.len() && sorted(a) == sorted(b)
}

/// Rebuild the proposed shape of a persisted line and its links.
pub fn input_from_row(
    item: &PurchaseRequestItem,
    links: &[AllocationLink],
) -> PurchaseRequestItemInput {
    PurchaseRequestItemInput {
        stable_item_id: Some(item.stable_item_id),
        item_name: item.item_name.clone(),
        category: item.category.clone(),
        room_name: item.room_name.clone(),
        unit: item.unit.clone(),
        quantity: Some(item.quantity),
        width: item.width,
        height: item.height,
        unit_price: Some(item.unit_price),
        item_discount_percentage: Some(item.item_discount_percentage),
        tax_percentage: Some(item.tax_percentage),
        fulfillment_mode: item.parsed_mode().unwrap_or(FulfillmentMode::Full),
        lifecycle_status: item.parsed_lifecycle().unwrap_or(LifecycleStatus::Pending),
        links: links
            .iter()
            .filter(|l| l.stable_item_id == item.stable_item_id)
            .map(AllocationLink::as_proposed)
            .collect(),
    }
}

/// Non-pending items must come through a revision untouched, and a revision
/// cannot move an item out of `Pending` by itself.
pub fn check_immutable_items(
    current: &[PurchaseRequestItem],
    current_links: &[AllocationLink],
    proposed: &[PurchaseLine],
) -> Vec<Violation> {
    let proposed_by_id: HashMap<StableId, &PurchaseLine> =
        proposed.iter().map(|l| (l.stable_item_id, l)).collect();
    let current_by_id: HashMap<StableId, &PurchaseRequestItem> =
        current.iter().map(|c| (c.stable_item_id, c)).collect();
    let mut violations = Vec::new();

    for item in current {
        let lifecycle = item.parsed_lifecycle().unwrap_or(LifecycleStatus::Pending);
        if lifecycle.is_mutable() {
            continue;
        }
        let unchanged = proposed_by_id.get(&item.stable_item_id).is_some_and(|line| {
            line.matches(item)
                && same_links(&line.input.links, &input_from_row(item, current_links).links)
        });
        if !unchanged {
            violations.push(Violation::for_item(
                ViolationKind::ImmutableItem,
                item.stable_item_id,
                format!(
                    "'{}' is {} and cannot be edited or removed",
                    item.item_name, lifecycle
                ),
            ));
        }
    }

    for line in proposed {
        let was = current_by_id
            .get(&line.stable_item_id)
            .and_then(|c| c.parsed_lifecycle())
            .unwrap_or(LifecycleStatus::Pending);
        if was.is_mutable() && !line.input.lifecycle_status.is_mutable() {
            violations.push(Violation::for_item(
                ViolationKind::InvalidStatusTransition,
                line.stable_item_id,
                format!(
                    "'{}' cannot move to {} through an edit",
                    line.input.item_name, line.input.lifecycle_status
                ),
            ));
        }
    }

    violations
}

fn proposed_allocations(lines: &[PurchaseLine], vendor_id: Uuid) -> Vec<ProposedAllocation> {
    lines
        .iter()
        .filter(|l| l.input.lifecycle_status != LifecycleStatus::Cancelled)
        .flat_map(|l| ProposedAllocation::from_item(l.stable_item_id, &l.input, Some(vendor_id)))
        .collect()
}

/// Versioned storage of purchase requests.
pub struct PurchaseRequestDocument;

#[async_trait]
impl VersionedDocument for PurchaseRequestDocument {
    type Item = PurchaseRequestItem;
    type Line = PurchaseLine;

    const TABLES: DocumentTables = DocumentTables {
        kind: DocumentKind::PurchaseRequest,
        header: "purchase_requests",
        header_key: "purchase_request_id",
        items: "purchase_request_items",
        items_history: "purchase_request_items_history",
        item_columns: "purchase_request_item_id, purchase_request_id, stable_item_id, version, \
            item_name, category, room_name, unit, quantity, width, height, unit_price, \
            item_discount_percentage, tax_percentage, subtotal, item_discount_amount, \
            taxable_amount, tax_amount, line_total, fulfillment_mode, lifecycle_status, \
            created_utc, created_by, updated_utc, updated_by",
        links: Some(LinkTables {
            links: "purchase_request_estimation_links",
            history: "purchase_request_estimation_links_history",
            columns: LINK_COLUMNS,
        }),
        versions: "purchase_request_versions",
    };

    async fn insert_item(
        &self,
        conn: &mut PgConnection,
        document_id: Uuid,
        version: i32,
        line: &PurchaseLine,
        audit: &Audit,
    ) -> Result<(), ServiceError> {
        let a = &line.amounts;
        sqlx::query(
            r#"
            INSERT INTO purchase_request_items (
                purchase_request_item_id, purchase_request_id, stable_item_id, version, item_name,
                category, room_name, unit, quantity, width, height, unit_price,
                item_discount_percentage, tax_percentage, subtotal, item_discount_amount,
                taxable_amount, tax_amount, line_total, fulfillment_mode, lifecycle_status,
                created_utc, created_by, updated_utc, updated_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24, $25)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(document_id)
        .bind(line.stable_item_id)
        .bind(version)
        .bind(&line.input.item_name)
        .bind(&line.input.category)
        .bind(&line.input.room_name)
        .bind(&line.input.unit)
        .bind(a.quantity)
        .bind(line.input.width)
        .bind(line.input.height)
        .bind(a.unit_price)
        .bind(a.item_discount_percentage)
        .bind(a.tax_percentage)
        .bind(a.subtotal)
        .bind(a.item_discount_amount)
        .bind(a.taxable_amount)
        .bind(a.tax_amount)
        .bind(a.line_total)
        .bind(line.input.fulfillment_mode.as_str())
        .bind(line.input.lifecycle_status.as_str())
        .bind(audit.created_utc)
        .bind(audit.created_by)
        .bind(audit.updated_utc)
        .bind(audit.updated_by)
        .execute(&mut *conn)
        .await
        .map_err(db_error(
            DocumentKind::PurchaseRequest,
            document_id,
            "Failed to insert purchase request item",
        ))?;
        Ok(())
    }

    async fn insert_links(
        &self,
        conn: &mut PgConnection,
        document_id: Uuid,
        version: i32,
        lines: &[PurchaseLine],
    ) -> Result<(), ServiceError> {
        for line in lines {
            for link in &line.input.links {
                sqlx::query(
                    r#"
                    INSERT INTO purchase_request_estimation_links (
                        link_id, purchase_request_id, stable_item_id, stable_estimation_item_id,
                        version, fulfillment_mode, linked_qty, weightage, notes
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(document_id)
                .bind(line.stable_item_id)
                .bind(link.stable_estimation_item_id)
                .bind(version)
                .bind(line.input.fulfillment_mode.as_str())
                .bind(link.linked_qty)
                .bind(link.weightage)
                .bind(&link.notes)
                .execute(&mut *conn)
                .await
                .map_err(db_error(
                    DocumentKind::PurchaseRequest,
                    document_id,
                    "Failed to insert allocation link",
                ))?;
            }
        }
        Ok(())
    }

    async fn write_totals(
        &self,
        conn: &mut PgConnection,
        document_id: Uuid,
        lines: &[PurchaseLine],
    ) -> Result<(), ServiceError> {
        let vendor = CategoryRateConfig::vendor_purchase();
        let totals = aggregate(
            lines
                .iter()
                .filter(|l| l.input.lifecycle_status != LifecycleStatus::Cancelled)
                .map(|l| (vendor.category_id.as_str(), &l.amounts)),
            std::slice::from_ref(&vendor),
        );

        sqlx::query(
            r#"
            UPDATE purchase_requests
            SET items_value = $2, discount = $3, tax_amount = $4, final_value = $5
            WHERE purchase_request_id = $1
            "#,
        )
        .bind(document_id)
        .bind(totals.items_value)
        .bind(totals.discount)
        .bind(totals.tax_amount)
        .bind(totals.final_value)
        .execute(&mut *conn)
        .await
        .map_err(db_error(
            DocumentKind::PurchaseRequest,
            document_id,
            "Failed to write purchase request totals",
        ))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePurchaseRequest {
    pub project_id: Uuid,
    pub vendor_id: Uuid,
    pub items: Vec<PurchaseRequestItemInput>,
    pub expected_delivery_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisePurchaseRequest {
    pub purchase_request_id: Uuid,
    pub items: Vec<PurchaseRequestItemInput>,
    pub expected_version: Option<i32>,
    pub change_summary: Option<String>,
}

/// One line of a multi-vendor allocation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorLine {
    pub vendor_id: Uuid,
    pub item: PurchaseRequestItemInput,
}

/// Full, component and direct lines across vendors, saved as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub project_id: Uuid,
    pub lines: Vec<VendorLine>,
}

#[derive(Clone)]
pub struct PurchaseRequestService {
    pool: PgPool,
    archiver: Archiver,
}

impl PurchaseRequestService {
    pub fn new(pool: PgPool, archiver: Archiver) -> Self {
        Self { pool, archiver }
    }

    /// Create a vendor's draft purchase request as version 1.
    #[instrument(skip(self, request), fields(project_id = %request.project_id, vendor_id = %request.vendor_id))]
    pub async fn create_purchase_request(
        &self,
        request: CreatePurchaseRequest,
        actor: Uuid,
    ) -> Result<PurchaseRequest, ServiceError> {
        if request.items.is_empty() {
            return Err(ServiceError::invalid(vec![Violation::new(
                ViolationKind::EmptyDocument,
                "a purchase request needs at least one item",
            )]));
        }
        let rates = self.rate_card(request.project_id).await?;
        let lines = price_purchase_items(&request.items, &rates).map_err(ServiceError::invalid)?;
        let violations = check_immutable_items(&[], &[], &lines);
        if !violations.is_empty() {
            return Err(ServiceError::invalid(violations));
        }

        let kind = DocumentKind::PurchaseRequest;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, request.project_id, "Failed to begin transaction"))?;

        let estimation = self.lock_estimation(&mut tx, request.project_id).await?;

        let snapshot = load_snapshot(&mut tx, request.project_id, &[]).await?;
        let violations = check_allocations(&proposed_allocations(&lines, request.vendor_id), &snapshot);
        if !violations.is_empty() {
            return Err(ServiceError::invalid(violations));
        }

        let pr = self
            .insert_header(
                &mut tx,
                request.project_id,
                request.vendor_id,
                estimation.document_id,
                request.expected_delivery_date,
                actor,
            )
            .await?;
        self.revise_locked(
            &mut tx,
            pr.purchase_request_id,
            Some(0),
            &lines,
            actor,
            ChangeType::Created,
            None,
        )
        .await?;

        let pr = fetch_purchase_request(&mut tx, pr.purchase_request_id).await?;
        versioning::commit(tx, kind, pr.purchase_request_id).await?;

        info!(purchase_request_id = %pr.purchase_request_id, pr_number = %pr.pr_number, "Purchase request created");
        Ok(pr)
    }

    /// Replace a purchase request's items. Only pending items may change.
    #[instrument(skip(self, request), fields(purchase_request_id = %request.purchase_request_id))]
    pub async fn revise_purchase_request(
        &self,
        request: RevisePurchaseRequest,
        actor: Uuid,
    ) -> Result<PurchaseRequest, ServiceError> {
        let kind = DocumentKind::PurchaseRequest;
        let pr_id = request.purchase_request_id;
        let header = self.get_purchase_request(pr_id).await?;
        let rates = self.rate_card(header.project_id).await?;
        let lines = price_purchase_items(&request.items, &rates).map_err(ServiceError::invalid)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, pr_id, "Failed to begin transaction"))?;

        self.lock_estimation(&mut tx, header.project_id).await?;
        let locked = self
            .archiver
            .lock(&mut tx, &PurchaseRequestDocument::TABLES, pr_id, request.expected_version)
            .await?;
        let header = fetch_purchase_request(&mut tx, pr_id).await?;
        require_status(&header, &[PrStatus::Draft, PrStatus::Confirmed])?;

        let current = versioning::current_items::<PurchaseRequestDocument>(&mut tx, pr_id).await?;
        let current_links = fetch_links(&mut tx, pr_id).await?;
        let mut violations = check_immutable_items(&current, &current_links, &lines);

        let snapshot = load_snapshot(&mut tx, header.project_id, &[pr_id]).await?;
        violations.extend(check_allocations(
            &proposed_allocations(&lines, header.vendor_id),
            &snapshot,
        ));
        if !violations.is_empty() {
            return Err(ServiceError::invalid(violations));
        }

        self.archiver
            .revise(
                &mut tx,
                &PurchaseRequestDocument,
                Revision {
                    locked,
                    lines: &lines,
                    actor,
                    change_type: ChangeType::Edited,
                    change_summary: request.change_summary,
                },
            )
            .await?;

        let pr = fetch_purchase_request(&mut tx, pr_id).await?;
        versioning::commit(tx, kind, pr_id).await?;
        Ok(pr)
    }

    /// Confirm a draft: re-validate its allocations against every other live
    /// purchase request and move its pending items to `Confirmed`.
    #[instrument(skip(self), fields(purchase_request_id = %purchase_request_id))]
    pub async fn confirm_purchase_request(
        &self,
        purchase_request_id: Uuid,
        expected_version: Option<i32>,
        actor: Uuid,
    ) -> Result<PurchaseRequest, ServiceError> {
        self.transition(
            purchase_request_id,
            expected_version,
            actor,
            PrStatus::Confirmed,
        )
        .await
    }

    /// Cancel a purchase request. Its links stop counting toward allocation.
    #[instrument(skip(self), fields(purchase_request_id = %purchase_request_id))]
    pub async fn cancel_purchase_request(
        &self,
        purchase_request_id: Uuid,
        expected_version: Option<i32>,
        actor: Uuid,
    ) -> Result<PurchaseRequest, ServiceError> {
        self.transition(
            purchase_request_id,
            expected_version,
            actor,
            PrStatus::Cancelled,
        )
        .await
    }

    async fn transition(
        &self,
        pr_id: Uuid,
        expected_version: Option<i32>,
        actor: Uuid,
        target: PrStatus,
    ) -> Result<PurchaseRequest, ServiceError> {
        let kind = DocumentKind::PurchaseRequest;
        let header = self.get_purchase_request(pr_id).await?;
        let rates = self.rate_card(header.project_id).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, pr_id, "Failed to begin transaction"))?;

        self.lock_estimation(&mut tx, header.project_id).await?;
        let locked = self
            .archiver
            .lock(&mut tx, &PurchaseRequestDocument::TABLES, pr_id, expected_version)
            .await?;
        let header = fetch_purchase_request(&mut tx, pr_id).await?;

        let (allowed, change_type): (&[PrStatus], ChangeType) = match target {
            PrStatus::Confirmed => (&[PrStatus::Draft], ChangeType::Confirmed),
            PrStatus::Cancelled => (&[PrStatus::Draft, PrStatus::Confirmed], ChangeType::Cancelled),
            PrStatus::Draft => (&[], ChangeType::Edited),
        };
        require_status(&header, allowed)?;

        let current = versioning::current_items::<PurchaseRequestDocument>(&mut tx, pr_id).await?;
        let current_links = fetch_links(&mut tx, pr_id).await?;

        let mut violations = Vec::new();
        let inputs: Vec<PurchaseRequestItemInput> = current
            .iter()
            .map(|item| {
                let mut input = input_from_row(item, &current_links);
                match (target, input.lifecycle_status) {
                    (PrStatus::Confirmed, LifecycleStatus::Pending) => {
                        input.lifecycle_status = LifecycleStatus::Confirmed;
                    }
                    (PrStatus::Cancelled, LifecycleStatus::Received) => {
                        violations.push(Violation::for_item(
                            ViolationKind::InvalidStatusTransition,
                            item.stable_item_id,
                            format!("'{}' was already received", item.item_name),
                        ));
                    }
                    (PrStatus::Cancelled, _) => {
                        input.lifecycle_status = LifecycleStatus::Cancelled;
                    }
                    _ => {}
                }
                input
            })
            .collect();
        if !violations.is_empty() {
            return Err(ServiceError::invalid(violations));
        }

        let lines = price_purchase_items(&inputs, &rates).map_err(ServiceError::invalid)?;

        if target == PrStatus::Confirmed {
            let snapshot = load_snapshot(&mut tx, header.project_id, &[pr_id]).await?;
            let violations =
                check_allocations(&proposed_allocations(&lines, header.vendor_id), &snapshot);
            if !violations.is_empty() {
                return Err(ServiceError::invalid(violations));
            }
        }

        self.archiver
            .revise(
                &mut tx,
                &PurchaseRequestDocument,
                Revision {
                    locked,
                    lines: &lines,
                    actor,
                    change_type,
                    change_summary: None,
                },
            )
            .await?;

        sqlx::query("UPDATE purchase_requests SET status = $2 WHERE purchase_request_id = $1")
            .bind(pr_id)
            .bind(target.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error(kind, pr_id, "Failed to update purchase request status"))?;

        let pr = fetch_purchase_request(&mut tx, pr_id).await?;
        versioning::commit(tx, kind, pr_id).await?;

        info!(status = %target, version = pr.version, "Purchase request status changed");
        Ok(pr)
    }

    /// Save a multi-vendor allocation plan.
    ///
    /// Lines are grouped by vendor; each vendor's live draft is rewritten (or
    /// created). All links are validated together against one snapshot that
    /// excludes the drafts being rewritten.
    #[instrument(skip(self, plan), fields(project_id = %plan.project_id, lines = plan.lines.len()))]
    pub async fn allocate_estimation_items(
        &self,
        plan: AllocationPlan,
        actor: Uuid,
    ) -> Result<Vec<PurchaseRequest>, ServiceError> {
        let kind = DocumentKind::PurchaseRequest;
        let project_id = plan.project_id;
        if plan.lines.is_empty() {
            return Err(ServiceError::invalid(vec![Violation::new(
                ViolationKind::EmptyDocument,
                "allocation plan has no lines",
            )]));
        }

        let mut by_vendor: BTreeMap<Uuid, Vec<PurchaseRequestItemInput>> = BTreeMap::new();
        for line in plan.lines {
            by_vendor.entry(line.vendor_id).or_default().push(line.item);
        }

        let rates = self.rate_card(project_id).await?;
        let mut priced: BTreeMap<Uuid, Vec<PurchaseLine>> = BTreeMap::new();
        let mut violations = Vec::new();
        for (vendor_id, items) in &by_vendor {
            match price_purchase_items(items, &rates) {
                Ok(lines) => {
                    priced.insert(*vendor_id, lines);
                }
                Err(v) => violations.extend(v),
            }
        }
        if !violations.is_empty() {
            return Err(ServiceError::invalid(violations));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, project_id, "Failed to begin transaction"))?;

        let estimation = self.lock_estimation(&mut tx, project_id).await?;

        let mut drafts: BTreeMap<Uuid, LockedDocument> = BTreeMap::new();
        for vendor_id in priced.keys() {
            if let Some(pr_id) = find_live_draft(&mut tx, project_id, *vendor_id).await? {
                let locked = self
                    .archiver
                    .lock(&mut tx, &PurchaseRequestDocument::TABLES, pr_id, None)
                    .await?;
                drafts.insert(*vendor_id, locked);
            }
        }
        let excluded: Vec<Uuid> = drafts.values().map(|l| l.document_id).collect();

        let mut proposed = Vec::new();
        for (vendor_id, lines) in &priced {
            if let Some(locked) = drafts.get(vendor_id) {
                let current = versioning::current_items::<PurchaseRequestDocument>(
                    &mut tx,
                    locked.document_id,
                )
                .await?;
                let current_links = fetch_links(&mut tx, locked.document_id).await?;
                violations.extend(check_immutable_items(&current, &current_links, lines));
            } else {
                violations.extend(check_immutable_items(&[], &[], lines));
            }
            proposed.extend(proposed_allocations(lines, *vendor_id));
        }

        let snapshot = load_snapshot(&mut tx, project_id, &excluded).await?;
        violations.extend(check_allocations(&proposed, &snapshot));
        if !violations.is_empty() {
            return Err(ServiceError::invalid(violations));
        }

        let mut saved = Vec::with_capacity(priced.len());
        for (vendor_id, lines) in &priced {
            let pr_id = match drafts.get(vendor_id) {
                Some(locked) => {
                    self.archiver
                        .revise(
                            &mut tx,
                            &PurchaseRequestDocument,
                            Revision {
                                locked: *locked,
                                lines,
                                actor,
                                change_type: ChangeType::Edited,
                                change_summary: Some("Allocation plan saved".to_string()),
                            },
                        )
                        .await?;
                    locked.document_id
                }
                None => {
                    let pr = self
                        .insert_header(
                            &mut tx,
                            project_id,
                            *vendor_id,
                            estimation.document_id,
                            None,
                            actor,
                        )
                        .await?;
                    self.revise_locked(
                        &mut tx,
                        pr.purchase_request_id,
                        Some(0),
                        lines,
                        actor,
                        ChangeType::Created,
                        Some("Allocation plan saved".to_string()),
                    )
                    .await?;
                    pr.purchase_request_id
                }
            };
            saved.push(fetch_purchase_request(&mut tx, pr_id).await?);
        }

        versioning::commit(tx, kind, project_id).await?;

        info!(purchase_requests = saved.len(), "Allocation plan saved");
        Ok(saved)
    }

    /// Per estimation item: quantity, allocated, available.
    pub async fn availability(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<AvailabilityLine>, ServiceError> {
        let mut conn = self.conn(project_id).await?;
        allocation::availability(&mut conn, project_id).await
    }

    #[instrument(skip(self), fields(purchase_request_id = %purchase_request_id))]
    pub async fn get_purchase_request(
        &self,
        purchase_request_id: Uuid,
    ) -> Result<PurchaseRequest, ServiceError> {
        let mut conn = self.conn(purchase_request_id).await?;
        fetch_purchase_request(&mut conn, purchase_request_id).await
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn list_purchase_requests(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<PurchaseRequest>, ServiceError> {
        let sql = format!(
            "SELECT {} FROM purchase_requests WHERE project_id = $1 ORDER BY pr_sequence",
            PR_COLUMNS
        );
        sqlx::query_as::<_, PurchaseRequest>(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error(
                DocumentKind::PurchaseRequest,
                project_id,
                "Failed to list purchase requests",
            ))
    }

    pub async fn current_items(
        &self,
        purchase_request_id: Uuid,
    ) -> Result<Vec<PurchaseRequestItem>, ServiceError> {
        let mut conn = self.conn(purchase_request_id).await?;
        versioning::current_items::<PurchaseRequestDocument>(&mut conn, purchase_request_id).await
    }

    pub async fn current_links(
        &self,
        purchase_request_id: Uuid,
    ) -> Result<Vec<AllocationLink>, ServiceError> {
        let mut conn = self.conn(purchase_request_id).await?;
        fetch_links(&mut conn, purchase_request_id).await
    }

    pub async fn list_versions(
        &self,
        purchase_request_id: Uuid,
    ) -> Result<Vec<VersionRecord>, ServiceError> {
        let mut conn = self.conn(purchase_request_id).await?;
        versioning::version_records(
            &mut conn,
            &PurchaseRequestDocument::TABLES,
            purchase_request_id,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn revise_locked(
        &self,
        conn: &mut PgConnection,
        pr_id: Uuid,
        expected_version: Option<i32>,
        lines: &[PurchaseLine],
        actor: Uuid,
        change_type: ChangeType,
        change_summary: Option<String>,
    ) -> Result<(), ServiceError> {
        let locked = self
            .archiver
            .lock(&mut *conn, &PurchaseRequestDocument::TABLES, pr_id, expected_version)
            .await?;
        self.archiver
            .revise(
                &mut *conn,
                &PurchaseRequestDocument,
                Revision {
                    locked,
                    lines,
                    actor,
                    change_type,
                    change_summary,
                },
            )
            .await?;
        Ok(())
    }

    /// Insert an empty draft header at version 0 with the project's next number.
    async fn insert_header(
        &self,
        conn: &mut PgConnection,
        project_id: Uuid,
        vendor_id: Uuid,
        estimation_id: Uuid,
        expected_delivery_date: Option<NaiveDate>,
        actor: Uuid,
    ) -> Result<PurchaseRequest, ServiceError> {
        let kind = DocumentKind::PurchaseRequest;
        let pr_id = Uuid::new_v4();

        // Callers hold the estimation lock, which serializes numbering per project.
        let sequence: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(pr_sequence), 0) + 1 FROM purchase_requests WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error(kind, pr_id, "Failed to allocate purchase request number"))?;

        let sql = format!(
            r#"
            INSERT INTO purchase_requests (purchase_request_id, project_id, vendor_id, estimation_id, pr_sequence, pr_number, status, version, expected_delivery_date, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, 'draft', 0, $7, $8, $8)
            RETURNING {}
            "#,
            PR_COLUMNS
        );
        sqlx::query_as::<_, PurchaseRequest>(&sql)
            .bind(pr_id)
            .bind(project_id)
            .bind(vendor_id)
            .bind(estimation_id)
            .bind(sequence)
            .bind(PurchaseRequest::format_number(sequence))
            .bind(expected_delivery_date)
            .bind(actor)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    ServiceError::conflict(kind, vendor_id, "vendor already has a draft purchase request")
                }
                e => db_error(kind, pr_id, "Failed to create purchase request")(e),
            })
    }

    /// Lock the project's estimation header; all allocation writers take it first.
    async fn lock_estimation(
        &self,
        conn: &mut PgConnection,
        project_id: Uuid,
    ) -> Result<LockedDocument, ServiceError> {
        let estimation_id: Option<Uuid> =
            sqlx::query_scalar("SELECT estimation_id FROM estimations WHERE project_id = $1")
                .bind(project_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(db_error(
                    DocumentKind::Estimation,
                    project_id,
                    "Failed to find estimation",
                ))?;
        let estimation_id = estimation_id
            .ok_or_else(|| ServiceError::NotFound(format!("estimation for project {}", project_id)))?;
        self.archiver
            .lock(conn, &EstimationDocument::TABLES, estimation_id, None)
            .await
    }

    async fn conn(
        &self,
        id: Uuid,
    ) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, ServiceError> {
        self.pool.acquire().await.map_err(db_error(
            DocumentKind::PurchaseRequest,
            id,
            "Failed to acquire connection",
        ))
    }

    async fn rate_card(&self, project_id: Uuid) -> Result<RateCard, ServiceError> {
        let mut conn = self.conn(project_id).await?;
        load_rate_card(&mut conn, project_id).await
    }
}

fn require_status(pr: &PurchaseRequest, allowed: &[PrStatus]) -> Result<(), ServiceError> {
    match pr.parsed_status() {
        Some(status) if allowed.contains(&status) => Ok(()),
        _ => Err(ServiceError::invalid(vec![Violation::new(
            ViolationKind::InvalidStatusTransition,
            format!("{} is {}", pr.pr_number, pr.status),
        )])),
    }
}

/// Load a purchase request header.
pub async fn fetch_purchase_request(
    conn: &mut PgConnection,
    purchase_request_id: Uuid,
) -> Result<PurchaseRequest, ServiceError> {
    let sql = format!(
        "SELECT {} FROM purchase_requests WHERE purchase_request_id = $1",
        PR_COLUMNS
    );
    sqlx::query_as::<_, PurchaseRequest>(&sql)
        .bind(purchase_request_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error(
            DocumentKind::PurchaseRequest,
            purchase_request_id,
            "Failed to load purchase request",
        ))?
        .ok_or_else(|| ServiceError::NotFound(format!("purchase request {}", purchase_request_id)))
}

async fn fetch_links(
    conn: &mut PgConnection,
    purchase_request_id: Uuid,
) -> Result<Vec<AllocationLink>, ServiceError> {
    let sql = format!(
        "SELECT {} FROM purchase_request_estimation_links WHERE purchase_request_id = $1 \
         ORDER BY stable_item_id, stable_estimation_item_id",
        LINK_COLUMNS
    );
    sqlx::query_as::<_, AllocationLink>(&sql)
        .bind(purchase_request_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error(
            DocumentKind::PurchaseRequest,
            purchase_request_id,
            "Failed to load allocation links",
        ))
}

async fn find_live_draft(
    conn: &mut PgConnection,
    project_id: Uuid,
    vendor_id: Uuid,
) -> Result<Option<Uuid>, ServiceError> {
    sqlx::query_scalar(
        "SELECT purchase_request_id FROM purchase_requests \
         WHERE project_id = $1 AND vendor_id = $2 AND status = 'draft'",
    )
    .bind(project_id)
    .bind(vendor_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error(
        DocumentKind::PurchaseRequest,
        project_id,
        "Failed to find draft purchase request",
    ))
}
