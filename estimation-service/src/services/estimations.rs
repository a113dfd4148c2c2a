//! Estimation workflow: create, revise, browse and restore versions.

use crate::error::{db_error, ServiceError, Violation, ViolationKind};
use crate::models::{
    ApprovalStatus, ChangeType, DocumentKind, Estimation, EstimationItem, EstimationItemInput,
    OverpaymentStatus, RateCard, StableId, VersionRecord,
};
use crate::pricing::{
    aggregate, compute_line_totals, discount_flags, fits_money, scale_quantity, DerivedAmounts,
    DiscountFlags, DocumentTotals, LineInputs,
};
use crate::services::allocation::{check_estimation_revision, load_snapshot};
use crate::services::database::load_rate_card;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::overpayment::{check_overpayment, next_status, Overpayment};
use crate::services::versioning::{
    self, Archiver, Audit, CurrentRow, DocumentTables, ProposedRow, Provenance, Revision,
    VersionedDocument,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnection, PgPool};
use std::collections::HashSet;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const ESTIMATION_COLUMNS: &str = "estimation_id, project_id, version, status, items_value, \
     item_discount, service_charge, service_charge_discount, discount, taxable_value, tax_amount, \
     final_value, direct_billed_value, category_breakdown, requires_approval, approval_status, \
     has_overpayment, overpayment_amount, overpayment_status, created_utc, created_by, \
     updated_utc, updated_by";

/// A proposed estimation line after pricing.
#[derive(Debug, Clone)]
pub struct EstimationLine {
    pub stable_item_id: StableId,
    pub input: EstimationItemInput,
    pub amounts: DerivedAmounts,
    pub flags: DiscountFlags,
}

impl CurrentRow for EstimationItem {
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

impl ProposedRow<EstimationItem> for EstimationLine {
    fn stable_id(&self) -> StableId {
        self.stable_item_id
    }

    fn matches(&self, current: &EstimationItem) -> bool {
        let a = &self.amounts;
        self.input.category == current.category
            && self.input.room_name == current.room_name
            && self.input.item_name == current.item_name
            && self.input.unit == current.unit
            && self.input.width == current.width
            && self.input.height == current.height
            && a.quantity == current.quantity
            && a.unit_price == current.unit_price
            && a.item_discount_percentage == current.item_discount_percentage
            && a.service_charge_percentage == current.service_charge_percentage
            && a.service_charge_discount_percentage == current.service_charge_discount_percentage
            && a.tax_percentage == current.tax_percentage
    }
}

/// Price proposed inputs against a rate card, issuing stable ids to new lines.
///
/// Inputs are kept at the scale their columns store, so the persisted inputs
/// always re-derive the persisted amounts.
pub fn price_estimation_items(
    inputs: &[EstimationItemInput],
    rates: &RateCard,
) -> Result<Vec<EstimationLine>, Vec<Violation>> {
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

        let Some(category) = rates.category(&input.category) else {
            violations.push(Violation::for_item(
                ViolationKind::UnknownCategory,
                stable_item_id,
                format!("'{}' has unknown category '{}'", input.item_name, input.category),
            ));
            continue;
        };

        let line_inputs = LineInputs::for_estimation(input, category, rates);
        let amounts = match compute_line_totals(&line_inputs, category) {
            Ok(amounts) => amounts,
            Err(err) => {
                violations.push(Violation::from_pricing(stable_item_id, &input.item_name, err));
                continue;
            }
        };

        let mut input = input.clone();
        input.width = input.width.map(scale_quantity);
        input.height = input.height.map(scale_quantity);
        lines.push(EstimationLine {
            stable_item_id,
            input,
            amounts,
            flags: discount_flags(&line_inputs, category),
        });
    }

    if violations.is_empty() {
        let totals = aggregate(
            lines.iter().map(|l| (l.input.category.as_str(), &l.amounts)),
            &rates.categories,
        );
        if !totals_fit(&totals) {
            violations.push(Violation::new(
                ViolationKind::InvalidAmount,
                "estimation total is too large to store",
            ));
        }
    }

    if violations.is_empty() {
        Ok(lines)
    } else {
        Err(violations)
    }
}

/// True when every header aggregate fits its money column.
pub fn totals_fit(totals: &DocumentTotals) -> bool {
    [
        totals.items_value,
        totals.item_discount,
        totals.service_charge,
        totals.service_charge_discount,
        totals.discount,
        totals.taxable_value,
        totals.tax_amount,
        totals.final_value,
        totals.direct_billed_value,
    ]
    .into_iter()
    .all(fits_money)
}

/// Versioned storage of estimations.
pub struct EstimationDocument {
    rates: RateCard,
}

impl EstimationDocument {
    pub fn new(rates: RateCard) -> Self {
        Self { rates }
    }
}

#[async_trait]
impl VersionedDocument for EstimationDocument {
    type Item = EstimationItem;
    type Line = EstimationLine;

    const TABLES: DocumentTables = DocumentTables {
        kind: DocumentKind::Estimation,
        header: "estimations",
        header_key: "estimation_id",
        items: "estimation_items",
        items_history: "estimation_items_history",
        item_columns: "estimation_item_id, estimation_id, stable_item_id, version, category, \
            room_name, item_name, unit, quantity, width, height, unit_price, \
            item_discount_percentage, service_charge_percentage, \
            service_charge_discount_percentage, tax_percentage, subtotal, item_discount_amount, \
            discounted_subtotal, service_charge_gross, service_charge_discount_amount, \
            service_charge_net, taxable_amount, tax_amount, line_total, created_utc, created_by, \
            updated_utc, updated_by",
        links: None,
        versions: "estimation_versions",
    };

    async fn insert_item(
        &self,
        conn: &mut PgConnection,
        document_id: Uuid,
        version: i32,
        line: &EstimationLine,
        audit: &Audit,
    ) -> Result<(), ServiceError> {
        let a = &line.amounts;
        sqlx::query(
            r#"
            INSERT INTO estimation_items (
                estimation_item_id, estimation_id, stable_item_id, version, category, room_name,
                item_name, unit, quantity, width, height, unit_price, item_discount_percentage,
                service_charge_percentage, service_charge_discount_percentage, tax_percentage,
                subtotal, item_discount_amount, discounted_subtotal, service_charge_gross,
                service_charge_discount_amount, service_charge_net, taxable_amount, tax_amount,
                line_total, created_utc, created_by, updated_utc, updated_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(document_id)
        .bind(line.stable_item_id)
        .bind(version)
        .bind(&line.input.category)
        .bind(&line.input.room_name)
        .bind(&line.input.item_name)
        .bind(&line.input.unit)
        .bind(a.quantity)
        .bind(line.input.width)
        .bind(line.input.height)
        .bind(a.unit_price)
        .bind(a.item_discount_percentage)
        .bind(a.service_charge_percentage)
        .bind(a.service_charge_discount_percentage)
        .bind(a.tax_percentage)
        .bind(a.subtotal)
        .bind(a.item_discount_amount)
        .bind(a.discounted_subtotal)
        .bind(a.service_charge_gross)
        .bind(a.service_charge_discount_amount)
        .bind(a.service_charge_net)
        .bind(a.taxable_amount)
        .bind(a.tax_amount)
        .bind(a.line_total)
        .bind(audit.created_utc)
        .bind(audit.created_by)
        .bind(audit.updated_utc)
        .bind(audit.updated_by)
        .execute(&mut *conn)
        .await
        .map_err(db_error(
            DocumentKind::Estimation,
            document_id,
            "Failed to insert estimation item",
        ))?;
        Ok(())
    }

    async fn write_totals(
        &self,
        conn: &mut PgConnection,
        document_id: Uuid,
        lines: &[EstimationLine],
    ) -> Result<(), ServiceError> {
        let totals = aggregate(
            lines.iter().map(|l| (l.input.category.as_str(), &l.amounts)),
            &self.rates.categories,
        );
        let requires_approval = lines.iter().any(|l| l.flags.any());
        let approval_status = if requires_approval {
            ApprovalStatus::Pending
        } else {
            ApprovalStatus::Approved
        };

        sqlx::query(
            r#"
            UPDATE estimations
            SET items_value = $2, item_discount = $3, service_charge = $4,
                service_charge_discount = $5, discount = $6, taxable_value = $7, tax_amount = $8,
                final_value = $9, direct_billed_value = $10, category_breakdown = $11,
                requires_approval = $12, approval_status = $13
            WHERE estimation_id = $1
            "#,
        )
        .bind(document_id)
        .bind(totals.items_value)
        .bind(totals.item_discount)
        .bind(totals.service_charge)
        .bind(totals.service_charge_discount)
        .bind(totals.discount)
        .bind(totals.taxable_value)
        .bind(totals.tax_amount)
        .bind(totals.final_value)
        .bind(totals.direct_billed_value)
        .bind(totals.category_breakdown())
        .bind(requires_approval)
        .bind(approval_status.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_error(
            DocumentKind::Estimation,
            document_id,
            "Failed to write estimation totals",
        ))?;
        Ok(())
    }
}

/// Request to replace an estimation's items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveEstimation {
    pub estimation_id: Uuid,
    pub items: Vec<EstimationItemInput>,
    /// Version the caller edited; a mismatch is a conflict.
    pub expected_version: Option<i32>,
    /// Proceed even if the new total is below approved collections.
    pub confirm_overpayment: bool,
    pub change_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedEstimation {
    pub estimation: Estimation,
    pub items_added: usize,
    pub items_edited: usize,
    pub items_deleted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    Saved(SavedEstimation),
    /// Nothing was written; resubmit with `confirm_overpayment` to proceed.
    OverpaymentWarning(Overpayment),
}

#[derive(Clone)]
pub struct EstimationService {
    pool: PgPool,
    archiver: Archiver,
}

impl EstimationService {
    pub fn new(pool: PgPool, archiver: Archiver) -> Self {
        Self { pool, archiver }
    }

    /// Create the project's estimation as version 1.
    #[instrument(skip(self, items), fields(project_id = %project_id, items = items.len()))]
    pub async fn create_estimation(
        &self,
        project_id: Uuid,
        items: Vec<EstimationItemInput>,
        actor: Uuid,
    ) -> Result<Estimation, ServiceError> {
        let kind = DocumentKind::Estimation;
        let rates = self.rate_card(project_id).await?;
        let lines = price_estimation_items(&items, &rates).map_err(ServiceError::invalid)?;

        let estimation_id = Uuid::new_v4();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, estimation_id, "Failed to begin transaction"))?;

        sqlx::query(
            r#"
            INSERT INTO estimations (estimation_id, project_id, version, created_by, updated_by)
            VALUES ($1, $2, 0, $3, $3)
            "#,
        )
        .bind(estimation_id)
        .bind(project_id)
        .bind(actor)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                ServiceError::conflict(kind, project_id, "project already has an estimation")
            }
            e => db_error(kind, estimation_id, "Failed to create estimation")(e),
        })?;

        let doc = EstimationDocument::new(rates);
        let locked = self
            .archiver
            .lock(&mut tx, &EstimationDocument::TABLES, estimation_id, Some(0))
            .await?;
        self.archiver
            .revise(
                &mut tx,
                &doc,
                Revision {
                    locked,
                    lines: &lines,
                    actor,
                    change_type: ChangeType::Created,
                    change_summary: None,
                },
            )
            .await?;

        let estimation = fetch_estimation(&mut tx, estimation_id).await?;
        versioning::commit(tx, kind, estimation_id).await?;

        info!(estimation_id = %estimation_id, final_value = %estimation.final_value, "Estimation created");
        Ok(estimation)
    }

    /// Replace an estimation's items with a new version.
    ///
    /// If the new total would fall below approved collections and the caller
    /// has not confirmed, nothing is written and a warning is returned.
    pub async fn save_estimation(
        &self,
        request: SaveEstimation,
        actor: Uuid,
    ) -> Result<SaveOutcome, ServiceError> {
        self.revise_estimation(request, actor, ChangeType::Edited)
            .await
    }

    /// Make the items of an earlier version current again, as a new version.
    #[instrument(skip(self), fields(estimation_id = %estimation_id, version = version))]
    pub async fn restore_estimation_version(
        &self,
        estimation_id: Uuid,
        version: i32,
        expected_version: Option<i32>,
        confirm_overpayment: bool,
        actor: Uuid,
    ) -> Result<SaveOutcome, ServiceError> {
        let items = self.items_at_version(estimation_id, version).await?;
        let request = SaveEstimation {
            estimation_id,
            items: items.iter().map(EstimationItemInput::from).collect(),
            expected_version,
            confirm_overpayment,
            change_summary: Some(format!("Restored from version {}", version)),
        };
        self.revise_estimation(request, actor, ChangeType::Restored)
            .await
    }

    #[instrument(
        skip(self, request),
        fields(estimation_id = %request.estimation_id, items = request.items.len(), change_type = %change_type)
    )]
    async fn revise_estimation(
        &self,
        request: SaveEstimation,
        actor: Uuid,
        change_type: ChangeType,
    ) -> Result<SaveOutcome, ServiceError> {
        let kind = DocumentKind::Estimation;
        let estimation_id = request.estimation_id;

        // Shape and pricing problems are reported before any transaction opens.
        let project_id = self.project_of(estimation_id).await?;
        let rates = self.rate_card(project_id).await?;
        let lines = price_estimation_items(&request.items, &rates).map_err(ServiceError::invalid)?;
        let candidate = aggregate(
            lines.iter().map(|l| (l.input.category.as_str(), &l.amounts)),
            &rates.categories,
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error(kind, estimation_id, "Failed to begin transaction"))?;

        let locked = self
            .archiver
            .lock(
                &mut tx,
                &EstimationDocument::TABLES,
                estimation_id,
                request.expected_version,
            )
            .await?;

        let overpayment =
            check_overpayment(&mut tx, project_id, candidate.final_value, "estimation").await?;
        if overpayment.has_overpayment && !request.confirm_overpayment {
            warn!(amount = %overpayment.amount, "Overpayment requires confirmation");
            // Dropping the transaction rolls back the lock; nothing was written.
            return Ok(SaveOutcome::OverpaymentWarning(overpayment));
        }

        let snapshot = load_snapshot(&mut tx, project_id, &[]).await?;
        let quantities: Vec<(StableId, Decimal)> = lines
            .iter()
            .map(|l| (l.stable_item_id, l.amounts.quantity))
            .collect();
        let violations = check_estimation_revision(&quantities, &snapshot);
        if !violations.is_empty() {
            return Err(ServiceError::invalid(violations));
        }

        let doc = EstimationDocument::new(rates);
        let outcome = self
            .archiver
            .revise(
                &mut tx,
                &doc,
                Revision {
                    locked,
                    lines: &lines,
                    actor,
                    change_type,
                    change_summary: request.change_summary,
                },
            )
            .await?;

        let current_status: String =
            sqlx::query_scalar("SELECT overpayment_status FROM estimations WHERE estimation_id = $1")
                .bind(estimation_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error(kind, estimation_id, "Failed to read overpayment status"))?;
        let status = next_status(
            OverpaymentStatus::from_string(&current_status).unwrap_or(OverpaymentStatus::None),
            &overpayment,
        );
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
        .execute(&mut *tx)
        .await
        .map_err(db_error(kind, estimation_id, "Failed to record overpayment"))?;

        let estimation = fetch_estimation(&mut tx, estimation_id).await?;
        versioning::commit(tx, kind, estimation_id).await?;

        info!(
            version = outcome.version,
            final_value = %estimation.final_value,
            has_overpayment = overpayment.has_overpayment,
            "Estimation saved"
        );

        Ok(SaveOutcome::Saved(SavedEstimation {
            estimation,
            items_added: outcome.plan.added.len(),
            items_edited: outcome.plan.edited.len(),
            items_deleted: outcome.plan.deleted.len(),
        }))
    }

    #[instrument(skip(self), fields(estimation_id = %estimation_id))]
    pub async fn get_estimation(&self, estimation_id: Uuid) -> Result<Estimation, ServiceError> {
        let mut conn = self.conn(estimation_id).await?;
        fetch_estimation(&mut conn, estimation_id).await
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn estimation_for_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<Estimation>, ServiceError> {
        let sql = format!(
            "SELECT {} FROM estimations WHERE project_id = $1",
            ESTIMATION_COLUMNS
        );
        sqlx::query_as::<_, Estimation>(&sql)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error(DocumentKind::Estimation, project_id, "Failed to load estimation"))
    }

    pub async fn current_items(
        &self,
        estimation_id: Uuid,
    ) -> Result<Vec<EstimationItem>, ServiceError> {
        let mut conn = self.conn(estimation_id).await?;
        versioning::current_items::<EstimationDocument>(&mut conn, estimation_id).await
    }

    pub async fn list_versions(
        &self,
        estimation_id: Uuid,
    ) -> Result<Vec<VersionRecord>, ServiceError> {
        let mut conn = self.conn(estimation_id).await?;
        versioning::version_records(&mut conn, &EstimationDocument::TABLES, estimation_id).await
    }

    /// Items of any version, current or archived.
    pub async fn items_at_version(
        &self,
        estimation_id: Uuid,
        version: i32,
    ) -> Result<Vec<EstimationItem>, ServiceError> {
        let mut conn = self.conn(estimation_id).await?;
        let current = fetch_estimation(&mut conn, estimation_id).await?;
        versioning::items_at_version::<EstimationDocument>(
            &mut conn,
            estimation_id,
            version,
            current.version,
        )
        .await
    }

    async fn conn(
        &self,
        estimation_id: Uuid,
    ) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, ServiceError> {
        self.pool.acquire().await.map_err(db_error(
            DocumentKind::Estimation,
            estimation_id,
            "Failed to acquire connection",
        ))
    }

    async fn project_of(&self, estimation_id: Uuid) -> Result<Uuid, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["estimation_project"])
            .start_timer();
        let project_id: Option<Uuid> =
            sqlx::query_scalar("SELECT project_id FROM estimations WHERE estimation_id = $1")
                .bind(estimation_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error(
                    DocumentKind::Estimation,
                    estimation_id,
                    "Failed to load estimation",
                ))?;
        timer.observe_duration();
        project_id.ok_or_else(|| ServiceError::NotFound(format!("estimation {}", estimation_id)))
    }

    async fn rate_card(&self, project_id: Uuid) -> Result<RateCard, ServiceError> {
        let mut conn = self.conn(project_id).await?;
        load_rate_card(&mut conn, project_id).await
    }
}

/// Load an estimation header.
pub async fn fetch_estimation(
    conn: &mut PgConnection,
    estimation_id: Uuid,
) -> Result<Estimation, ServiceError> {
    let sql = format!(
        "SELECT {} FROM estimations WHERE estimation_id = $1",
        ESTIMATION_COLUMNS
    );
    sqlx::query_as::<_, Estimation>(&sql)
        .bind(estimation_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error(DocumentKind::Estimation, estimation_id, "Failed to load estimation"))?
        .ok_or_else(|| ServiceError::NotFound(format!("estimation {}", estimation_id)))
}
