//! Archive-then-replace revisions shared by estimations and purchase requests.
//!
//! A revision runs inside the caller's transaction:
//!
//! 1. the header row is locked (`FOR UPDATE`) and its version read,
//! 2. current items (and links) are copied into history and deleted,
//! 3. proposed lines are inserted as `version + 1`, carrying `created_*` audit
//!    fields forward for stable ids that were already current,
//! 4. links, header totals, header version and a version record are written.
//!
//! Nothing is visible until the caller commits, so readers see either the old
//! version or the new one.

use crate::error::{db_error, ServiceError, Violation, ViolationKind};
use crate::models::{ChangeType, DocumentKind, StableId, VersionRecord};
use crate::services::metrics::{record_revision, DB_QUERY_DURATION};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Link table pair owned by a document kind.
#[derive(Debug)]
pub struct LinkTables {
    pub links: &'static str,
    pub history: &'static str,
    /// Columns copied verbatim into history.
    pub columns: &'static str,
}

/// Storage layout of one versioned document kind.
#[derive(Debug)]
pub struct DocumentTables {
    pub kind: DocumentKind,
    pub header: &'static str,
    /// Primary key of the header; also the owner column on items and links.
    pub header_key: &'static str,
    pub items: &'static str,
    pub items_history: &'static str,
    /// Columns copied verbatim into history.
    pub item_columns: &'static str,
    pub links: Option<LinkTables>,
    pub versions: &'static str,
}

/// Creation provenance carried across revisions by stable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
}

/// Audit stamps for one inserted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Audit {
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
    pub updated_utc: DateTime<Utc>,
    pub updated_by: Uuid,
}

/// A persisted line item as loaded from the live table.
pub trait CurrentRow {
    fn stable_id(&self) -> StableId;
    fn provenance(&self) -> Provenance;
}

/// A priced line proposed for the next version.
pub trait ProposedRow<C> {
    fn stable_id(&self) -> StableId;

    /// True when persisting this line would leave `current` unchanged.
    fn matches(&self, current: &C) -> bool;
}

/// Outcome of comparing current rows against the proposed set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionPlan {
    pub added: Vec<StableId>,
    pub edited: Vec<StableId>,
    pub unchanged: Vec<StableId>,
    pub deleted: Vec<StableId>,
    provenance: HashMap<StableId, Provenance>,
}

impl RevisionPlan {
    pub fn total_items(&self) -> usize {
        self.added.len() + self.edited.len() + self.unchanged.len()
    }

    /// Audit fields for a proposed line: carried forward when the stable id was
    /// already current, otherwise stamped now by `actor`.
    pub fn audit_for(&self, id: StableId, actor: Uuid, now: DateTime<Utc>) -> Audit {
        let provenance = self.provenance.get(&id).copied().unwrap_or(Provenance {
            created_utc: now,
            created_by: actor,
        });
        Audit {
            created_utc: provenance.created_utc,
            created_by: provenance.created_by,
            updated_utc: now,
            updated_by: actor,
        }
    }
}

/// Classify proposed lines against current rows by stable id.
///
/// Fails when the proposal names the same stable id more than once.
pub fn plan_revision<C, P>(current: &[C], proposed: &[P]) -> Result<RevisionPlan, Vec<Violation>>
where
    C: CurrentRow,
    P: ProposedRow<C>,
{
    let by_id: HashMap<StableId, &C> = current.iter().map(|c| (c.stable_id(), c)).collect();
    let mut seen = HashSet::with_capacity(proposed.len());
    let mut violations = Vec::new();
    let mut plan = RevisionPlan::default();

    for line in proposed {
        let id = line.stable_id();
        if !seen.insert(id) {
            violations.push(Violation::for_item(
                ViolationKind::DuplicateStableId,
                id,
                "stable id appears more than once in the proposed items",
            ));
            continue;
        }
        match by_id.get(&id) {
            Some(existing) => {
                plan.provenance.insert(id, existing.provenance());
                if line.matches(existing) {
                    plan.unchanged.push(id);
                } else {
                    plan.edited.push(id);
                }
            }
            None => plan.added.push(id),
        }
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    plan.deleted = current
        .iter()
        .map(|c| c.stable_id())
        .filter(|id| !seen.contains(id))
        .collect();

    Ok(plan)
}

/// A document kind the archiver can revise.
#[async_trait]
pub trait VersionedDocument: Send + Sync {
    type Item: CurrentRow + for<'r> FromRow<'r, PgRow> + Send + Unpin;
    type Line: ProposedRow<Self::Item> + Send + Sync;

    const TABLES: DocumentTables;

    async fn insert_item(
        &self,
        conn: &mut PgConnection,
        document_id: Uuid,
        version: i32,
        line: &Self::Line,
        audit: &Audit,
    ) -> Result<(), ServiceError>;

    async fn insert_links(
        &self,
        _conn: &mut PgConnection,
        _document_id: Uuid,
        _version: i32,
        _lines: &[Self::Line],
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Recompute and persist header aggregates from the new lines.
    async fn write_totals(
        &self,
        conn: &mut PgConnection,
        document_id: Uuid,
        lines: &[Self::Line],
    ) -> Result<(), ServiceError>;
}

/// Seam between archive and re-insert. Production uses [`NoopHook`].
#[async_trait]
pub trait RevisionHook: Send + Sync {
    async fn after_archive(
        &self,
        _conn: &mut PgConnection,
        _kind: DocumentKind,
        _document_id: Uuid,
    ) -> Result<(), ServiceError> {
        Ok(())
    }
}

pub struct NoopHook;

impl RevisionHook for NoopHook {}

/// Proof that the caller's transaction holds the header row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockedDocument {
    pub kind: DocumentKind,
    pub document_id: Uuid,
    pub version: i32,
}

/// One revision request against a locked document.
pub struct Revision<'a, L> {
    pub locked: LockedDocument,
    pub lines: &'a [L],
    pub actor: Uuid,
    pub change_type: ChangeType,
    pub change_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionOutcome {
    pub document_id: Uuid,
    pub version: i32,
    pub plan: RevisionPlan,
}

/// Runs revisions for any [`VersionedDocument`].
#[derive(Clone)]
pub struct Archiver {
    lock_timeout_ms: u64,
    hook: Arc<dyn RevisionHook>,
}

impl Archiver {
    pub fn new(lock_timeout_ms: u64) -> Self {
        Self {
            lock_timeout_ms,
            hook: Arc::new(NoopHook),
        }
    }

    /// Install a hook that runs after the archive step.
    pub fn with_hook(mut self, hook: Arc<dyn RevisionHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Lock a document header for the rest of the transaction.
    ///
    /// Lock waits are bounded by the configured timeout and surface as a
    /// conflict. When `expected_version` is given it must equal the locked
    /// version, otherwise the caller worked from a stale read.
    #[instrument(skip(self, conn, tables), fields(kind = %tables.kind, document_id = %document_id))]
    pub async fn lock(
        &self,
        conn: &mut PgConnection,
        tables: &DocumentTables,
        document_id: Uuid,
        expected_version: Option<i32>,
    ) -> Result<LockedDocument, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_document"])
            .start_timer();

        // SET does not take bind parameters; the value is an integer we own.
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms))
            .execute(&mut *conn)
            .await
            .map_err(db_error(tables.kind, document_id, "Failed to set lock timeout"))?;

        let sql = format!(
            "SELECT version FROM {} WHERE {} = $1 FOR UPDATE",
            tables.header, tables.header_key
        );
        let version: Option<i32> = sqlx::query_scalar(&sql)
            .bind(document_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error(tables.kind, document_id, "Failed to lock document"))?;

        timer.observe_duration();

        let version = version.ok_or_else(|| {
            ServiceError::NotFound(format!("{} {} not found", tables.kind, document_id))
        })?;

        if let Some(expected) = expected_version {
            if expected != version {
                warn!(expected, actual = version, "Stale document version");
                record_revision(tables.kind.as_str(), "conflict");
                return Err(ServiceError::conflict(
                    tables.kind,
                    document_id,
                    format!("expected version {}, found {}", expected, version),
                ));
            }
        }

        Ok(LockedDocument {
            kind: tables.kind,
            document_id,
            version,
        })
    }

    /// Archive current items and replace them with `revision.lines` as the next version.
    #[instrument(
        skip(self, conn, doc, revision),
        fields(kind = %D::TABLES.kind, document_id = %revision.locked.document_id, from_version = revision.locked.version)
    )]
    pub async fn revise<D: VersionedDocument>(
        &self,
        conn: &mut PgConnection,
        doc: &D,
        revision: Revision<'_, D::Line>,
    ) -> Result<RevisionOutcome, ServiceError> {
        let tables = &D::TABLES;
        let LockedDocument {
            kind,
            document_id,
            version,
        } = revision.locked;
        let next_version = version + 1;
        let actor = revision.actor;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["revise_document"])
            .start_timer();

        let current: Vec<D::Item> = current_items::<D>(&mut *conn, document_id).await?;

        let plan = match plan_revision(&current, revision.lines) {
            Ok(plan) => plan,
            Err(violations) => {
                record_revision(kind.as_str(), "invalid");
                return Err(ServiceError::invalid(violations));
            }
        };

        let now = Utc::now();

        // Archive, then clear the live rows. Links first: they reference items
        // by stable id only, but are owned by the header.
        if let Some(links) = &tables.links {
            let sql = format!(
                "INSERT INTO {history} ({cols}, archived_utc, archived_by) \
                 SELECT {cols}, $2, $3 FROM {live} WHERE {key} = $1",
                history = links.history,
                cols = links.columns,
                live = links.links,
                key = tables.header_key,
            );
            sqlx::query(&sql)
                .bind(document_id)
                .bind(now)
                .bind(actor)
                .execute(&mut *conn)
                .await
                .map_err(db_error(kind, document_id, "Failed to archive links"))?;

            sqlx::query(&format!(
                "DELETE FROM {} WHERE {} = $1",
                links.links, tables.header_key
            ))
            .bind(document_id)
            .execute(&mut *conn)
            .await
            .map_err(db_error(kind, document_id, "Failed to clear links"))?;
        }

        let sql = format!(
            "INSERT INTO {history} ({cols}, archived_utc, archived_by) \
             SELECT {cols}, $2, $3 FROM {live} WHERE {key} = $1",
            history = tables.items_history,
            cols = tables.item_columns,
            live = tables.items,
            key = tables.header_key,
        );
        let archived = sqlx::query(&sql)
            .bind(document_id)
            .bind(now)
            .bind(actor)
            .execute(&mut *conn)
            .await
            .map_err(db_error(kind, document_id, "Failed to archive items"))?
            .rows_affected();

        sqlx::query(&format!(
            "DELETE FROM {} WHERE {} = $1",
            tables.items, tables.header_key
        ))
        .bind(document_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error(kind, document_id, "Failed to clear items"))?;

        self.hook.after_archive(&mut *conn, kind, document_id).await?;

        for line in revision.lines {
            let audit = plan.audit_for(line.stable_id(), actor, now);
            doc.insert_item(&mut *conn, document_id, next_version, line, &audit)
                .await?;
        }

        doc.insert_links(&mut *conn, document_id, next_version, revision.lines)
            .await?;
        doc.write_totals(&mut *conn, document_id, revision.lines)
            .await?;

        let sql = format!(
            "UPDATE {} SET version = $2, updated_utc = $3, updated_by = $4 WHERE {} = $1",
            tables.header, tables.header_key
        );
        sqlx::query(&sql)
            .bind(document_id)
            .bind(next_version)
            .bind(now)
            .bind(actor)
            .execute(&mut *conn)
            .await
            .map_err(db_error(kind, document_id, "Failed to bump version"))?;

        let sql = format!(
            "INSERT INTO {} ({}, version, change_type, items_added, items_edited, items_deleted, \
             total_items, change_summary, created_utc, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            tables.versions, tables.header_key
        );
        sqlx::query(&sql)
            .bind(document_id)
            .bind(next_version)
            .bind(revision.change_type.as_str())
            .bind(plan.added.len() as i32)
            .bind(plan.edited.len() as i32)
            .bind(plan.deleted.len() as i32)
            .bind(plan.total_items() as i32)
            .bind(&revision.change_summary)
            .bind(now)
            .bind(actor)
            .execute(&mut *conn)
            .await
            .map_err(db_error(kind, document_id, "Failed to record version"))?;

        timer.observe_duration();

        info!(
            version = next_version,
            archived,
            added = plan.added.len(),
            edited = plan.edited.len(),
            deleted = plan.deleted.len(),
            change_type = %revision.change_type,
            "Document revised"
        );

        Ok(RevisionOutcome {
            document_id,
            version: next_version,
            plan,
        })
    }
}

/// Commit a revision transaction and count the outcome.
pub async fn commit(
    tx: Transaction<'_, Postgres>,
    kind: DocumentKind,
    document_id: Uuid,
) -> Result<(), ServiceError> {
    match tx.commit().await {
        Ok(()) => {
            record_revision(kind.as_str(), "committed");
            Ok(())
        }
        Err(e) => {
            record_revision(kind.as_str(), "failed");
            Err(db_error(kind, document_id, "Failed to commit revision")(e))
        }
    }
}

/// Live items of a document, in insertion order of their stable ids.
pub async fn current_items<D: VersionedDocument>(
    conn: &mut PgConnection,
    document_id: Uuid,
) -> Result<Vec<D::Item>, ServiceError> {
    let tables = &D::TABLES;
    let sql = format!(
        "SELECT * FROM {} WHERE {} = $1 ORDER BY created_utc, stable_item_id",
        tables.items, tables.header_key
    );
    sqlx::query_as::<_, D::Item>(&sql)
        .bind(document_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error(tables.kind, document_id, "Failed to load current items"))
}

/// Items as they stood at `version`: live rows for the current version,
/// history rows otherwise.
pub async fn items_at_version<D: VersionedDocument>(
    conn: &mut PgConnection,
    document_id: Uuid,
    version: i32,
    current_version: i32,
) -> Result<Vec<D::Item>, ServiceError> {
    if version == current_version {
        return current_items::<D>(conn, document_id).await;
    }
    let tables = &D::TABLES;
    let sql = format!(
        "SELECT * FROM {} WHERE {} = $1 AND version = $2 ORDER BY created_utc, stable_item_id",
        tables.items_history, tables.header_key
    );
    let items = sqlx::query_as::<_, D::Item>(&sql)
        .bind(document_id)
        .bind(version)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error(tables.kind, document_id, "Failed to load item history"))?;

    if items.is_empty() && (version < 1 || version > current_version) {
        return Err(ServiceError::NotFound(format!(
            "{} {} has no version {}",
            tables.kind, document_id, version
        )));
    }
    Ok(items)
}

/// Version records of a document, oldest first.
pub async fn version_records(
    conn: &mut PgConnection,
    tables: &DocumentTables,
    document_id: Uuid,
) -> Result<Vec<VersionRecord>, ServiceError> {
    let sql = format!(
        "SELECT version, change_type, items_added, items_edited, items_deleted, total_items, \
         change_summary, created_utc, created_by FROM {} WHERE {} = $1 ORDER BY version ASC",
        tables.versions, tables.header_key
    );
    sqlx::query_as::<_, VersionRecord>(&sql)
        .bind(document_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error(tables.kind, document_id, "Failed to list versions"))
}
