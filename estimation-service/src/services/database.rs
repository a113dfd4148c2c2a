//! Database service for estimation-service.

use crate::error::{db_error, ServiceError};
use crate::models::{CategoryRateConfig, DocumentKind, RateCard};
use crate::services::metrics::DB_QUERY_DURATION;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "estimation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

/// Load the tax rate and category list of a project, categories in display order.
#[instrument(skip(conn), fields(project_id = %project_id))]
pub async fn load_rate_card(
    conn: &mut PgConnection,
    project_id: Uuid,
) -> Result<RateCard, ServiceError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["load_rate_card"])
        .start_timer();
    let kind = DocumentKind::Estimation;

    let tax_percentage: Option<Decimal> =
        sqlx::query_scalar("SELECT tax_percentage FROM projects WHERE project_id = $1")
            .bind(project_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error(kind, project_id, "Failed to load project"))?;

    let tax_percentage = tax_percentage
        .ok_or_else(|| ServiceError::NotFound(format!("project {}", project_id)))?;

    let categories = sqlx::query_as::<_, CategoryRateConfig>(
        r#"
        SELECT category_id, category_name, service_charge_percentage,
               max_item_discount_percentage, max_service_charge_discount_percentage,
               billed_via_service_charge_only, sort_order
        FROM category_rates
        WHERE project_id = $1
        ORDER BY sort_order, category_id
        "#,
    )
    .bind(project_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error(kind, project_id, "Failed to load category rates"))?;

    timer.observe_duration();

    Ok(RateCard {
        tax_percentage,
        categories,
    })
}
