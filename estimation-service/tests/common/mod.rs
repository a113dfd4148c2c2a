//! Common test utilities for estimation-service integration tests.
//!
//! Tests connect to `TEST_DATABASE_URL`; each test seeds its own project so
//! runs do not interfere with one another. Without the variable every test
//! returns early.

#![allow(dead_code)]

use estimation_service::config::{DatabaseConfig, EstimationConfig, RevisionConfig};
use estimation_service::models::{
    EstimationItemInput, FulfillmentMode, LifecycleStatus, ProposedEstimationLink,
    PurchaseRequestItemInput, StableId,
};
use estimation_service::services::estimations::SaveOutcome;
use estimation_service::services::SavedEstimation;
use estimation_service::startup::{AppState, Application};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use service_core::config::Config as CommonConfig;
use sqlx::PgPool;
use std::sync::Once;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,estimation_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn test_config(database_url: String) -> EstimationConfig {
    EstimationConfig {
        common: CommonConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        service_name: "estimation-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: database_url,
            max_connections: 5,
            min_connections: 1,
        },
        revision: RevisionConfig {
            lock_timeout_ms: 2000,
        },
    }
}

/// Test application wrapper.
pub struct TestApp {
    pub state: AppState,
    pub pool: PgPool,
    pub project_id: Uuid,
    pub actor: Uuid,
    pub http_port: u16,
}

/// Build the application, start its HTTP listener and seed a fresh project.
///
/// Returns `None` when `TEST_DATABASE_URL` is not set.
pub async fn spawn_app() -> Option<TestApp> {
    init_tracing();

    let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
        tracing::warn!("TEST_DATABASE_URL is not set, skipping database test");
        return None;
    };

    let app = Application::build(test_config(database_url))
        .await
        .expect("Failed to build application");

    let http_port = app.http_port();
    let state = app.state().clone();
    let pool = app.db().pool().clone();

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let project_id = seed_project(&pool).await;

    Some(TestApp {
        state,
        pool,
        project_id,
        actor: Uuid::new_v4(),
        http_port,
    })
}

/// A project at 18% tax with three categories: civil (10% service charge,
/// caps 10%/5%), furniture (12%, caps 15%/10%) and appliances (billed via
/// service charge only).
pub async fn seed_project(pool: &PgPool) -> Uuid {
    let project_id = Uuid::new_v4();

    sqlx::query("INSERT INTO projects (project_id, name, tax_percentage) VALUES ($1, $2, 18)")
        .bind(project_id)
        .bind(format!("Test project {}", project_id))
        .execute(pool)
        .await
        .expect("Failed to seed project");

    let categories = [
        ("civil", "Civil", dec!(10), dec!(10), dec!(5), false, 1),
        ("furniture", "Furniture", dec!(12), dec!(15), dec!(10), false, 2),
        ("appliances", "Appliances", dec!(8), dec!(0), dec!(0), true, 3),
    ];
    for (id, name, sc, max_item, max_sc, direct, sort) in categories {
        sqlx::query(
            r#"
            INSERT INTO category_rates (
                project_id, category_id, category_name, service_charge_percentage,
                max_item_discount_percentage, max_service_charge_discount_percentage,
                billed_via_service_charge_only, sort_order
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(project_id)
        .bind(id)
        .bind(name)
        .bind(sc)
        .bind(max_item)
        .bind(max_sc)
        .bind(direct)
        .bind(sort)
        .execute(pool)
        .await
        .expect("Failed to seed category rate");
    }

    project_id
}

/// A new estimation line.
pub fn estimation_item(
    category: &str,
    name: &str,
    quantity: Decimal,
    unit_price: Decimal,
) -> EstimationItemInput {
    EstimationItemInput {
        category: category.to_string(),
        item_name: name.to_string(),
        unit: "nos".to_string(),
        quantity: Some(quantity),
        unit_price: Some(unit_price),
        ..Default::default()
    }
}

/// A pending purchase line fully covering `linked_qty` of one estimation item.
pub fn full_line(estimation_item: StableId, linked_qty: Decimal) -> PurchaseRequestItemInput {
    purchase_line(FulfillmentMode::Full, estimation_item, linked_qty, Decimal::ONE)
}

/// A pending component line supplying `weightage` of one estimation item.
pub fn component_line(
    estimation_item: StableId,
    linked_qty: Decimal,
    weightage: Decimal,
) -> PurchaseRequestItemInput {
    purchase_line(FulfillmentMode::Component, estimation_item, linked_qty, weightage)
}

fn purchase_line(
    mode: FulfillmentMode,
    estimation_item: StableId,
    linked_qty: Decimal,
    weightage: Decimal,
) -> PurchaseRequestItemInput {
    PurchaseRequestItemInput {
        stable_item_id: None,
        item_name: format!("{} supply", mode),
        category: Some("civil".to_string()),
        room_name: None,
        unit: "nos".to_string(),
        quantity: Some(linked_qty),
        width: None,
        height: None,
        unit_price: Some(dec!(100)),
        item_discount_percentage: None,
        tax_percentage: None,
        fulfillment_mode: mode,
        lifecycle_status: LifecycleStatus::Pending,
        links: vec![ProposedEstimationLink {
            stable_estimation_item_id: estimation_item,
            linked_qty,
            weightage,
            notes: None,
        }],
    }
}

/// Unwrap a save that is expected to go through.
pub fn saved(outcome: SaveOutcome) -> SavedEstimation {
    match outcome {
        SaveOutcome::Saved(saved) => saved,
        SaveOutcome::OverpaymentWarning(o) => panic!("unexpected overpayment warning: {:?}", o),
    }
}

pub async fn count_rows(pool: &PgPool, sql: &str, id: Uuid) -> i64 {
    sqlx::query_scalar(sql)
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("Failed to count rows")
}
