//! Integration tests for purchase request allocation against estimation items.

mod common;

use common::{component_line, estimation_item, full_line, saved, spawn_app, TestApp};
use estimation_service::error::{ServiceError, ViolationKind};
use estimation_service::models::{
    EstimationItemInput, FulfillmentMode, LifecycleStatus, PrStatus, StableId,
};
use estimation_service::services::{
    AllocationPlan, CreatePurchaseRequest, RevisePurchaseRequest, SaveEstimation, VendorLine,
};
use rust_decimal_macros::dec;
use uuid::Uuid;

/// Create an estimation with one civil item of quantity 100 and return its ids.
async fn estimation_with_item(app: &TestApp) -> (Uuid, StableId) {
    let estimation = app
        .state
        .estimations
        .create_estimation(
            app.project_id,
            vec![estimation_item("civil", "Flooring", dec!(100), dec!(90))],
            app.actor,
        )
        .await
        .unwrap();
    let items = app
        .state
        .estimations
        .current_items(estimation.estimation_id)
        .await
        .unwrap();
    (estimation.estimation_id, items[0].stable_item_id)
}

fn kinds(err: &ServiceError) -> Vec<ViolationKind> {
    err.violations().iter().map(|v| v.kind).collect()
}

#[tokio::test]
async fn full_allocations_cannot_exceed_estimation_quantity() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let (_, item) = estimation_with_item(&app).await;
    let prs = &app.state.purchase_requests;

    let first = prs
        .create_purchase_request(
            CreatePurchaseRequest {
                project_id: app.project_id,
                vendor_id: Uuid::new_v4(),
                items: vec![full_line(item, dec!(60))],
                expected_delivery_date: None,
            },
            app.actor,
        )
        .await
        .unwrap();
    assert_eq!(first.pr_number, "PR-001");
    assert_eq!(first.version, 1);

    let second = prs
        .create_purchase_request(
            CreatePurchaseRequest {
                project_id: app.project_id,
                vendor_id: Uuid::new_v4(),
                items: vec![full_line(item, dec!(50))],
                expected_delivery_date: None,
            },
            app.actor,
        )
        .await;
    let err = second.unwrap_err();
    assert_eq!(kinds(&err), vec![ViolationKind::QuantityExceeded]);

    let third = prs
        .create_purchase_request(
            CreatePurchaseRequest {
                project_id: app.project_id,
                vendor_id: Uuid::new_v4(),
                items: vec![full_line(item, dec!(40))],
                expected_delivery_date: None,
            },
            app.actor,
        )
        .await
        .unwrap();
    assert_eq!(third.pr_number, "PR-002");

    let availability = prs.availability(app.project_id).await.unwrap();
    assert_eq!(availability.len(), 1);
    assert_eq!(availability[0].allocated_qty, dec!(100));
    assert_eq!(availability[0].available_qty, dec!(0));
}

#[tokio::test]
async fn component_weightage_must_sum_to_one() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let (_, item) = estimation_with_item(&app).await;
    let prs = &app.state.purchase_requests;
    let vendor = Uuid::new_v4();

    let partial = prs
        .create_purchase_request(
            CreatePurchaseRequest {
                project_id: app.project_id,
                vendor_id: vendor,
                items: vec![
                    component_line(item, dec!(100), dec!(0.4)),
                    component_line(item, dec!(100), dec!(0.5)),
                ],
                expected_delivery_date: None,
            },
            app.actor,
        )
        .await;
    assert_eq!(
        kinds(&partial.unwrap_err()),
        vec![ViolationKind::WeightageMismatch]
    );

    let complete = prs
        .create_purchase_request(
            CreatePurchaseRequest {
                project_id: app.project_id,
                vendor_id: vendor,
                items: vec![
                    component_line(item, dec!(100), dec!(0.4)),
                    component_line(item, dec!(100), dec!(0.5)),
                    component_line(item, dec!(100), dec!(0.1)),
                ],
                expected_delivery_date: None,
            },
            app.actor,
        )
        .await
        .unwrap();

    let links = prs
        .current_links(complete.purchase_request_id)
        .await
        .unwrap();
    assert_eq!(links.len(), 3);

    let availability = prs.availability(app.project_id).await.unwrap();
    assert_eq!(availability[0].component_weightage, dec!(1.0));
    assert_eq!(availability[0].allocated_qty, dec!(100));
}

#[tokio::test]
async fn cancelled_purchase_request_frees_its_allocation() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let (_, item) = estimation_with_item(&app).await;
    let prs = &app.state.purchase_requests;

    let pr = prs
        .create_purchase_request(
            CreatePurchaseRequest {
                project_id: app.project_id,
                vendor_id: Uuid::new_v4(),
                items: vec![full_line(item, dec!(100))],
                expected_delivery_date: None,
            },
            app.actor,
        )
        .await
        .unwrap();

    let confirmed = prs
        .confirm_purchase_request(pr.purchase_request_id, Some(1), app.actor)
        .await
        .unwrap();
    assert_eq!(confirmed.status, PrStatus::Confirmed.as_str());
    assert_eq!(confirmed.version, 2);
    let items = prs.current_items(pr.purchase_request_id).await.unwrap();
    assert_eq!(items[0].lifecycle_status, LifecycleStatus::Confirmed.as_str());

    let cancelled = prs
        .cancel_purchase_request(pr.purchase_request_id, Some(2), app.actor)
        .await
        .unwrap();
    assert_eq!(cancelled.status, PrStatus::Cancelled.as_str());
    assert_eq!(cancelled.version, 3);
    assert_eq!(cancelled.final_value, dec!(0));

    let availability = prs.availability(app.project_id).await.unwrap();
    assert_eq!(availability[0].allocated_qty, dec!(0));
    assert_eq!(availability[0].available_qty, dec!(100));

    let versions = prs.list_versions(pr.purchase_request_id).await.unwrap();
    let change_types: Vec<&str> = versions.iter().map(|v| v.change_type.as_str()).collect();
    assert_eq!(change_types, vec!["created", "confirmed", "cancelled"]);
}

#[tokio::test]
async fn confirmed_items_cannot_be_edited() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let (_, item) = estimation_with_item(&app).await;
    let prs = &app.state.purchase_requests;

    let pr = prs
        .create_purchase_request(
            CreatePurchaseRequest {
                project_id: app.project_id,
                vendor_id: Uuid::new_v4(),
                items: vec![full_line(item, dec!(30))],
                expected_delivery_date: None,
            },
            app.actor,
        )
        .await
        .unwrap();
    prs.confirm_purchase_request(pr.purchase_request_id, None, app.actor)
        .await
        .unwrap();

    let current = prs.current_items(pr.purchase_request_id).await.unwrap();
    let mut line = full_line(item, dec!(40));
    line.stable_item_id = Some(current[0].stable_item_id);
    line.lifecycle_status = LifecycleStatus::Confirmed;

    let result = prs
        .revise_purchase_request(
            RevisePurchaseRequest {
                purchase_request_id: pr.purchase_request_id,
                items: vec![line],
                expected_version: Some(2),
                change_summary: None,
            },
            app.actor,
        )
        .await;
    assert_eq!(
        kinds(&result.unwrap_err()),
        vec![ViolationKind::ImmutableItem]
    );

    let unchanged = prs.get_purchase_request(pr.purchase_request_id).await.unwrap();
    assert_eq!(unchanged.version, 2);
}

#[tokio::test]
async fn estimation_cannot_shrink_below_allocated_quantity() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let (estimation_id, item) = estimation_with_item(&app).await;

    app.state
        .purchase_requests
        .create_purchase_request(
            CreatePurchaseRequest {
                project_id: app.project_id,
                vendor_id: Uuid::new_v4(),
                items: vec![full_line(item, dec!(80))],
                expected_delivery_date: None,
            },
            app.actor,
        )
        .await
        .unwrap();

    let estimations = &app.state.estimations;
    let mut inputs: Vec<EstimationItemInput> = estimations
        .current_items(estimation_id)
        .await
        .unwrap()
        .iter()
        .map(EstimationItemInput::from)
        .collect();
    inputs[0].quantity = Some(dec!(70));

    let request = SaveEstimation {
        estimation_id,
        items: inputs.clone(),
        expected_version: Some(1),
        confirm_overpayment: false,
        change_summary: None,
    };
    let err = estimations
        .save_estimation(request, app.actor)
        .await
        .unwrap_err();
    assert_eq!(kinds(&err), vec![ViolationKind::QuantityExceeded]);

    inputs[0].quantity = Some(dec!(80));
    let ok = saved(
        estimations
            .save_estimation(
                SaveEstimation {
                    estimation_id,
                    items: inputs,
                    expected_version: Some(1),
                    confirm_overpayment: false,
                    change_summary: None,
                },
                app.actor,
            )
            .await
            .unwrap(),
    );
    assert_eq!(ok.estimation.version, 2);

    let removed = estimations
        .save_estimation(
            SaveEstimation {
                estimation_id,
                items: vec![estimation_item("civil", "Skirting", dec!(10), dec!(50))],
                expected_version: Some(2),
                confirm_overpayment: false,
                change_summary: None,
            },
            app.actor,
        )
        .await
        .unwrap_err();
    assert_eq!(kinds(&removed), vec![ViolationKind::AllocatedItemRemoved]);
}

#[tokio::test]
async fn allocation_plan_rewrites_each_vendor_draft() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let (_, item) = estimation_with_item(&app).await;
    let prs = &app.state.purchase_requests;
    let (vendor_a, vendor_b) = (Uuid::new_v4(), Uuid::new_v4());

    let saved = prs
        .allocate_estimation_items(
            AllocationPlan {
                project_id: app.project_id,
                lines: vec![
                    VendorLine {
                        vendor_id: vendor_a,
                        item: full_line(item, dec!(60)),
                    },
                    VendorLine {
                        vendor_id: vendor_b,
                        item: full_line(item, dec!(40)),
                    },
                ],
            },
            app.actor,
        )
        .await
        .unwrap();
    assert_eq!(saved.len(), 2);

    // Re-saving vendor A's share replaces its draft instead of adding to it.
    let resaved = prs
        .allocate_estimation_items(
            AllocationPlan {
                project_id: app.project_id,
                lines: vec![VendorLine {
                    vendor_id: vendor_a,
                    item: full_line(item, dec!(55)),
                }],
            },
            app.actor,
        )
        .await
        .unwrap();
    assert_eq!(resaved.len(), 1);
    assert_eq!(resaved[0].version, 2);

    let all = prs.list_purchase_requests(app.project_id).await.unwrap();
    assert_eq!(all.len(), 2);

    let availability = prs.availability(app.project_id).await.unwrap();
    assert_eq!(availability[0].allocated_qty, dec!(95));

    let overdraw = prs
        .allocate_estimation_items(
            AllocationPlan {
                project_id: app.project_id,
                lines: vec![VendorLine {
                    vendor_id: vendor_a,
                    item: full_line(item, dec!(61)),
                }],
            },
            app.actor,
        )
        .await;
    assert_eq!(
        kinds(&overdraw.unwrap_err()),
        vec![ViolationKind::QuantityExceeded]
    );
}

#[tokio::test]
async fn direct_lines_need_no_estimation_link() {
    let Some(app) = spawn_app().await else {
        return;
    };
    estimation_with_item(&app).await;

    let mut line = full_line(StableId::new(), dec!(5));
    line.fulfillment_mode = FulfillmentMode::Direct;
    line.links.clear();

    let pr = app
        .state
        .purchase_requests
        .create_purchase_request(
            CreatePurchaseRequest {
                project_id: app.project_id,
                vendor_id: Uuid::new_v4(),
                items: vec![line],
                expected_delivery_date: None,
            },
            app.actor,
        )
        .await
        .unwrap();

    // 5 x 100 at 18% tax, no service charge on vendor purchases.
    assert_eq!(pr.final_value, dec!(590.00));
    let links = app
        .state
        .purchase_requests
        .current_links(pr.purchase_request_id)
        .await
        .unwrap();
    assert!(links.is_empty());
}
