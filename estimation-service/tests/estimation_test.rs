//! Integration tests for estimation revisions and version history.

mod common;

use common::{count_rows, estimation_item, saved, spawn_app};
use estimation_service::error::{ServiceError, ViolationKind};
use estimation_service::models::{ApprovalStatus, EstimationItemInput};
use estimation_service::services::database::load_rate_card;
use estimation_service::services::estimations::price_estimation_items;
use estimation_service::services::SaveEstimation;
use rust_decimal_macros::dec;

#[tokio::test]
async fn create_estimation_writes_version_one() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let service = &app.state.estimations;

    let estimation = service
        .create_estimation(
            app.project_id,
            vec![
                estimation_item("civil", "False ceiling", dec!(10), dec!(1000)),
                estimation_item("furniture", "Wardrobe", dec!(1), dec!(50000)),
            ],
            app.actor,
        )
        .await
        .unwrap();

    assert_eq!(estimation.version, 1);
    // civil: 10000 + 10% sc = 11000, +18% tax = 12980
    // furniture: 50000 + 12% sc = 56000, +18% tax = 66080
    assert_eq!(estimation.final_value, dec!(79060.00));
    assert_eq!(estimation.approval_status, ApprovalStatus::Approved.as_str());

    let versions = service.list_versions(estimation.estimation_id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, 1);
    assert_eq!(versions[0].items_added, 2);
    assert_eq!(versions[0].change_type, "created");

    let second = service
        .create_estimation(
            app.project_id,
            vec![estimation_item("civil", "Flooring", dec!(1), dec!(1))],
            app.actor,
        )
        .await;
    assert!(matches!(second, Err(ServiceError::Conflict { .. })));
}

#[tokio::test]
async fn revision_preserves_audit_and_archives_previous_version() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let service = &app.state.estimations;

    let estimation = service
        .create_estimation(
            app.project_id,
            vec![
                estimation_item("civil", "False ceiling", dec!(10), dec!(1000)),
                estimation_item("civil", "Painting", dec!(200), dec!(25)),
            ],
            app.actor,
        )
        .await
        .unwrap();
    let id = estimation.estimation_id;
    let v1_items = service.current_items(id).await.unwrap();

    let mut inputs: Vec<EstimationItemInput> =
        v1_items.iter().map(EstimationItemInput::from).collect();
    let ceiling = inputs
        .iter_mut()
        .find(|i| i.item_name == "False ceiling")
        .unwrap();
    ceiling.quantity = Some(dec!(12));
    inputs.retain(|i| i.item_name != "Painting");
    inputs.push(estimation_item("furniture", "Study table", dec!(1), dec!(15000)));

    let editor = uuid::Uuid::new_v4();
    let result = saved(
        service
            .save_estimation(
                SaveEstimation {
                    estimation_id: id,
                    items: inputs,
                    expected_version: Some(1),
                    confirm_overpayment: false,
                    change_summary: Some("Resized ceiling".to_string()),
                },
                editor,
            )
            .await
            .unwrap(),
    );

    assert_eq!(result.estimation.version, 2);
    assert_eq!(result.items_added, 1);
    assert_eq!(result.items_edited, 1);
    assert_eq!(result.items_deleted, 1);

    let v2_items = service.current_items(id).await.unwrap();
    let old = v1_items
        .iter()
        .find(|i| i.item_name == "False ceiling")
        .unwrap();
    let new = v2_items
        .iter()
        .find(|i| i.item_name == "False ceiling")
        .unwrap();
    assert_eq!(new.stable_item_id, old.stable_item_id);
    assert_eq!(new.created_utc, old.created_utc);
    assert_eq!(new.created_by, app.actor);
    assert_eq!(new.updated_by, editor);
    assert_eq!(new.quantity, dec!(12));

    let archived = service.items_at_version(id, 1).await.unwrap();
    assert_eq!(archived.len(), 2);
    assert!(archived.iter().all(|i| i.version == 1));

    let history = count_rows(
        &app.pool,
        "SELECT COUNT(*) FROM estimation_items_history WHERE estimation_id = $1",
        id,
    )
    .await;
    assert_eq!(history, 2);

    let versions: Vec<i32> = service
        .list_versions(id)
        .await
        .unwrap()
        .iter()
        .map(|v| v.version)
        .collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn stale_expected_version_is_a_conflict() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let service = &app.state.estimations;

    let estimation = service
        .create_estimation(
            app.project_id,
            vec![estimation_item("civil", "Flooring", dec!(100), dec!(90))],
            app.actor,
        )
        .await
        .unwrap();
    let id = estimation.estimation_id;
    let items: Vec<EstimationItemInput> = service
        .current_items(id)
        .await
        .unwrap()
        .iter()
        .map(EstimationItemInput::from)
        .collect();

    let request = |qty| {
        let mut items = items.clone();
        items[0].quantity = Some(qty);
        SaveEstimation {
            estimation_id: id,
            items,
            expected_version: Some(1),
            confirm_overpayment: false,
            change_summary: None,
        }
    };

    let (a, b) = tokio::join!(
        service.save_estimation(request(dec!(110)), app.actor),
        service.save_estimation(request(dec!(120)), app.actor),
    );

    let conflicts = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_conflict()))
        .count();
    assert_eq!(conflicts, 1, "exactly one writer should lose: {:?} / {:?}", a, b);

    let current = service.get_estimation(id).await.unwrap();
    assert_eq!(current.version, 2);
}

#[tokio::test]
async fn restore_creates_a_new_version_with_archived_items() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let service = &app.state.estimations;

    let estimation = service
        .create_estimation(
            app.project_id,
            vec![estimation_item("civil", "Flooring", dec!(100), dec!(90))],
            app.actor,
        )
        .await
        .unwrap();
    let id = estimation.estimation_id;
    let original_total = estimation.final_value;

    saved(
        service
            .save_estimation(
                SaveEstimation {
                    estimation_id: id,
                    items: vec![estimation_item("furniture", "Bed", dec!(1), dec!(40000))],
                    expected_version: Some(1),
                    confirm_overpayment: false,
                    change_summary: None,
                },
                app.actor,
            )
            .await
            .unwrap(),
    );

    let restored = saved(
        service
            .restore_estimation_version(id, 1, Some(2), false, app.actor)
            .await
            .unwrap(),
    );

    assert_eq!(restored.estimation.version, 3);
    assert_eq!(restored.estimation.final_value, original_total);

    let items = service.current_items(id).await.unwrap();
    let v1 = service.items_at_version(id, 1).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].stable_item_id, v1[0].stable_item_id);

    let versions = service.list_versions(id).await.unwrap();
    assert_eq!(versions.len(), 3);
    assert_eq!(versions[2].change_type, "restored");
}

#[tokio::test]
async fn invalid_items_are_rejected_before_any_write() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let service = &app.state.estimations;

    let estimation = service
        .create_estimation(
            app.project_id,
            vec![estimation_item("civil", "Flooring", dec!(100), dec!(90))],
            app.actor,
        )
        .await
        .unwrap();

    let result = service
        .save_estimation(
            SaveEstimation {
                estimation_id: estimation.estimation_id,
                items: vec![
                    estimation_item("landscaping", "Lawn", dec!(1), dec!(1)),
                    estimation_item("civil", "Tiles", dec!(-2), dec!(10)),
                ],
                expected_version: Some(1),
                confirm_overpayment: false,
                change_summary: None,
            },
            app.actor,
        )
        .await;

    let err = result.unwrap_err();
    let kinds: Vec<ViolationKind> = err.violations().iter().map(|v| v.kind).collect();
    assert_eq!(
        kinds,
        vec![ViolationKind::UnknownCategory, ViolationKind::InvalidQuantity]
    );

    let current = service.get_estimation(estimation.estimation_id).await.unwrap();
    assert_eq!(current.version, 1);
}

#[tokio::test]
async fn excessive_discount_flags_estimation_for_approval() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let service = &app.state.estimations;

    let mut item = estimation_item("civil", "Flooring", dec!(100), dec!(90));
    item.item_discount_percentage = Some(dec!(25));

    let estimation = service
        .create_estimation(app.project_id, vec![item], app.actor)
        .await
        .unwrap();

    assert!(estimation.requires_approval);
    assert_eq!(estimation.approval_status, ApprovalStatus::Pending.as_str());
}

#[tokio::test]
async fn stored_inputs_rederive_stored_amounts() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let service = &app.state.estimations;

    let mut paint = estimation_item("civil", "Wall paint", dec!(1), dec!(333.335));
    paint.unit = "sqft".to_string();
    paint.width = Some(dec!(12.3456789));
    paint.height = Some(dec!(9.8765432));
    paint.item_discount_percentage = Some(dec!(7.33335));
    let mut fittings = estimation_item("furniture", "Fittings", dec!(3), dec!(333.335));
    fittings.tax_percentage = Some(dec!(18.00005));

    let estimation = service
        .create_estimation(app.project_id, vec![paint, fittings], app.actor)
        .await
        .unwrap();
    let items = service.current_items(estimation.estimation_id).await.unwrap();

    let fittings = items.iter().find(|i| i.item_name == "Fittings").unwrap();
    assert_eq!(fittings.unit_price, dec!(333.34));
    assert_eq!(fittings.subtotal, dec!(1000.02));
    assert_eq!(fittings.tax_percentage, dec!(18.0001));

    let mut conn = app.pool.acquire().await.unwrap();
    let rates = load_rate_card(&mut conn, app.project_id).await.unwrap();
    let inputs: Vec<EstimationItemInput> = items.iter().map(EstimationItemInput::from).collect();
    let repriced = price_estimation_items(&inputs, &rates).unwrap();

    for (item, line) in items.iter().zip(repriced.iter()) {
        let a = &line.amounts;
        assert_eq!(a.quantity, item.quantity, "{}", item.item_name);
        assert_eq!(a.unit_price, item.unit_price);
        assert_eq!(a.subtotal, item.subtotal);
        assert_eq!(a.item_discount_amount, item.item_discount_amount);
        assert_eq!(a.service_charge_net, item.service_charge_net);
        assert_eq!(a.taxable_amount, item.taxable_amount);
        assert_eq!(a.tax_amount, item.tax_amount);
        assert_eq!(a.line_total, item.line_total);
        assert_eq!(line.input.width, item.width);
        assert_eq!(line.input.height, item.height);
    }
    let total: rust_decimal::Decimal = items.iter().map(|i| i.line_total).sum();
    assert_eq!(estimation.final_value, total);
}

#[tokio::test]
async fn oversized_amounts_are_violations() {
    let Some(app) = spawn_app().await else {
        return;
    };

    let result = app
        .state
        .estimations
        .create_estimation(
            app.project_id,
            vec![estimation_item(
                "civil",
                "Tower",
                dec!(100000000000),
                dec!(1000000000000000),
            )],
            app.actor,
        )
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.violations()[0].kind, ViolationKind::InvalidAmount);
    let estimations = count_rows(
        &app.pool,
        "SELECT COUNT(*) FROM estimations WHERE project_id = $1",
        app.project_id,
    )
    .await;
    assert_eq!(estimations, 0);
}
