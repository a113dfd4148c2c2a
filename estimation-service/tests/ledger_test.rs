//! Integration tests for payments, the project ledger and overpayment handling.

mod common;

use chrono::NaiveDate;
use common::{count_rows, estimation_item, saved, spawn_app, TestApp};
use estimation_service::error::ViolationKind;
use estimation_service::models::{
    EntryType, OverpaymentStatus, PaymentStatus, PaymentType, RecordCustomerPayment,
    RecordVendorPayment, SourceTable,
};
use estimation_service::services::{OverpaymentDecision, SaveEstimation, SaveOutcome};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn receipt(app: &TestApp, amount: Decimal) -> RecordCustomerPayment {
    RecordCustomerPayment {
        project_id: app.project_id,
        payment_type: PaymentType::Payment,
        amount,
        payment_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
        mode: "bank_transfer".to_string(),
        reference_number: Some("UTR-0001".to_string()),
        remarks: None,
    }
}

#[tokio::test]
async fn approving_twice_posts_one_ledger_entry() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let payments = &app.state.payments;

    let payment = payments
        .record_customer_payment(receipt(&app, dec!(250000)), app.actor)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending.as_str());

    let ledger = payments.project_ledger(app.project_id).await.unwrap();
    assert!(ledger.lines.is_empty());

    let first = payments
        .approve_payment(payment.payment_id, app.actor)
        .await
        .unwrap();
    assert!(first.posting.created);
    assert_eq!(first.posting.entry.entry_type, EntryType::Credit.as_str());
    assert_eq!(first.posting.entry.amount, dec!(250000));

    let second = payments
        .approve_payment(payment.payment_id, app.actor)
        .await
        .unwrap();
    assert!(!second.posting.created);
    assert_eq!(second.posting.entry.entry_id, first.posting.entry.entry_id);

    let entries = count_rows(
        &app.pool,
        "SELECT COUNT(*) FROM project_ledger WHERE source_id = $1",
        payment.payment_id,
    )
    .await;
    assert_eq!(entries, 1);

    let rejected = payments.reject_payment(payment.payment_id, app.actor).await;
    assert_eq!(
        rejected.unwrap_err().violations()[0].kind,
        ViolationKind::InvalidStatusTransition
    );
}

#[tokio::test]
async fn rejected_payment_never_reaches_ledger() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let payments = &app.state.payments;

    let payment = payments
        .record_customer_payment(receipt(&app, dec!(1000)), app.actor)
        .await
        .unwrap();
    let rejected = payments
        .reject_payment(payment.payment_id, app.actor)
        .await
        .unwrap();
    assert_eq!(rejected.status, PaymentStatus::Rejected.as_str());

    let approve = payments.approve_payment(payment.payment_id, app.actor).await;
    assert!(approve.is_err());

    let ledger = payments.project_ledger(app.project_id).await.unwrap();
    assert!(ledger.lines.is_empty());
    assert_eq!(ledger.balance, Decimal::ZERO);
}

#[tokio::test]
async fn invalid_payment_input_is_rejected() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let mut input = receipt(&app, dec!(-5));
    input.mode = String::new();

    let result = app
        .state
        .payments
        .record_customer_payment(input, app.actor)
        .await;
    assert!(result.is_err());

    let listed = app
        .state
        .payments
        .list_customer_payments(app.project_id)
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn vendor_payment_debits_and_reversal_is_idempotent() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let payments = &app.state.payments;

    let receipt_payment = payments
        .record_customer_payment(receipt(&app, dec!(50000)), app.actor)
        .await
        .unwrap();
    payments
        .approve_payment(receipt_payment.payment_id, app.actor)
        .await
        .unwrap();

    let (vendor_payment, posting) = payments
        .record_vendor_payment(
            RecordVendorPayment {
                project_id: app.project_id,
                vendor_id: Uuid::new_v4(),
                purchase_request_id: None,
                payment_stage: Some("advance".to_string()),
                amount: dec!(20000),
                payment_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
                mode: "cheque".to_string(),
                reference_number: None,
                remarks: None,
            },
            app.actor,
        )
        .await
        .unwrap();
    assert_eq!(posting.entry.entry_type, EntryType::Debit.as_str());
    assert_eq!(posting.entry.source_id, vendor_payment.payment_id);
    assert_eq!(
        posting.entry.source_table,
        SourceTable::VendorPayments.as_str()
    );

    let reversal = payments
        .reverse_ledger_entry(posting.entry.entry_id, app.actor, None)
        .await
        .unwrap();
    assert!(reversal.created);
    assert_eq!(reversal.entry.entry_type, EntryType::Credit.as_str());
    assert_eq!(reversal.entry.amount, dec!(20000));

    let again = payments
        .reverse_ledger_entry(posting.entry.entry_id, app.actor, None)
        .await
        .unwrap();
    assert!(!again.created);
    assert_eq!(again.entry.entry_id, reversal.entry.entry_id);

    let nested = payments
        .reverse_ledger_entry(reversal.entry.entry_id, app.actor, None)
        .await;
    assert_eq!(
        nested.unwrap_err().violations()[0].kind,
        ViolationKind::InvalidStatusTransition
    );

    let ledger = payments.project_ledger(app.project_id).await.unwrap();
    assert_eq!(ledger.lines.len(), 3);
    assert_eq!(ledger.total_credit, dec!(70000));
    assert_eq!(ledger.total_debit, dec!(20000));
    assert_eq!(ledger.balance, dec!(50000));
    let balances: Vec<Decimal> = ledger.lines.iter().map(|l| l.running_balance).collect();
    assert_eq!(balances, vec![dec!(50000), dec!(30000), dec!(50000)]);
}

#[tokio::test]
async fn overpayment_warns_then_flows_through_credit_note() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let estimations = &app.state.estimations;
    let payments = &app.state.payments;

    // 1 x 1,000,000 civil: +10% service charge, +18% tax = 1,298,000
    let estimation = estimations
        .create_estimation(
            app.project_id,
            vec![estimation_item("civil", "Turnkey works", dec!(1), dec!(1000000))],
            app.actor,
        )
        .await
        .unwrap();
    assert_eq!(estimation.final_value, dec!(1298000.00));
    let id = estimation.estimation_id;

    let payment = payments
        .record_customer_payment(receipt(&app, dec!(500000)), app.actor)
        .await
        .unwrap();
    assert_eq!(payment.estimation_id, Some(id));
    let approval = payments
        .approve_payment(payment.payment_id, app.actor)
        .await
        .unwrap();
    assert!(!approval.overpayment.unwrap().has_overpayment);

    let mut items = estimations.current_items(id).await.unwrap();
    let mut input = estimation_service::models::EstimationItemInput::from(&items.remove(0));
    // 1 x 100,000 => 129,800
    input.unit_price = Some(dec!(100000));

    let request = |confirm| SaveEstimation {
        estimation_id: id,
        items: vec![input.clone()],
        expected_version: Some(1),
        confirm_overpayment: confirm,
        change_summary: None,
    };

    let warning = estimations
        .save_estimation(request(false), app.actor)
        .await
        .unwrap();
    match warning {
        SaveOutcome::OverpaymentWarning(o) => {
            assert!(o.has_overpayment);
            assert_eq!(o.collected, dec!(500000));
            assert_eq!(o.amount, dec!(370200.00));
        }
        SaveOutcome::Saved(_) => panic!("expected an overpayment warning"),
    }

    let untouched = estimations.get_estimation(id).await.unwrap();
    assert_eq!(untouched.version, 1);
    assert!(!untouched.has_overpayment);
    assert_eq!(estimations.list_versions(id).await.unwrap().len(), 1);

    let confirmed = saved(
        estimations
            .save_estimation(request(true), app.actor)
            .await
            .unwrap(),
    );
    assert_eq!(confirmed.estimation.version, 2);
    assert!(confirmed.estimation.has_overpayment);
    assert_eq!(confirmed.estimation.overpayment_amount, dec!(370200.00));
    assert_eq!(
        confirmed.estimation.overpayment_status,
        OverpaymentStatus::PendingApproval.as_str()
    );

    let resolution = app
        .state
        .overpayments
        .resolve_overpayment(id, OverpaymentDecision::Approve, app.actor)
        .await
        .unwrap();
    assert_eq!(resolution.status, OverpaymentStatus::Approved);
    let credit_note = resolution.credit_note.unwrap();
    assert_eq!(credit_note.payment_type, PaymentType::CreditNote.as_str());
    assert_eq!(credit_note.amount, dec!(-370200.00));
    assert_eq!(credit_note.status, PaymentStatus::Pending.as_str());

    let repeat = app
        .state
        .overpayments
        .resolve_overpayment(id, OverpaymentDecision::Reject, app.actor)
        .await;
    assert!(repeat.is_err());

    let note_approval = payments
        .approve_payment(credit_note.payment_id, app.actor)
        .await
        .unwrap();
    assert_eq!(
        note_approval.posting.entry.entry_type,
        EntryType::Debit.as_str()
    );
    assert_eq!(note_approval.posting.entry.amount, dec!(370200.00));
    assert!(!note_approval.overpayment.unwrap().has_overpayment);

    let ledger = payments.project_ledger(app.project_id).await.unwrap();
    assert_eq!(ledger.balance, dec!(129800.00));

    let settled = estimations.get_estimation(id).await.unwrap();
    assert!(!settled.has_overpayment);
}

#[tokio::test]
async fn overpayment_check_is_read_only() {
    let Some(app) = spawn_app().await else {
        return;
    };
    let payments = &app.state.payments;

    let payment = payments
        .record_customer_payment(receipt(&app, dec!(500000)), app.actor)
        .await
        .unwrap();
    payments
        .approve_payment(payment.payment_id, app.actor)
        .await
        .unwrap();

    let result = app
        .state
        .overpayments
        .check_overpayment(app.project_id, dec!(450000))
        .await
        .unwrap();
    assert!(result.has_overpayment);
    assert_eq!(result.amount, dec!(50000));

    let ledger = payments.project_ledger(app.project_id).await.unwrap();
    assert_eq!(ledger.lines.len(), 1);
}
