//! Services module for estimation-service.

pub mod allocation;
pub mod database;
pub mod estimations;
pub mod ledger;
pub mod metrics;
pub mod overpayment;
pub mod purchase_requests;
pub mod versioning;

pub use allocation::{AllocationSnapshot, AvailabilityLine, ProposedAllocation, TOLERANCE};
pub use database::Database;
pub use estimations::{EstimationService, SaveEstimation, SaveOutcome, SavedEstimation};
pub use ledger::{ApprovalOutcome, PaymentLedgerPoster, Posting};
pub use metrics::{get_metrics, init_metrics, record_ledger_posting, record_revision};
pub use overpayment::{Overpayment, OverpaymentDecision, OverpaymentDetector, OverpaymentResolution};
pub use purchase_requests::{
    AllocationPlan, CreatePurchaseRequest, PurchaseRequestService, RevisePurchaseRequest,
    VendorLine,
};
pub use versioning::{Archiver, NoopHook, RevisionHook, RevisionOutcome};
