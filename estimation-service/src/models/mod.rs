//! Domain models for estimation-service.

mod estimation;
mod ledger;
mod payment;
mod purchase_request;
mod rate;
mod stable_id;
mod version;

pub use estimation::{
    ApprovalStatus, Estimation, EstimationItem, EstimationItemInput, OverpaymentStatus,
};
pub use ledger::{EntryType, LedgerEntry, LedgerLine, ProjectLedger, SourceTable};
pub use payment::{
    CustomerPayment, PaymentStatus, PaymentType, RecordCustomerPayment, RecordVendorPayment,
    VendorPayment,
};
pub use purchase_request::{
    AllocationLink, FulfillmentMode, LifecycleStatus, PrStatus, ProposedEstimationLink,
    PurchaseRequest, PurchaseRequestItem, PurchaseRequestItemInput,
};
pub use rate::{CategoryRateConfig, RateCard};
pub use stable_id::StableId;
pub use version::{ChangeType, DocumentKind, VersionRecord};
