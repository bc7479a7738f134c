pub mod allocation;
pub mod api;
pub mod deduction;
pub mod models;
pub mod service;

pub use allocation::{catch_up_allocations, CatchUpSummary};
pub use deduction::{deduct_credits, plan_deduction, DeductionSplit, DeductionStrategy};
pub use models::{
    CreditLogEntry, CreditLogKind, DeductionOutcome, SubscriptionRecord, UsageRecord,
    UserBenefits, YearlyAllocationDetails, METADATA_YEARLY_KEY, STATUS_INACTIVE_PERIOD_ENDED,
};
pub use service::LedgerService;
