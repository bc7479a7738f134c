use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Key under `balance_metadata` holding the monthly drip state.
pub const METADATA_YEARLY_KEY: &str = "yearly_allocation_details";

/// Synthetic status reported when a subscription's billing period has lapsed
/// but the billing-sync collaborator has not yet propagated a cancellation.
pub const STATUS_INACTIVE_PERIOD_ENDED: &str = "inactive_period_ended";

/// key: ledger-models -> balances,subscriptions,audit
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: i32,
    pub subscription_credits_balance: i64,
    pub one_time_credits_balance: i64,
    pub balance_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn yearly_allocation_details(&self) -> Option<YearlyAllocationDetails> {
        self.balance_metadata
            .get(METADATA_YEARLY_KEY)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

/// Monthly drip state for users on a yearly-billed plan that grants credits
/// month by month. `last_allocated_month` is a `YYYY-MM` token marking the
/// most recently applied grant; it strictly advances and makes allocation
/// idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearlyAllocationDetails {
    pub monthly_credits: i64,
    pub remaining_months: i32,
    pub next_credit_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_allocated_month: Option<String>,
}

/// key: ledger-subscription-model -> owned by the billing-sync collaborator
///
/// The ledger only ever reads subscription rows; the most recent row per user
/// wins.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: i32,
    pub plan_id: String,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn period_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.current_period_end
            .map(|end| end < now)
            .unwrap_or(false)
    }
}

/// Kind of balance-changing event recorded in the credit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditLogKind {
    FeatureUsage,
    PurchaseGrant,
    SubscriptionGrant,
    RefundRevoke,
    SubscriptionEndedRevoke,
    WelcomeBonus,
}

impl CreditLogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditLogKind::FeatureUsage => "feature_usage",
            CreditLogKind::PurchaseGrant => "purchase_grant",
            CreditLogKind::SubscriptionGrant => "subscription_grant",
            CreditLogKind::RefundRevoke => "refund_revoke",
            CreditLogKind::SubscriptionEndedRevoke => "subscription_ended_revoke",
            CreditLogKind::WelcomeBonus => "welcome_bonus",
        }
    }
}

/// key: ledger-audit-model -> append-only trail, never mutated or deleted
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditLogEntry {
    pub id: Uuid,
    pub user_id: i32,
    pub kind: String,
    pub amount: i64,
    pub notes: Option<String>,
    pub one_time_balance_after: i64,
    pub subscription_balance_after: i64,
    pub created_at: DateTime<Utc>,
}

/// Derived entitlements view; not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct UserBenefits {
    pub active_plan_id: Option<String>,
    pub subscription_status: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub next_credit_date: Option<DateTime<Utc>>,
    pub total_available_credits: i64,
    pub subscription_credits_balance: i64,
    pub one_time_credits_balance: i64,
}

/// Result of a deduction attempt. Insufficient funds is a normal outcome
/// (`success: false`), not an error.
#[derive(Debug, Clone, Serialize)]
pub struct DeductionOutcome {
    pub success: bool,
    pub message: String,
    pub new_one_time_balance: i64,
    pub new_subscription_balance: i64,
    pub new_total_balance: i64,
}
