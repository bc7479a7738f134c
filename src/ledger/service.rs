use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use super::allocation::catch_up_allocations;
use super::deduction::{deduct_credits, DeductionStrategy};
use super::models::{
    CreditLogKind, DeductionOutcome, SubscriptionRecord, UsageRecord, UserBenefits,
    YearlyAllocationDetails, METADATA_YEARLY_KEY, STATUS_INACTIVE_PERIOD_ENDED,
};

/// key: ledger-service -> benefits projection, deductions, grants
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Benefits Projector. Pure read path apart from the catch-up side
    /// effect: a failed catch-up is logged and the view reflects whatever
    /// balance was last successfully committed.
    pub async fn user_benefits(&self, user_id: i32, now: DateTime<Utc>) -> Result<UserBenefits> {
        if let Err(err) = catch_up_allocations(&self.pool, user_id, now).await {
            warn!(
                ?err,
                user_id, "allocation catch-up failed; serving last committed balance"
            );
        }

        let record = self.usage_record(user_id).await?;
        let subscription = self.latest_subscription(user_id).await?;

        let (subscription_balance, one_time_balance, next_credit_date) = match &record {
            Some(record) => (
                record.subscription_credits_balance,
                record.one_time_credits_balance,
                record
                    .yearly_allocation_details()
                    .and_then(|details| details.next_credit_date),
            ),
            None => (0, 0, None),
        };

        let subscription_status = subscription.as_ref().map(|subscription| {
            if subscription.period_lapsed(now) {
                STATUS_INACTIVE_PERIOD_ENDED.to_string()
            } else {
                subscription.status.clone()
            }
        });

        let active_plan_id = match (&subscription, subscription_status.as_deref()) {
            (Some(subscription), Some("active" | "trialing")) => {
                Some(subscription.plan_id.clone())
            }
            _ => None,
        };

        Ok(UserBenefits {
            active_plan_id,
            subscription_status,
            current_period_end: subscription
                .as_ref()
                .and_then(|subscription| subscription.current_period_end),
            next_credit_date,
            total_available_credits: subscription_balance + one_time_balance,
            subscription_credits_balance: subscription_balance,
            one_time_credits_balance: one_time_balance,
        })
    }

    pub async fn deduct_one_time(
        &self,
        user_id: i32,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<DeductionOutcome> {
        deduct_credits(&self.pool, user_id, amount, DeductionStrategy::OneTimeOnly, now).await
    }

    pub async fn deduct_subscription(
        &self,
        user_id: i32,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<DeductionOutcome> {
        deduct_credits(
            &self.pool,
            user_id,
            amount,
            DeductionStrategy::SubscriptionOnly,
            now,
        )
        .await
    }

    pub async fn deduct_prioritizing_subscription(
        &self,
        user_id: i32,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<DeductionOutcome> {
        deduct_credits(
            &self.pool,
            user_id,
            amount,
            DeductionStrategy::PrioritizeSubscription,
            now,
        )
        .await
    }

    pub async fn deduct_prioritizing_one_time(
        &self,
        user_id: i32,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<DeductionOutcome> {
        deduct_credits(
            &self.pool,
            user_id,
            amount,
            DeductionStrategy::PrioritizeOneTime,
            now,
        )
        .await
    }

    /// Adds purchased or welcome-bonus credits to the one-time balance.
    pub async fn grant_one_time_credits(
        &self,
        user_id: i32,
        amount: i64,
        kind: CreditLogKind,
        notes: Option<&str>,
    ) -> Result<UsageRecord> {
        if amount <= 0 {
            return Err(anyhow!("grant amount must be positive"));
        }
        if !matches!(
            kind,
            CreditLogKind::PurchaseGrant | CreditLogKind::WelcomeBonus
        ) {
            return Err(anyhow!("unsupported one-time grant kind: {}", kind.as_str()));
        }

        let mut tx = self.pool.begin().await?;
        let record = lock_or_create_usage_row(&mut tx, user_id).await?;
        let new_one_time = record.one_time_credits_balance + amount;

        let updated = sqlx::query_as::<_, UsageRecord>(
            r#"
            UPDATE usage_records
            SET one_time_credits_balance = $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, subscription_credits_balance, one_time_credits_balance,
                      balance_metadata, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(new_one_time)
        .fetch_one(&mut *tx)
        .await?;

        append_log(
            &mut tx,
            user_id,
            kind,
            amount,
            notes,
            new_one_time,
            record.subscription_credits_balance,
        )
        .await?;
        tx.commit().await?;

        info!(user_id, amount, kind = kind.as_str(), "one-time credits granted");
        Ok(updated)
    }

    /// Sets the subscription balance to a fresh grant. The balance is
    /// replaced, not added; yearly drip state is installed or cleared along
    /// with it.
    pub async fn grant_subscription_credits(
        &self,
        user_id: i32,
        amount: i64,
        yearly: Option<YearlyAllocationDetails>,
        notes: Option<&str>,
    ) -> Result<UsageRecord> {
        if amount <= 0 {
            return Err(anyhow!("grant amount must be positive"));
        }

        let mut tx = self.pool.begin().await?;
        let record = lock_or_create_usage_row(&mut tx, user_id).await?;
        let metadata = replace_yearly_details(&record.balance_metadata, yearly)?;

        let updated = sqlx::query_as::<_, UsageRecord>(
            r#"
            UPDATE usage_records
            SET subscription_credits_balance = $2, balance_metadata = $3, updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, subscription_credits_balance, one_time_credits_balance,
                      balance_metadata, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await?;

        append_log(
            &mut tx,
            user_id,
            CreditLogKind::SubscriptionGrant,
            amount,
            notes,
            record.one_time_credits_balance,
            amount,
        )
        .await?;
        tx.commit().await?;

        info!(user_id, amount, "subscription credits granted");
        Ok(updated)
    }

    /// Zeroes the subscription balance and clears drip state when a
    /// subscription ends.
    pub async fn revoke_subscription_credits(
        &self,
        user_id: i32,
        notes: Option<&str>,
    ) -> Result<UsageRecord> {
        let mut tx = self.pool.begin().await?;
        let record = lock_or_create_usage_row(&mut tx, user_id).await?;
        let revoked = record.subscription_credits_balance;
        let metadata = replace_yearly_details(&record.balance_metadata, None)?;

        let updated = sqlx::query_as::<_, UsageRecord>(
            r#"
            UPDATE usage_records
            SET subscription_credits_balance = 0, balance_metadata = $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, subscription_credits_balance, one_time_credits_balance,
                      balance_metadata, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await?;

        append_log(
            &mut tx,
            user_id,
            CreditLogKind::SubscriptionEndedRevoke,
            -revoked,
            notes,
            record.one_time_credits_balance,
            0,
        )
        .await?;
        tx.commit().await?;

        info!(user_id, revoked, "subscription credits revoked");
        Ok(updated)
    }

    /// Removes refunded one-time credits, clamped at zero.
    pub async fn revoke_one_time_credits(
        &self,
        user_id: i32,
        amount: i64,
        notes: Option<&str>,
    ) -> Result<UsageRecord> {
        if amount <= 0 {
            return Err(anyhow!("revoke amount must be positive"));
        }

        let mut tx = self.pool.begin().await?;
        let record = lock_or_create_usage_row(&mut tx, user_id).await?;
        let new_one_time = (record.one_time_credits_balance - amount).max(0);
        let revoked = record.one_time_credits_balance - new_one_time;

        let updated = sqlx::query_as::<_, UsageRecord>(
            r#"
            UPDATE usage_records
            SET one_time_credits_balance = $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, subscription_credits_balance, one_time_credits_balance,
                      balance_metadata, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(new_one_time)
        .fetch_one(&mut *tx)
        .await?;

        append_log(
            &mut tx,
            user_id,
            CreditLogKind::RefundRevoke,
            -revoked,
            notes,
            new_one_time,
            record.subscription_credits_balance,
        )
        .await?;
        tx.commit().await?;

        info!(user_id, revoked, "one-time credits revoked");
        Ok(updated)
    }

    async fn usage_record(&self, user_id: i32) -> Result<Option<UsageRecord>> {
        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT user_id, subscription_credits_balance, one_time_credits_balance,
                   balance_metadata, created_at, updated_at
            FROM usage_records
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn latest_subscription(&self, user_id: i32) -> Result<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT id, user_id, plan_id, status, current_period_end, created_at
            FROM subscriptions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

/// Locks the user's usage row for the duration of the transaction, creating
/// the zero-balance row first when the user has none yet.
async fn lock_or_create_usage_row(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
) -> Result<UsageRecord> {
    sqlx::query("INSERT INTO usage_records (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

    let record = sqlx::query_as::<_, UsageRecord>(
        r#"
        SELECT user_id, subscription_credits_balance, one_time_credits_balance,
               balance_metadata, created_at, updated_at
        FROM usage_records
        WHERE user_id = $1
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(record)
}

async fn append_log(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    kind: CreditLogKind,
    amount: i64,
    notes: Option<&str>,
    one_time_balance_after: i64,
    subscription_balance_after: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO credit_logs (
            id, user_id, kind, amount, notes,
            one_time_balance_after, subscription_balance_after
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(kind.as_str())
    .bind(amount)
    .bind(notes)
    .bind(one_time_balance_after)
    .bind(subscription_balance_after)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn replace_yearly_details(
    current: &serde_json::Value,
    yearly: Option<YearlyAllocationDetails>,
) -> Result<serde_json::Value> {
    let mut metadata = if current.is_object() {
        current.clone()
    } else {
        serde_json::json!({})
    };
    let entries = metadata
        .as_object_mut()
        .ok_or_else(|| anyhow!("balance metadata must be a JSON object"))?;
    match yearly {
        Some(details) => {
            entries.insert(METADATA_YEARLY_KEY.to_string(), serde_json::to_value(details)?);
        }
        None => {
            entries.remove(METADATA_YEARLY_KEY);
        }
    }
    Ok(metadata)
}
