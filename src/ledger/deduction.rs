use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::allocation::catch_up_allocations;
use super::models::{CreditLogKind, DeductionOutcome, UsageRecord};

/// key: deduction-router -> selectable spend priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductionStrategy {
    OneTimeOnly,
    SubscriptionOnly,
    PrioritizeSubscription,
    PrioritizeOneTime,
}

impl DeductionStrategy {
    pub fn describe(&self) -> &'static str {
        match self {
            DeductionStrategy::OneTimeOnly => "one-time credits",
            DeductionStrategy::SubscriptionOnly => "subscription credits",
            DeductionStrategy::PrioritizeSubscription => {
                "subscription credits first, then one-time"
            }
            DeductionStrategy::PrioritizeOneTime => "one-time credits first, then subscription",
        }
    }
}

/// Amounts drawn from each balance by a planned deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeductionSplit {
    pub from_one_time: i64,
    pub from_subscription: i64,
}

/// Pure strategy arithmetic. Returns the split to apply, or an explanatory
/// shortfall message when the strategy cannot cover `amount`.
pub fn plan_deduction(
    strategy: DeductionStrategy,
    amount: i64,
    one_time_balance: i64,
    subscription_balance: i64,
) -> Result<DeductionSplit, String> {
    match strategy {
        DeductionStrategy::OneTimeOnly => {
            if one_time_balance < amount {
                Err(format!(
                    "insufficient one-time credits: have {one_time_balance}, need {amount}"
                ))
            } else {
                Ok(DeductionSplit {
                    from_one_time: amount,
                    from_subscription: 0,
                })
            }
        }
        DeductionStrategy::SubscriptionOnly => {
            if subscription_balance < amount {
                Err(format!(
                    "insufficient subscription credits: have {subscription_balance}, need {amount}"
                ))
            } else {
                Ok(DeductionSplit {
                    from_one_time: 0,
                    from_subscription: amount,
                })
            }
        }
        DeductionStrategy::PrioritizeSubscription => {
            let combined = one_time_balance + subscription_balance;
            if combined < amount {
                Err(format!(
                    "insufficient credits: have {combined} combined, need {amount}"
                ))
            } else {
                let from_subscription = subscription_balance.min(amount);
                Ok(DeductionSplit {
                    from_one_time: amount - from_subscription,
                    from_subscription,
                })
            }
        }
        DeductionStrategy::PrioritizeOneTime => {
            let combined = one_time_balance + subscription_balance;
            if combined < amount {
                Err(format!(
                    "insufficient credits: have {combined} combined, need {amount}"
                ))
            } else {
                let from_one_time = one_time_balance.min(amount);
                Ok(DeductionSplit {
                    from_one_time,
                    from_subscription: amount - from_one_time,
                })
            }
        }
    }
}

/// key: deduction-router -> atomic debit
///
/// Executes one deduction as a single row-locked transaction: lock the usage
/// row, validate sufficiency, mutate the balance(s), append the audit entry
/// with post-deduction balances, commit. The check and the mutation can never
/// be split across two observable states. Allocation catch-up runs first so
/// the router never decides against a stale balance; because both paths lock
/// the same row they serialize correctly under concurrency.
pub async fn deduct_credits(
    pool: &PgPool,
    user_id: i32,
    amount: i64,
    strategy: DeductionStrategy,
    now: DateTime<Utc>,
) -> Result<DeductionOutcome> {
    if amount <= 0 {
        return Err(anyhow!("deduction amount must be positive"));
    }

    catch_up_allocations(pool, user_id, now)
        .await
        .context("allocation catch-up before deduction failed")?;

    let mut tx = pool.begin().await?;

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
    .fetch_optional(&mut *tx)
    .await?;

    // A user with no usage record has zero credits, not an error.
    let (one_time_balance, subscription_balance) = record
        .as_ref()
        .map(|record| {
            (
                record.one_time_credits_balance,
                record.subscription_credits_balance,
            )
        })
        .unwrap_or((0, 0));

    let split = match plan_deduction(strategy, amount, one_time_balance, subscription_balance) {
        Ok(split) => split,
        Err(message) => {
            // Nothing has been mutated; dropping the transaction rolls back.
            return Ok(DeductionOutcome {
                success: false,
                message,
                new_one_time_balance: one_time_balance,
                new_subscription_balance: subscription_balance,
                new_total_balance: one_time_balance + subscription_balance,
            });
        }
    };

    let new_one_time = one_time_balance - split.from_one_time;
    let new_subscription = subscription_balance - split.from_subscription;

    sqlx::query(
        r#"
        UPDATE usage_records
        SET one_time_credits_balance = $2, subscription_credits_balance = $3, updated_at = NOW()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(new_one_time)
    .bind(new_subscription)
    .execute(&mut *tx)
    .await?;

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
    .bind(CreditLogKind::FeatureUsage.as_str())
    .bind(-amount)
    .bind(format!("Deducted from {}", strategy.describe()))
    .bind(new_one_time)
    .bind(new_subscription)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    debug!(
        user_id,
        amount,
        strategy = strategy.describe(),
        new_one_time,
        new_subscription,
        "credits deducted"
    );

    Ok(DeductionOutcome {
        success: true,
        message: format!("Deducted {amount} credits ({})", strategy.describe()),
        new_one_time_balance: new_one_time,
        new_subscription_balance: new_subscription,
        new_total_balance: new_one_time + new_subscription,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_time_only_rejects_shortfall() {
        let err = plan_deduction(DeductionStrategy::OneTimeOnly, 100, 10, 500).unwrap_err();
        assert_eq!(err, "insufficient one-time credits: have 10, need 100");
    }

    #[test]
    fn subscription_only_exact_balance_succeeds() {
        let split = plan_deduction(DeductionStrategy::SubscriptionOnly, 10, 0, 10).unwrap();
        assert_eq!(split.from_subscription, 10);
        assert_eq!(split.from_one_time, 0);
    }

    #[test]
    fn prioritize_subscription_draws_shortfall_from_one_time() {
        let split = plan_deduction(DeductionStrategy::PrioritizeSubscription, 30, 50, 20).unwrap();
        assert_eq!(split.from_subscription, 20);
        assert_eq!(split.from_one_time, 10);
    }

    #[test]
    fn prioritize_one_time_draws_shortfall_from_subscription() {
        let split = plan_deduction(DeductionStrategy::PrioritizeOneTime, 30, 20, 50).unwrap();
        assert_eq!(split.from_one_time, 20);
        assert_eq!(split.from_subscription, 10);
    }

    #[test]
    fn priority_strategies_reject_combined_shortfall() {
        for strategy in [
            DeductionStrategy::PrioritizeSubscription,
            DeductionStrategy::PrioritizeOneTime,
        ] {
            let err = plan_deduction(strategy, 100, 40, 50).unwrap_err();
            assert_eq!(err, "insufficient credits: have 90 combined, need 100");
        }
    }
}
