use anyhow::{Context, Result};
use chrono::{DateTime, Months, Utc};
use serde_json::json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::models::{CreditLogKind, UsageRecord, YearlyAllocationDetails, METADATA_YEARLY_KEY};

/// Outcome of one catch-up pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpSummary {
    pub periods_applied: u32,
}

enum Step {
    Applied { remaining_after: i32 },
    Done,
}

/// key: allocation-engine -> monthly drip catch-up
///
/// Brings `subscription_credits_balance` up to date with every monthly
/// allocation period elapsed since the last applied grant. Runs one short
/// transaction per period: the row lock is re-acquired for each step, so a
/// long catch-up never holds the lock for the whole pass. Each committed step
/// strictly advances `last_allocated_month` and decrements `remaining_months`,
/// which makes re-invocation idempotent. The loop is additionally capped at
/// the first-observed `remaining_months` so a data anomaly can never spin it
/// forever.
pub async fn catch_up_allocations(
    pool: &PgPool,
    user_id: i32,
    now: DateTime<Utc>,
) -> Result<CatchUpSummary> {
    let mut summary = CatchUpSummary::default();
    let mut cap: Option<u32> = None;

    loop {
        match apply_next_period(pool, user_id, now)
            .await
            .context("allocation catch-up step failed")?
        {
            Step::Done => break,
            Step::Applied { remaining_after } => {
                summary.periods_applied += 1;
                let cap =
                    *cap.get_or_insert(summary.periods_applied + remaining_after.max(0) as u32);
                if remaining_after <= 0 || summary.periods_applied >= cap {
                    break;
                }
            }
        }
    }

    if summary.periods_applied > 0 {
        debug!(
            user_id,
            periods = summary.periods_applied,
            "allocation catch-up applied elapsed periods"
        );
    }

    Ok(summary)
}

/// Applies at most one due allocation period inside its own row-locked
/// transaction. Returns `Step::Done` when the balance is already current.
async fn apply_next_period(pool: &PgPool, user_id: i32, now: DateTime<Utc>) -> Result<Step> {
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

    let Some(record) = record else {
        return Ok(Step::Done);
    };
    let Some(details) = record.yearly_allocation_details() else {
        return Ok(Step::Done);
    };
    if details.remaining_months <= 0 {
        return Ok(Step::Done);
    }
    let Some(next_credit_date) = details.next_credit_date else {
        return Ok(Step::Done);
    };
    if next_credit_date > now {
        return Ok(Step::Done);
    }

    let token = month_token(next_credit_date);
    if details.last_allocated_month.as_deref() == Some(token.as_str()) {
        // Already applied by an earlier run.
        return Ok(Step::Done);
    }

    let remaining_after = details.remaining_months - 1;
    let advanced_date = next_credit_date
        .checked_add_months(Months::new(1))
        .context("next credit date overflow")?;

    let mut metadata = if record.balance_metadata.is_object() {
        record.balance_metadata.clone()
    } else {
        json!({})
    };
    let entries = metadata
        .as_object_mut()
        .context("balance metadata must be a JSON object")?;
    if remaining_after <= 0 {
        // Term complete: the drip state is removed entirely.
        entries.remove(METADATA_YEARLY_KEY);
    } else {
        let updated = YearlyAllocationDetails {
            monthly_credits: details.monthly_credits,
            remaining_months: remaining_after,
            next_credit_date: Some(advanced_date),
            last_allocated_month: Some(token.clone()),
        };
        entries.insert(METADATA_YEARLY_KEY.to_string(), serde_json::to_value(updated)?);
    }

    // Drip grants replace the period allotment rather than accumulating;
    // unused credits from the prior period are forfeited.
    sqlx::query(
        r#"
        UPDATE usage_records
        SET subscription_credits_balance = $2, balance_metadata = $3, updated_at = NOW()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(details.monthly_credits)
    .bind(&metadata)
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
    .bind(CreditLogKind::SubscriptionGrant.as_str())
    .bind(details.monthly_credits)
    .bind(format!("Monthly allocation for {token}"))
    .bind(record.one_time_credits_balance)
    .bind(details.monthly_credits)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    debug!(
        user_id,
        month = %token,
        credits = details.monthly_credits,
        remaining = remaining_after,
        "applied monthly credit allocation"
    );

    Ok(Step::Applied { remaining_after })
}

fn month_token(date: DateTime<Utc>) -> String {
    date.format("%Y-%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn month_token_is_zero_padded_year_month() {
        let date = Utc.with_ymd_and_hms(2024, 7, 3, 12, 0, 0).single().unwrap();
        assert_eq!(month_token(date), "2024-07");
    }

    #[test]
    fn month_token_advances_across_year_boundary() {
        let date = Utc
            .with_ymd_and_hms(2024, 12, 15, 0, 0, 0)
            .single()
            .unwrap();
        let next = date.checked_add_months(Months::new(1)).unwrap();
        assert_eq!(month_token(next), "2025-01");
    }
}
