use chrono::{DateTime, TimeZone, Utc};
use credit_ledger::ledger::{catch_up_allocations, UsageRecord};
use serde_json::json;
use sqlx::PgPool;

// key: allocation-tests -> bounded,idempotent catch-up
async fn insert_usage_record(
    pool: &PgPool,
    user_id: i32,
    subscription: i64,
    one_time: i64,
    metadata: serde_json::Value,
) {
    sqlx::query(
        "INSERT INTO usage_records (user_id, subscription_credits_balance, one_time_credits_balance, balance_metadata) VALUES ($1, $2, $3, $4)",
    )
    .bind(user_id)
    .bind(subscription)
    .bind(one_time)
    .bind(metadata)
    .execute(pool)
    .await
    .unwrap();
}

async fn fetch_usage(pool: &PgPool, user_id: i32) -> UsageRecord {
    sqlx::query_as::<_, UsageRecord>("SELECT * FROM usage_records WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

fn yearly_metadata(
    monthly_credits: i64,
    remaining_months: i32,
    next_credit_date: DateTime<Utc>,
    last_allocated_month: Option<&str>,
) -> serde_json::Value {
    json!({
        "yearly_allocation_details": {
            "monthly_credits": monthly_credits,
            "remaining_months": remaining_months,
            "next_credit_date": next_credit_date,
            "last_allocated_month": last_allocated_month,
        }
    })
}

fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).single().unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn bounded_catch_up_applies_all_elapsed_periods(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let now = at(2024, 6, 15);
    insert_usage_record(&pool, 1, 40, 7, yearly_metadata(100, 5, at(2024, 1, 10), None)).await;

    let summary = catch_up_allocations(&pool, 1, now).await.unwrap();
    assert_eq!(summary.periods_applied, 5);

    let record = fetch_usage(&pool, 1).await;
    assert_eq!(
        record.subscription_credits_balance, 100,
        "drip grants replace the allotment; five periods must not sum"
    );
    assert_eq!(record.one_time_credits_balance, 7);
    assert!(
        record.yearly_allocation_details().is_none(),
        "drip state is removed once the term completes"
    );

    let grants: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM credit_logs WHERE user_id = 1 AND kind = 'subscription_grant'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(grants, 5);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn catch_up_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let now = at(2024, 6, 15);
    insert_usage_record(&pool, 2, 0, 0, yearly_metadata(100, 11, at(2024, 6, 1), None)).await;

    let first = catch_up_allocations(&pool, 2, now).await.unwrap();
    assert_eq!(first.periods_applied, 1);
    let after_first = fetch_usage(&pool, 2).await;
    let details = after_first.yearly_allocation_details().unwrap();
    assert_eq!(details.remaining_months, 10);
    assert_eq!(details.last_allocated_month.as_deref(), Some("2024-06"));
    assert_eq!(details.next_credit_date, Some(at(2024, 7, 1)));

    let second = catch_up_allocations(&pool, 2, now).await.unwrap();
    assert_eq!(second.periods_applied, 0);
    let after_second = fetch_usage(&pool, 2).await;
    assert_eq!(
        after_second.subscription_credits_balance,
        after_first.subscription_credits_balance
    );
    assert_eq!(after_second.balance_metadata, after_first.balance_metadata);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn already_allocated_month_is_not_reapplied(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let now = at(2024, 6, 15);
    insert_usage_record(
        &pool,
        3,
        25,
        0,
        yearly_metadata(100, 4, at(2024, 6, 1), Some("2024-06")),
    )
    .await;

    let summary = catch_up_allocations(&pool, 3, now).await.unwrap();
    assert_eq!(summary.periods_applied, 0);

    let record = fetch_usage(&pool, 3).await;
    assert_eq!(record.subscription_credits_balance, 25);
    assert_eq!(
        record.yearly_allocation_details().unwrap().remaining_months,
        4
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn future_next_credit_date_is_untouched(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let now = at(2024, 6, 15);
    insert_usage_record(&pool, 4, 50, 0, yearly_metadata(100, 6, at(2024, 7, 1), None)).await;

    let summary = catch_up_allocations(&pool, 4, now).await.unwrap();
    assert_eq!(summary.periods_applied, 0);
    assert_eq!(fetch_usage(&pool, 4).await.subscription_credits_balance, 50);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn users_without_drip_state_are_skipped(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let now = at(2024, 6, 15);
    insert_usage_record(&pool, 5, 10, 20, json!({})).await;

    let summary = catch_up_allocations(&pool, 5, now).await.unwrap();
    assert_eq!(summary.periods_applied, 0);

    // A user with no usage record at all is a no-op too, not an error.
    let summary = catch_up_allocations(&pool, 99, now).await.unwrap();
    assert_eq!(summary.periods_applied, 0);
}
