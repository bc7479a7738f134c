use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

use super::deduction::{deduct_credits, DeductionStrategy};
use super::models::{
    CreditLogKind, DeductionOutcome, UsageRecord, UserBenefits, YearlyAllocationDetails,
};
use super::service::LedgerService;

/// key: ledger-api -> rest endpoints
pub async fn get_user_benefits(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
) -> AppResult<Json<UserBenefits>> {
    let service = LedgerService::new(pool);
    let benefits = service
        .user_benefits(user_id, Utc::now())
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    Ok(Json(benefits))
}

#[derive(Debug, Deserialize)]
pub struct DeductRequest {
    pub amount: i64,
}

pub async fn deduct_one_time(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Json(payload): Json<DeductRequest>,
) -> AppResult<Json<DeductionOutcome>> {
    run_deduction(pool, user_id, payload.amount, DeductionStrategy::OneTimeOnly).await
}

pub async fn deduct_subscription(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Json(payload): Json<DeductRequest>,
) -> AppResult<Json<DeductionOutcome>> {
    run_deduction(
        pool,
        user_id,
        payload.amount,
        DeductionStrategy::SubscriptionOnly,
    )
    .await
}

pub async fn deduct_priority_subscription(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Json(payload): Json<DeductRequest>,
) -> AppResult<Json<DeductionOutcome>> {
    run_deduction(
        pool,
        user_id,
        payload.amount,
        DeductionStrategy::PrioritizeSubscription,
    )
    .await
}

pub async fn deduct_priority_one_time(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Json(payload): Json<DeductRequest>,
) -> AppResult<Json<DeductionOutcome>> {
    run_deduction(
        pool,
        user_id,
        payload.amount,
        DeductionStrategy::PrioritizeOneTime,
    )
    .await
}

async fn run_deduction(
    pool: PgPool,
    user_id: i32,
    amount: i64,
    strategy: DeductionStrategy,
) -> AppResult<Json<DeductionOutcome>> {
    // Validation happens before any store access.
    if amount <= 0 {
        return Err(AppError::BadRequest(
            "amount must be a positive integer".into(),
        ));
    }
    let outcome = deduct_credits(&pool, user_id, amount, strategy, Utc::now())
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub kind: CreditLogKind,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub yearly_allocation: Option<YearlyAllocationDetails>,
}

/// Grant endpoint for the billing-sync collaborator; requires a service or
/// admin token.
pub async fn grant_credits(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(user_id): Path<i32>,
    Json(payload): Json<GrantRequest>,
) -> AppResult<Json<UsageRecord>> {
    if !auth.is_service() {
        return Err(AppError::Forbidden);
    }

    let service = LedgerService::new(pool);
    let record = match payload.kind {
        CreditLogKind::WelcomeBonus => {
            let amount = payload.amount.unwrap_or(*config::CREDITS_WELCOME_BONUS);
            validate_amount(amount)?;
            service
                .grant_one_time_credits(
                    user_id,
                    amount,
                    CreditLogKind::WelcomeBonus,
                    payload.notes.as_deref(),
                )
                .await
        }
        CreditLogKind::PurchaseGrant => {
            let amount = required_amount(payload.amount)?;
            service
                .grant_one_time_credits(
                    user_id,
                    amount,
                    CreditLogKind::PurchaseGrant,
                    payload.notes.as_deref(),
                )
                .await
        }
        CreditLogKind::SubscriptionGrant => {
            let amount = required_amount(payload.amount)?;
            service
                .grant_subscription_credits(
                    user_id,
                    amount,
                    payload.yearly_allocation,
                    payload.notes.as_deref(),
                )
                .await
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "unsupported grant kind: {}",
                other.as_str()
            )))
        }
    }
    .map_err(|err| AppError::Message(err.to_string()))?;

    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub kind: CreditLogKind,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Revocation endpoint for the billing-sync collaborator; requires a service
/// or admin token.
pub async fn revoke_credits(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(user_id): Path<i32>,
    Json(payload): Json<RevokeRequest>,
) -> AppResult<Json<UsageRecord>> {
    if !auth.is_service() {
        return Err(AppError::Forbidden);
    }

    let service = LedgerService::new(pool);
    let record = match payload.kind {
        CreditLogKind::SubscriptionEndedRevoke => {
            service
                .revoke_subscription_credits(user_id, payload.notes.as_deref())
                .await
        }
        CreditLogKind::RefundRevoke => {
            let amount = required_amount(payload.amount)?;
            service
                .revoke_one_time_credits(user_id, amount, payload.notes.as_deref())
                .await
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "unsupported revocation kind: {}",
                other.as_str()
            )))
        }
    }
    .map_err(|err| AppError::Message(err.to_string()))?;

    Ok(Json(record))
}

fn required_amount(amount: Option<i64>) -> Result<i64, AppError> {
    let amount = amount.ok_or_else(|| AppError::BadRequest("amount is required".into()))?;
    validate_amount(amount)?;
    Ok(amount)
}

fn validate_amount(amount: i64) -> Result<(), AppError> {
    if amount <= 0 {
        return Err(AppError::BadRequest(
            "amount must be a positive integer".into(),
        ));
    }
    Ok(())
}
