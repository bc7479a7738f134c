use axum::{
    routing::{get, post},
    Router,
};

use crate::ledger::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/credits/benefits", get(api::get_user_benefits))
        .route("/api/credits/deduct/one-time", post(api::deduct_one_time))
        .route(
            "/api/credits/deduct/subscription",
            post(api::deduct_subscription),
        )
        .route(
            "/api/credits/deduct/priority-subscription",
            post(api::deduct_priority_subscription),
        )
        .route(
            "/api/credits/deduct/priority-one-time",
            post(api::deduct_priority_one_time),
        )
        .route("/api/credits/users/:user_id/grants", post(api::grant_credits))
        .route(
            "/api/credits/users/:user_id/revocations",
            post(api::revoke_credits),
        )
}
