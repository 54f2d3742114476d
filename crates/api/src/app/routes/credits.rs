use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/balance", get(get_balance))
        .route("/transactions", get(list_transactions))
        .route("/credits/redeem", post(redeem_code))
}

pub async fn get_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.lifecycle.balance(user.user_id()).await {
        Ok(b) => (StatusCode::OK, Json(dto::balance_to_json(&b))).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

/// Ledger entries, newest first.
pub async fn list_transactions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<dto::PageQuery>,
) -> axum::response::Response {
    match services.lifecycle.transactions(user.user_id(), query.page()).await {
        Ok(page) => {
            (StatusCode::OK, Json(dto::page_to_json(&page, dto::entry_to_json))).into_response()
        }
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn redeem_code(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::RedeemRequest>,
) -> axum::response::Response {
    match services.lifecycle.redeem(user.user_id(), &body.code).await {
        Ok(redeemed) => (
            StatusCode::OK,
            Json(json!({
                "balance": dto::balance_to_json(&redeemed.balance),
                "entry": redeemed.entry.as_ref().map(dto::entry_to_json),
            })),
        )
            .into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}
