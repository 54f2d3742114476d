use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde_json::{Value, json};

use artforge_core::PredictionId;
use artforge_predictions::OperationKind;

use crate::app::routes::stream;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    // POST submits by tool slug, GET polls by job id; one path segment serves both.
    Router::new()
        .route("/", get(list_jobs))
        .route("/:key", get(get_job).post(submit_job))
        .route("/:key/stream", get(stream::job_stream))
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(tool): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> axum::response::Response {
    let kind = match tool.parse::<OperationKind>() {
        Ok(kind) => kind,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "unknown_tool", e.to_string());
        }
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_json",
                rejection.body_text(),
            );
        }
    };

    match services.lifecycle.submit(user.user_id(), kind, body).await {
        Ok(submitted) => (
            StatusCode::CREATED,
            Json(json!({
                "id": submitted.id.as_str(),
                "input": submitted.input,
            })),
        )
            .into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<dto::PageQuery>,
) -> axum::response::Response {
    match services.lifecycle.predictions(user.user_id(), query.page()).await {
        Ok(page) => (
            StatusCode::OK,
            Json(dto::page_to_json(&page, dto::prediction_to_json)),
        )
            .into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = PredictionId::new(id) else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found");
    };
    match services.lifecycle.prediction(user.user_id(), &id).await {
        Ok(p) => (StatusCode::OK, Json(dto::prediction_to_json(&p))).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}
