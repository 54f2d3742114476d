use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
};

use artforge_core::WorkId;
use artforge_predictions::{OperationKind, WorkFilter};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_works))
        .route("/:id", delete(delete_work))
}

/// GET /works?type=&search=&limit=&offset=
pub async fn list_works(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<dto::WorksQuery>,
) -> axum::response::Response {
    let kind = match query.kind.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<OperationKind>() {
            Ok(kind) => Some(kind),
            Err(e) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "invalid_type", e.to_string());
            }
        },
    };
    let filter = WorkFilter::new(kind, query.search.as_deref());
    let page = dto::PageQuery {
        limit: query.limit,
        offset: query.offset,
    }
    .page();

    match services.lifecycle.works(user.user_id(), &filter, page).await {
        Ok(page) => {
            (StatusCode::OK, Json(dto::page_to_json(&page, dto::work_to_json))).into_response()
        }
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn delete_work(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(work_id) = id.parse::<WorkId>() else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "work not found");
    };
    match services.lifecycle.delete_work(user.user_id(), work_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}
