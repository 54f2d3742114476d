//! Provider callbacks. Authenticated by signature, not by bearer token.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use chrono::Utc;
use serde_json::json;

use artforge_auth::WebhookHeaders;
use artforge_infra::lifecycle::WebhookAck;
use artforge_predictions::OperationKind;

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/webhooks/:tool", post(receive))
}

/// POST /webhooks/:tool
///
/// 200 once the update is queued, and also for a bad signature so the
/// provider stops redelivering it.
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tool): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    if tool.parse::<OperationKind>().is_err() {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "unknown_tool",
            format!("no tool named {tool}"),
        );
    }

    let signature =
        WebhookHeaders::from_lookup(|name| headers.get(name).and_then(|v| v.to_str().ok()));
    match services
        .lifecycle
        .accept_webhook(&body, &signature, Utc::now())
        .await
    {
        Ok(WebhookAck::Accepted(_)) | Ok(WebhookAck::Rejected) => {
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}
