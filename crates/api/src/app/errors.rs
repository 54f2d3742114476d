use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use artforge_infra::lifecycle::LifecycleError;

pub fn lifecycle_error_to_response(err: LifecycleError) -> axum::response::Response {
    match err {
        LifecycleError::InsufficientCredit {
            required,
            available,
        } => json_error(
            StatusCode::BAD_REQUEST,
            "insufficient_credit",
            format!("this operation costs {required} points; you have {available}"),
        ),
        LifecycleError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        LifecycleError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        LifecycleError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        LifecycleError::MalformedWebhook(msg) => {
            json_error(StatusCode::BAD_REQUEST, "malformed_webhook", msg)
        }
        LifecycleError::MissingSignatureHeaders(msg) => {
            json_error(StatusCode::UNAUTHORIZED, "missing_signature", msg)
        }
        LifecycleError::ProviderUnavailable(detail) => {
            tracing::error!(%detail, "provider unavailable");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "provider_unavailable",
                "the image service is unavailable right now; please try again later",
            )
        }
        err @ (LifecycleError::Stage { .. } | LifecycleError::Storage(_)) => {
            tracing::error!(error = %err, "request failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        let cases = [
            (
                LifecycleError::InsufficientCredit {
                    required: 15,
                    available: 3,
                },
                StatusCode::BAD_REQUEST,
            ),
            (LifecycleError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (LifecycleError::NotFound, StatusCode::NOT_FOUND),
            (LifecycleError::MalformedWebhook("x".into()), StatusCode::BAD_REQUEST),
            (
                LifecycleError::MissingSignatureHeaders("x".into()),
                StatusCode::UNAUTHORIZED,
            ),
            (
                LifecycleError::ProviderUnavailable("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (LifecycleError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(lifecycle_error_to_response(err).status(), status);
        }
    }

    #[tokio::test]
    async fn provider_outage_body_is_generic() {
        let res = lifecycle_error_to_response(LifecycleError::ProviderUnavailable(
            "connect timeout to 10.0.0.7".into(),
        ));
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["error"], "provider_unavailable");
        let message = body["message"].as_str().unwrap();
        assert!(!message.contains("10.0.0.7"));
        assert!(!message.contains("charged"));
    }
}
