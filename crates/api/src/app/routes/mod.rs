use axum::{Router, routing::get};

pub mod credits;
pub mod jobs;
pub mod stream;
pub mod system;
pub mod webhooks;
pub mod works;

/// Router for all authenticated (user-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/jobs", jobs::router())
        .nest("/works", works::router())
        .merge(credits::router())
}
