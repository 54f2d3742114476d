//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: stores, collaborators and the prediction lifecycle
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use artforge_infra::config::AppConfig;
use artforge_infra::tasks::TaskWorkerHandle;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// A built application: the router plus the running transition worker.
pub struct App {
    pub router: Router,
    pub services: Arc<services::AppServices>,
    pub worker: TaskWorkerHandle,
}

/// Build the full HTTP router and start the transition worker.
pub async fn build_app(config: AppConfig) -> anyhow::Result<App> {
    let jwt = Arc::new(artforge_auth::Hs256JwtValidator::new(
        config.jwt_secret.clone().into_bytes(),
    ));
    let auth_state = middleware::AuthState { jwt };

    let (services, worker) = services::build_services(&config).await?;
    let services = Arc::new(services);
    let worker = worker.spawn();

    // Protected routes: require a valid bearer token.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    // Provider callbacks authenticate with their signature instead.
    let public = Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::webhooks::router());

    let router = Router::new()
        .merge(public)
        .merge(protected)
        .layer(Extension(services.clone()))
        .layer(ServiceBuilder::new());

    Ok(App {
        router,
        services,
        worker,
    })
}
