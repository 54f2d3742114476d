//! Inference provider client.
//!
//! `POST {base}/v1/models/{owner}/{name}/predictions` with a bearer token. The
//! provider calls back on `webhook` for the `start` and `completed` events.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument};

use artforge_core::PredictionId;

use super::{http_client, trim_base};

/// A job the provider accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedJob {
    pub id: PredictionId,
    /// The input as the provider recorded it.
    pub input: serde_json::Value,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Network(String),

    #[error("provider rejected the job ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("unexpected provider response: {0}")]
    Parse(String),
}

#[async_trait::async_trait]
pub trait JobProvider: Send + Sync {
    async fn create_job(
        &self,
        model: &str,
        input: serde_json::Value,
        callback_url: &str,
    ) -> Result<CreatedJob, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    input: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct HttpJobProvider {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpJobProvider {
    pub fn new(
        base_url: &str,
        api_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = http_client(timeout).map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: trim_base(base_url),
            api_token: api_token.into(),
        })
    }
}

#[async_trait::async_trait]
impl JobProvider for HttpJobProvider {
    #[instrument(skip(self, input), fields(model = %model), err)]
    async fn create_job(
        &self,
        model: &str,
        input: serde_json::Value,
        callback_url: &str,
    ) -> Result<CreatedJob, ProviderError> {
        let url = format!("{}/v1/models/{}/predictions", self.base_url, model);
        let body = json!({
            "input": input,
            "webhook": callback_url,
            "webhook_events_filter": ["start", "completed"],
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let created: CreateResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let id = PredictionId::new(created.id).map_err(|e| ProviderError::Parse(e.to_string()))?;
        debug!(prediction_id = %id, "provider accepted job");

        let input = if created.input.is_null() {
            body["input"].clone()
        } else {
            created.input
        };
        Ok(CreatedJob { id, input })
    }
}

/// One call seen by [`StubJobProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub model: String,
    pub input: serde_json::Value,
    pub callback_url: String,
}

/// In-process provider for dev and tests: hands out `stub-<n>` ids.
#[derive(Debug, Default)]
pub struct StubJobProvider {
    next: AtomicU64,
    failing: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StubJobProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail with a network error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl JobProvider for StubJobProvider {
    async fn create_job(
        &self,
        model: &str,
        input: serde_json::Value,
        callback_url: &str,
    ) -> Result<CreatedJob, ProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Network("stub provider is down".to_string()));
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                model: model.to_string(),
                input: input.clone(),
                callback_url: callback_url.to_string(),
            });
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let id = PredictionId::new(format!("stub-{n}"))
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(CreatedJob { id, input })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn posts_input_and_webhook_to_the_model_endpoint() {
        let router = Router::new().route(
            "/v1/models/:owner/:name/predictions",
            post(
                |Path((owner, name)): Path<(String, String)>,
                 headers: HeaderMap,
                 Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(format!("{owner}/{name}"), "acme/painter");
                    assert_eq!(headers["authorization"], "Bearer tok");
                    assert_eq!(body["webhook"], "https://app/webhooks/edit");
                    assert_eq!(body["webhook_events_filter"], json!(["start", "completed"]));
                    (
                        StatusCode::CREATED,
                        Json(json!({"id": "pred-123", "status": "starting", "input": body["input"]})),
                    )
                },
            ),
        );
        let base = serve(router).await;

        let provider = HttpJobProvider::new(&base, "tok", Duration::from_secs(5)).unwrap();
        let job = provider
            .create_job("acme/painter", json!({"prompt": "sunset"}), "https://app/webhooks/edit")
            .await
            .unwrap();
        assert_eq!(job.id.as_str(), "pred-123");
        assert_eq!(job.input["prompt"], "sunset");
    }

    #[tokio::test]
    async fn non_success_status_is_an_api_error() {
        let router = Router::new().route(
            "/v1/models/:owner/:name/predictions",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "bad input") }),
        );
        let base = serve(router).await;
        let provider = HttpJobProvider::new(&base, "tok", Duration::from_secs(5)).unwrap();

        let err = provider
            .create_job("acme/painter", json!({}), "https://app/webhooks/edit")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::Api {
                status: 422,
                body: "bad input".into()
            }
        );
    }

    #[tokio::test]
    async fn stub_counts_and_fails_on_demand() {
        let stub = StubJobProvider::new();
        let first = stub.create_job("m", json!({}), "cb").await.unwrap();
        assert_eq!(first.id.as_str(), "stub-1");
        stub.set_failing(true);
        assert!(stub.create_job("m", json!({}), "cb").await.is_err());
        assert_eq!(stub.calls().len(), 1);
    }
}
