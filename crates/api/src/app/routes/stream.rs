//! Live job status over Server-Sent Events.
//!
//! The first event is the job's current state; after that every status change
//! is forwarded until a terminal one, which closes the stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_stream::wrappers::UnboundedReceiverStream;

use artforge_core::PredictionId;
use artforge_events::JobEvent;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::UserContext;

/// GET /jobs/:id/stream
pub async fn job_stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = PredictionId::new(id) else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found");
    };

    // Subscribe before reading the snapshot so no transition slips between them.
    let mut subscription = services.hub.subscribe(id.clone());
    let prediction = match services.lifecycle.prediction(user.user_id(), &id).await {
        Ok(p) => p,
        Err(e) => return errors::lifecycle_error_to_response(e),
    };

    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();
    let snapshot = JobEvent::from_prediction(&prediction, None);

    tokio::spawn(async move {
        if !forward(&tx, &snapshot) || snapshot.is_final() {
            return;
        }
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    if !forward(&tx, &event) || event.is_final() {
                        break;
                    }
                }
            }
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// `false` once the client is gone.
fn forward(tx: &UnboundedSender<Result<SseEvent, Infallible>>, event: &JobEvent) -> bool {
    let data = match serde_json::to_string(event) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "unserializable job event");
            return true;
        }
    };
    tx.send(Ok(SseEvent::default().event("status").data(data))).is_ok()
}
