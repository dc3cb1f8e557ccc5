use super::executor::LocalTaskExecutor;
use super::protocol::*;
use crate::task::codec::decode_envelope;

use axum::body::Bytes;
use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;

pub async fn handle_apply(
    Extension(executor): Extension<Arc<LocalTaskExecutor>>,
    body: Bytes,
) -> (StatusCode, Json<ApplyResponse>) {
    let envelope = match decode_envelope(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Rejected undecodable task envelope ({} bytes): {}", body.len(), e);
            return (StatusCode::BAD_REQUEST, Json(ApplyResponse::failed(e.to_string())));
        }
    };

    tracing::debug!(
        "Received task {} ({}) from log '{}'",
        envelope.task.id,
        envelope.task.task_type,
        envelope.log
    );

    match executor.apply(&envelope.task).await {
        Ok(outcome) => (StatusCode::OK, Json(ApplyResponse::ok(outcome))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApplyResponse::failed(e.to_string())),
        ),
    }
}

pub async fn handle_health(
    Extension(executor): Extension<Arc<LocalTaskExecutor>>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            node: executor.local_node().to_string(),
            handlers: executor.handlers().list_handlers(),
        }),
    )
}
