use super::protocol::*;
use super::service::{DeadLetterEntry, DestinationStats, SyncService};
use crate::error::SyncError;
use crate::executor::executor::LocalTaskExecutor;
use crate::executor::handlers::{handle_apply, handle_health};
use crate::executor::protocol::{ENDPOINT_APPLY, ENDPOINT_HEALTH};
use crate::policy::registry::ChangeContext;
use crate::task::types::{TaskGroup, TaskGroupId};

use axum::extract::DefaultBodyLimit;
use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

/// Builds the node's HTTP surface: the receive endpoints for peers plus the
/// producer and admin endpoints.
pub fn router(
    service: Arc<SyncService>,
    executor: Arc<LocalTaskExecutor>,
    max_body_bytes: usize,
) -> Router {
    Router::new()
        .route(ENDPOINT_APPLY, post(handle_apply))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(ENDPOINT_CHANGE, post(handle_change))
        .route(
            ENDPOINT_DESTINATIONS,
            get(handle_list_destinations).post(handle_add_destination),
        )
        .route("/admin/destinations/:name/enable", post(handle_enable_destination))
        .route("/admin/destinations/:name/disable", post(handle_disable_destination))
        .route("/admin/destinations/:name/remove", post(handle_remove_destination))
        .route(ENDPOINT_DEAD, get(handle_dead_letters))
        .route(ENDPOINT_GROUPS, get(handle_list_groups).post(handle_create_group))
        .route("/admin/groups/:id/cancel", post(handle_cancel_group))
        .route("/admin/groups/:id/replay", post(handle_replay_group))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(Extension(service))
        .layer(Extension(executor))
}

fn status_of(error: &SyncError) -> StatusCode {
    match error {
        SyncError::UnknownLog(_) | SyncError::UnknownGroup(_) | SyncError::UnknownDestination(_) => {
            StatusCode::NOT_FOUND
        }
        SyncError::DuplicateDestination(_) => StatusCode::CONFLICT,
        SyncError::Log(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Runs the producer contract on the blocking pool, since appends sync the journal.
pub async fn handle_change(
    Extension(service): Extension<Arc<SyncService>>,
    Json(change): Json<ChangeContext>,
) -> (StatusCode, Json<ChangeResponse>) {
    let joined = tokio::task::spawn_blocking(move || {
        let result = service.on_change(&change);
        (change, result)
    })
    .await;

    let (change, result) = match joined {
        Ok(joined) => joined,
        Err(e) => {
            tracing::error!("Change handling aborted: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChangeResponse {
                    appended: Vec::new(),
                    error: Some(format!("change handling aborted: {}", e)),
                }),
            );
        }
    };

    match result {
        Ok(appended) => {
            tracing::debug!(
                "Logged {} tasks for {} '{}'",
                appended.len(),
                change.object_type,
                change.object_id
            );
            (
                StatusCode::OK,
                Json(ChangeResponse {
                    appended,
                    error: None,
                }),
            )
        }
        Err(e) => (
            status_of(&e),
            Json(ChangeResponse {
                appended: Vec::new(),
                error: Some(e.to_string()),
            }),
        ),
    }
}

pub async fn handle_list_destinations(
    Extension(service): Extension<Arc<SyncService>>,
) -> Json<Vec<DestinationStats>> {
    Json(service.destination_stats())
}

pub async fn handle_add_destination(
    Extension(service): Extension<Arc<SyncService>>,
    Json(req): Json<AddDestinationRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    let logs = req.logs.len();
    match service.add_destination(req.destination, &req.logs) {
        Ok(()) => (StatusCode::OK, Json(AdminResponse::ok(logs))),
        Err(e) => (status_of(&e), Json(AdminResponse::failed(e))),
    }
}

pub async fn handle_remove_destination(
    Extension(service): Extension<Arc<SyncService>>,
    Path(name): Path<String>,
    Json(req): Json<RemoveDestinationRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    match service.remove_destination(&name, req.removal) {
        Ok(pending) => (StatusCode::OK, Json(AdminResponse::ok(pending))),
        Err(e) => (status_of(&e), Json(AdminResponse::failed(e))),
    }
}

pub async fn handle_enable_destination(
    Extension(service): Extension<Arc<SyncService>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<AdminResponse>) {
    match service.enable_destination(&name) {
        Ok(()) => {
            tracing::info!("Destination '{}' enabled via admin API", name);
            (StatusCode::OK, Json(AdminResponse::ok(1)))
        }
        Err(e) => (status_of(&e), Json(AdminResponse::failed(e))),
    }
}

pub async fn handle_disable_destination(
    Extension(service): Extension<Arc<SyncService>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<AdminResponse>) {
    match service.disable_destination(&name) {
        Ok(()) => {
            tracing::info!("Destination '{}' disabled via admin API", name);
            (StatusCode::OK, Json(AdminResponse::ok(1)))
        }
        Err(e) => (status_of(&e), Json(AdminResponse::failed(e))),
    }
}

pub async fn handle_dead_letters(
    Extension(service): Extension<Arc<SyncService>>,
) -> Json<Vec<DeadLetterEntry>> {
    Json(service.dead_letters())
}

pub async fn handle_list_groups(
    Extension(service): Extension<Arc<SyncService>>,
) -> Json<Vec<TaskGroup>> {
    Json(service.groups())
}

pub async fn handle_create_group(
    Extension(service): Extension<Arc<SyncService>>,
    Json(req): Json<CreateGroupRequest>,
) -> (StatusCode, Json<TaskGroup>) {
    (
        StatusCode::OK,
        Json(service.create_group(&req.code_name, &req.description)),
    )
}

pub async fn handle_cancel_group(
    Extension(service): Extension<Arc<SyncService>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<GroupActionResponse>) {
    let group = TaskGroupId(id);
    group_action(service.cancel_group(&group), group)
}

pub async fn handle_replay_group(
    Extension(service): Extension<Arc<SyncService>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<GroupActionResponse>) {
    let group = TaskGroupId(id);
    group_action(service.replay_group(&group), group)
}

fn group_action(
    result: Result<usize, SyncError>,
    group: TaskGroupId,
) -> (StatusCode, Json<GroupActionResponse>) {
    match result {
        Ok(affected) => (
            StatusCode::OK,
            Json(GroupActionResponse {
                group,
                affected,
                error: None,
            }),
        ),
        Err(e) => (
            status_of(&e),
            Json(GroupActionResponse {
                group,
                affected: 0,
                error: Some(e.to_string()),
            }),
        ),
    }
}
