//! Snapshot handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::daemon::error::ApiResult;
use crate::daemon::AppState;
use crate::error::Error;
use crate::multipass::{Snapshot, VmState};

/// `GET /api/vms/:name/snapshots`
pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<HashMap<String, Snapshot>>> {
    Ok(Json(state.mp.list_snapshots(&name).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSnapshotRequest {
    #[serde(default)]
    pub name: String,
}

/// `POST /api/vms/:name/snapshots`
///
/// The engine only snapshots stopped VMs; checking here turns its opaque
/// failure into a clean conflict.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<CreateSnapshotRequest>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let vm = state.mp.info(&name).await?;
    if vm.state != VmState::Stopped {
        return Err(Error::invalid_state("Stopped", vm.state.as_str()).into());
    }

    let snapshot_name = body.map(|Json(req)| req.name).unwrap_or_default();
    state.mp.create_snapshot(&name, &snapshot_name).await?;
    Ok((StatusCode::CREATED, Json(json!({"status": "created"}))))
}

#[derive(Debug, Deserialize)]
pub struct RestoreSnapshotRequest {
    pub snapshot_name: String,
    #[serde(default)]
    pub destructive: bool,
}

/// `POST /api/vms/:name/snapshots/restore`
pub async fn restore(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<RestoreSnapshotRequest>,
) -> ApiResult<Json<Value>> {
    if req.snapshot_name.is_empty() {
        return Err(Error::validation("snapshot_name is required").into());
    }
    state
        .mp
        .restore_snapshot(&name, &req.snapshot_name, req.destructive)
        .await?;
    Ok(Json(json!({"status": "restored"})))
}

/// `DELETE /api/vms/:name/snapshots/:snap`
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path((name, snap)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state.mp.delete_snapshot(&name, &snap).await?;
    Ok(Json(json!({"status": "deleted"})))
}
