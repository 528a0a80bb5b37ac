//! Mount handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::daemon::error::ApiResult;
use crate::daemon::AppState;
use crate::error::Error;
use crate::multipass::VmState;

#[derive(Debug, Serialize)]
pub struct MountEntry {
    pub host_path: String,
    pub vm_path: String,
}

/// `GET /api/vms/:name/mounts`
pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<MountEntry>>> {
    let vm = state.mp.info(&name).await?;
    let mounts = vm
        .mounts
        .into_iter()
        .map(|(vm_path, mount)| MountEntry {
            host_path: mount.source_path,
            vm_path,
        })
        .collect();
    Ok(Json(mounts))
}

#[derive(Debug, Deserialize)]
pub struct AddMountRequest {
    pub host_path: String,
    pub vm_path: String,
}

/// `POST /api/vms/:name/mounts`
pub async fn add(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<AddMountRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if req.host_path.is_empty() || req.vm_path.is_empty() {
        return Err(Error::validation("host_path and vm_path are required").into());
    }
    require_running(&state, &name).await?;
    state.mp.mount(&name, &req.host_path, &req.vm_path).await?;
    Ok((StatusCode::CREATED, Json(json!({"status": "mounted"}))))
}

#[derive(Debug, Deserialize)]
pub struct RemoveMountQuery {
    pub path: String,
}

/// `DELETE /api/vms/:name/mounts?path=...`
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<RemoveMountQuery>,
) -> ApiResult<Json<Value>> {
    if query.path.is_empty() {
        return Err(Error::validation("path query parameter is required").into());
    }
    require_running(&state, &name).await?;
    state.mp.unmount(&name, &query.path).await?;
    Ok(Json(json!({"status": "unmounted"})))
}

async fn require_running(state: &AppState, name: &str) -> Result<(), Error> {
    let vm = state.mp.info(name).await?;
    if vm.state != VmState::Running {
        return Err(Error::invalid_state("Running", vm.state.as_str()));
    }
    Ok(())
}
