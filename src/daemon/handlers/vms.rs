//! VM lifecycle handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::daemon::error::{ApiError, ApiResult};
use crate::daemon::AppState;
use crate::launcher::CreateSpec;
use crate::multipass::{ListInstance, VmInfo};
use crate::network::NetworkConfig;

/// `GET /api/defaults`
pub async fn defaults(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cfg = state.config.read();
    Json(json!({
        "cpu": cfg.defaults.cpu,
        "mem": cfg.defaults.mem,
        "disk": cfg.defaults.disk,
    }))
}

/// `GET /api/vms`
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ListInstance>>> {
    Ok(Json(state.mp.list().await?))
}

/// `GET /api/vms/:name`
pub async fn info(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<VmInfo>> {
    Ok(Json(state.mp.info(&name).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub mem: String,
    #[serde(default)]
    pub disk: String,
    #[serde(default)]
    pub cloud_init: Option<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
}

/// `POST /api/vms`
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVmRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let spec = CreateSpec {
        name: req.name.clone(),
        cpu: req.cpu,
        mem: req.mem,
        disk: req.disk,
        cloud_init: req.cloud_init,
        image: req.image,
        network: req.network,
    };

    // Snapshot the config outside the await; the guard is not Send.
    let cfg = state.config.read().clone();
    state.launcher.launch(&cfg, spec).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"status": "created", "name": req.name})),
    ))
}

/// `DELETE /api/vms/:name` — purges by default.
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.launcher.delete(&name, true).await?;
    Ok(Json(json!({"status": "deleted"})))
}

#[derive(Debug, Deserialize)]
pub struct StateChangeRequest {
    pub action: String,
}

/// `POST /api/vms/:name/state`
pub async fn change_state(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<StateChangeRequest>,
) -> ApiResult<Json<Value>> {
    let status = match req.action.as_str() {
        "start" => {
            state.mp.start(&name).await?;
            "started"
        }
        "stop" => {
            state.mp.stop(&name).await?;
            "stopped"
        }
        "restart" => {
            state.mp.restart(&name).await?;
            "restarted"
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "invalid action {:?}, must be 'start', 'stop', or 'restart'",
                other
            )));
        }
    };
    Ok(Json(json!({"status": status})))
}

#[derive(Debug, Deserialize)]
pub struct CloneRequest {
    pub new_name: String,
}

/// `POST /api/vms/:name/clone`
pub async fn clone(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<CloneRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state.launcher.clone_vm(&name, &req.new_name).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"status": "cloned", "name": req.new_name})),
    ))
}
