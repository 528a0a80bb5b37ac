//! Network policy handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::daemon::error::ApiResult;
use crate::daemon::AppState;
use crate::error::Error;
use crate::multipass::VmState;
use crate::network::{self, NetworkConfig};

async fn require_running(state: &AppState, name: &str) -> Result<(), Error> {
    let vm = state.mp.info(name).await?;
    if vm.state != VmState::Running {
        return Err(Error::invalid_state("Running", vm.state.as_str()));
    }
    Ok(())
}

/// `GET /api/vms/:name/network` — the VM's copy is canonical.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<NetworkConfig>> {
    require_running(&state, &name).await?;
    let config = state
        .applier
        .current_config(&name)
        .await?
        .unwrap_or_default();
    Ok(Json(config))
}

/// `PUT /api/vms/:name/network`
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(config): Json<NetworkConfig>,
) -> ApiResult<Json<Value>> {
    require_running(&state, &name).await?;
    network::validate(&config)?;
    state.applier.apply_to_vm(&name, &config).await?;
    Ok(Json(json!({"status": "applied", "mode": config.mode.as_str()})))
}

/// `DELETE /api/vms/:name/network` — drop all restrictions.
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    require_running(&state, &name).await?;
    state.applier.remove_from_vm(&name).await?;
    Ok(Json(json!({"status": "removed"})))
}

/// `POST /api/vms/:name/network/apply` — re-run the installed policy.
pub async fn apply(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    require_running(&state, &name).await?;
    let config = state
        .applier
        .current_config(&name)
        .await?
        .ok_or_else(|| Error::validation("no network config to apply"))?;
    state.applier.apply_to_vm(&name, &config).await?;
    Ok(Json(json!({"status": "applied", "mode": config.mode.as_str()})))
}

/// `GET /api/network/defaults`
pub async fn get_defaults(State(state): State<Arc<AppState>>) -> Json<NetworkConfig> {
    let config = state.config.read().defaults.network.clone().unwrap_or_default();
    Json(config)
}

/// `PUT /api/network/defaults`
pub async fn set_defaults(
    State(state): State<Arc<AppState>>,
    Json(config): Json<NetworkConfig>,
) -> ApiResult<Json<Value>> {
    network::validate(&config)?;
    let snapshot = {
        let mut cfg = state.config.write();
        cfg.defaults.network = Some(config.clone());
        cfg.clone()
    };
    snapshot.save()?;
    Ok(Json(json!({"status": "saved", "mode": config.mode.as_str()})))
}
