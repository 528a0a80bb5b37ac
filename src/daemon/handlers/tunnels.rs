//! Tunnel handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::daemon::error::ApiResult;
use crate::daemon::AppState;
use crate::error::Error;
use crate::tunnel::TunnelInfo;

/// `GET /api/tunnels`
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<TunnelInfo>> {
    Json(state.tunnels.list())
}

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    pub vm_name: String,
    pub vm_port: u16,
}

/// `POST /api/tunnels`
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTunnelRequest>,
) -> ApiResult<(StatusCode, Json<TunnelInfo>)> {
    if req.vm_name.is_empty() || req.vm_port == 0 {
        return Err(Error::validation("vm_name and vm_port are required").into());
    }
    let tunnel = state.tunnels.create(&req.vm_name, req.vm_port).await?;
    Ok((StatusCode::CREATED, Json(tunnel)))
}

/// `DELETE /api/tunnels/:port`
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(port): Path<u16>,
) -> ApiResult<Json<Value>> {
    state.tunnels.delete(port)?;
    Ok(Json(json!({"status": "closed"})))
}
