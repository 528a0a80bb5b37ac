//! File browse and transfer handlers.
//!
//! Browsing lists a directory via `exec ls -la`; transfers stage through a
//! host temp file because the engine's transfer works on paths, not
//! streams.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::daemon::error::{ApiError, ApiResult};
use crate::daemon::AppState;
use crate::error::Error;
use crate::multipass::VmState;

const DEFAULT_BROWSE_PATH: &str = "/home/ubuntu";

#[derive(Debug, PartialEq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    #[serde(default)]
    pub path: Option<String>,
}

/// `GET /api/vms/:name/files?path=...`
pub async fn browse(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<BrowseQuery>,
) -> ApiResult<Json<Value>> {
    let path = query.path.unwrap_or_else(|| DEFAULT_BROWSE_PATH.to_string());
    require_running(&state, &name).await?;

    let output = state.mp.exec(&name, &["ls", "-la", &path]).await?;
    let entries = parse_ls_output(&output);

    Ok(Json(json!({"path": path, "entries": entries})))
}

#[derive(Debug, Deserialize)]
pub struct TransferQuery {
    pub path: String,
}

/// `POST /api/vms/:name/files?path=...` — multipart upload into the VM.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<TransferQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    require_running(&state, &name).await?;

    let field = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("multipart read failed: {}", e)))?
        .ok_or_else(|| ApiError::bad_request("a 'file' field is required"))?;

    let filename = field.file_name().unwrap_or("upload").to_string();
    let data = field
        .bytes()
        .await
        .map_err(|e| ApiError::bad_request(format!("multipart read failed: {}", e)))?;

    let staging = tempfile::Builder::new()
        .prefix("nimbus-upload-")
        .tempdir()
        .map_err(Error::from)?;
    let host_path = staging.path().join(&filename);
    tokio::fs::write(&host_path, &data).await.map_err(Error::from)?;

    // Trailing slash means "into this directory".
    let target_path = if query.path.ends_with('/') {
        format!("{}{}", query.path, filename)
    } else {
        query.path.clone()
    };

    state
        .mp
        .transfer(
            &host_path.to_string_lossy(),
            &format!("{}:{}", name, target_path),
        )
        .await?;

    Ok(Json(json!({"status": "uploaded", "path": target_path})))
}

/// `GET /api/vms/:name/files/download?path=...`
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<TransferQuery>,
) -> ApiResult<Response> {
    require_running(&state, &name).await?;

    let staging = tempfile::Builder::new()
        .prefix("nimbus-download-")
        .tempdir()
        .map_err(Error::from)?;
    let host_path = staging.path().join("download");

    state
        .mp
        .transfer(
            &format!("{}:{}", name, query.path),
            &host_path.to_string_lossy(),
        )
        .await?;

    let content = tokio::fs::read(&host_path).await.map_err(Error::from)?;
    let filename = query
        .path
        .rsplit('/')
        .next()
        .filter(|f| !f.is_empty())
        .unwrap_or("download");

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
        ],
        content,
    )
        .into_response())
}

async fn require_running(state: &AppState, name: &str) -> Result<(), Error> {
    let vm = state.mp.info(name).await?;
    if vm.state != VmState::Running {
        return Err(Error::invalid_state("Running", vm.state.as_str()));
    }
    Ok(())
}

/// Parse `ls -la` output into entries, skipping `.`, `..`, and the total.
fn parse_ls_output(output: &str) -> Vec<FileEntry> {
    let mut entries = Vec::new();
    for line in output.trim().lines() {
        if line.is_empty() || line.starts_with("total") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let name = fields[8..].join(" ");
        if name == "." || name == ".." {
            continue;
        }
        entries.push(FileEntry {
            is_dir: fields[0].starts_with('d'),
            size: fields[4].parse().unwrap_or(0),
            mode: fields[0].to_string(),
            name,
        });
    }
    entries
}
