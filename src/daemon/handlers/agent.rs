//! Agent URL handler.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use serde_json::{json, Value};

use crate::daemon::error::ApiResult;
use crate::daemon::AppState;
use crate::proxy::AGENT_PORT;

/// `GET /api/vms/:name/agent-url`
///
/// With a public domain and TLS in front, hand out the subdomain-routed
/// URL (token in the query so the router can mint the session cookie).
/// Otherwise fall back to a dedicated host-port listener.
pub async fn agent_url(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    state.agents.verify_vm(&name).await?;

    let url = match state.domain().filter(|_| state.behind_tls()) {
        Some(domain) => format!(
            "https://{}-{}.{}/?token={}",
            name,
            AGENT_PORT,
            domain,
            state.auth_token()
        ),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("localhost");
            state.agents.agent_url(&name, host).await?
        }
    };

    Ok(Json(json!({"url": url})))
}
