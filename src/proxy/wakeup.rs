//! Wake-on-request: start a dormant VM while serving a loading page.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::mapref::entry::Entry;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::multipass::Client;

use super::router::VmRouter;

/// Total budget for a wake attempt: start plus boot plus service listen.
const WAKE_DEADLINE: Duration = Duration::from_secs(90);
/// Per-attempt TCP dial budget.
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause between poll attempts.
const POLL_DELAY: Duration = Duration::from_secs(1);

/// Begin waking a VM unless a wake is already in flight.
///
/// The ticket map insert is the compare-and-set: exactly one caller wins
/// and spawns the start task; everyone else just gets the loading page.
/// The ticket clears when the attempt finishes, success or not, so a
/// failed start is retried by the next request.
pub(super) fn wake(router: &Arc<VmRouter>, vm_name: &str, port: u16) {
    match router.waking_map().entry(vm_name.to_string()) {
        Entry::Occupied(_) => return,
        Entry::Vacant(slot) => {
            slot.insert(());
        }
    }

    let router = router.clone();
    let name = vm_name.to_string();
    tokio::spawn(async move {
        match router.engine().start(&name).await {
            Err(e) => {
                // Never surfaced to the requester; the placeholder keeps
                // refreshing and the next request re-attempts.
                warn!(vm = %name, error = %e, "wake start failed");
            }
            Ok(()) => {
                let ready = wait_for_port(router.engine(), &name, port).await;
                debug!(vm = %name, port, ready, "wake wait finished");
            }
        }
        router.waking_map().remove(&name);
    });
}

/// Poll until the VM has an address and the port accepts TCP.
async fn wait_for_port(mp: &Client, vm_name: &str, port: u16) -> bool {
    let deadline = Instant::now() + WAKE_DEADLINE;
    while Instant::now() < deadline {
        if let Ok(vm) = mp.info(vm_name).await {
            if let Some(ip) = vm.primary_ip() {
                let addr = format!("{}:{}", ip, port);
                if let Ok(Ok(conn)) = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await
                {
                    drop(conn);
                    return true;
                }
            }
        }
        tokio::time::sleep(POLL_DELAY).await;
    }
    false
}

/// The self-refreshing placeholder served while a VM wakes.
pub(super) fn loading_page(vm_name: &str, port: u16) -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Starting {vm}...</title>
    <meta http-equiv="refresh" content="2">
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: linear-gradient(135deg, #1a1a2e 0%, #16213e 100%);
            color: #eee;
        }}
        .container {{ text-align: center; padding: 40px; }}
        .spinner {{
            width: 60px;
            height: 60px;
            border: 4px solid rgba(255,255,255,0.1);
            border-top-color: #00d4ff;
            border-radius: 50%;
            animation: spin 1s linear infinite;
            margin: 0 auto 30px;
        }}
        @keyframes spin {{ to {{ transform: rotate(360deg); }} }}
        h1 {{ font-size: 28px; margin-bottom: 10px; font-weight: 500; }}
        p {{ color: #888; margin: 5px 0; }}
        .vm-name {{ color: #00d4ff; font-family: monospace; font-size: 20px; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="spinner"></div>
        <h1>Starting VM</h1>
        <p class="vm-name">{vm}</p>
        <p>Waiting for port {port} to become available...</p>
        <p>This page refreshes automatically.</p>
    </div>
</body>
</html>"#,
        vm = vm_name,
        port = port
    );

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        html,
    )
        .into_response()
}
