//! Interactive shell sessions over WebSocket.
//!
//! Wire protocol: the client sends raw bytes (binary frames) for the PTY,
//! or a text frame `{"type":"resize","rows":R,"cols":C}` which adjusts the
//! window and is never forwarded. The server sends PTY output as binary
//! frames and pings as keepalives; all socket writes go through one mutex
//! so ping and output frames never interleave.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::daemon::error::ApiError;
use crate::daemon::AppState;
use crate::multipass::VmState;
use crate::pty::{self, PtyMaster};

/// A silent client is dead after this long without any frame (pongs count).
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Keepalive interval; must be shorter than [`PONG_WAIT`].
const PING_PERIOD: Duration = Duration::from_secs(30);
/// Budget for any single socket write.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// PTY read chunk size.
const PTY_BUF_SIZE: usize = 4096;

#[derive(Debug, Deserialize)]
pub struct ShellQuery {
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ResizeMessage {
    #[serde(rename = "type")]
    kind: String,
    rows: u16,
    cols: u16,
}

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// `GET /api/vms/:name/shell?cols=&rows=` — upgrade to a shell session.
pub async fn shell(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ShellQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let vm = match state.mp.info(&name).await {
        Ok(vm) => vm,
        Err(e) => return ApiError::from(e).into_response(),
    };
    if vm.state != VmState::Running {
        return ApiError::new(StatusCode::CONFLICT, "vm is not running").into_response();
    }

    if !origin_allowed(&headers) {
        return ApiError::new(StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    // Seed the PTY size before the child spawns so TUI programs that read
    // dimensions at startup render correctly the first time.
    let cols = query.cols.filter(|c| *c > 0).unwrap_or(80);
    let rows = query.rows.filter(|r| *r > 0).unwrap_or(24);

    ws.on_upgrade(move |socket| async move {
        let mut cmd = Command::new("multipass");
        cmd.arg("shell").arg(&name);
        cmd.env("TERM", "xterm-256color")
            .env("LANG", "en_US.UTF-8")
            .env("LC_ALL", "en_US.UTF-8");
        run_session(socket, cmd, rows, cols).await;
        debug!(vm = %name, "shell session ended");
    })
}

/// Drive one session: child on a PTY, three tasks, one teardown.
async fn run_session(socket: WebSocket, mut cmd: Command, rows: u16, cols: u16) {
    let (master, slave) = match pty::open_pty(rows, cols) {
        Ok(pair) => pair,
        Err(e) => {
            let mut socket = socket;
            let _ = socket
                .send(Message::Text(format!("failed to open pty: {}", e)))
                .await;
            return;
        }
    };

    let mut child = match pty::spawn_on_pty(&mut cmd, slave) {
        Ok(child) => child,
        Err(e) => {
            let mut socket = socket;
            let _ = socket
                .send(Message::Text(format!("failed to start shell: {}", e)))
                .await;
            return;
        }
    };

    let master = Arc::new(master);
    let (sink, mut stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));
    let cancel = CancellationToken::new();

    let heartbeat = tokio::spawn(heartbeat_loop(sink.clone(), cancel.clone()));
    let output = tokio::spawn(pump_pty_output(master.clone(), sink.clone(), cancel.clone()));

    // Client → PTY, with the read deadline refreshed by every frame.
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = tokio::time::timeout(PONG_WAIT, stream.next()) => frame,
        };
        match frame {
            // Deadline expired without even a pong: dead browser tab.
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(msg))) => match msg {
                Message::Text(text) => {
                    if let Some((rows, cols)) = parse_resize(text.as_bytes()) {
                        if let Err(e) = master.resize(rows, cols) {
                            warn!(error = %e, "pty resize failed");
                        }
                        continue;
                    }
                    if master.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Message::Binary(data) => {
                    if master.write_all(&data).await.is_err() {
                        break;
                    }
                }
                // Arrival alone refreshed the deadline.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => break,
            },
        }
    }

    // Teardown. Cancellation is idempotent, and joining the tasks before
    // reaping means nothing touches the PTY after it closes.
    cancel.cancel();
    let _ = heartbeat.await;
    let _ = output.await;

    let _ = child.start_kill();
    let _ = child.wait().await;

    let mut sink = sink.lock().await;
    let _ = tokio::time::timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
}

/// Ping every [`PING_PERIOD`]; a failed or stalled write ends the session.
async fn heartbeat_loop(sink: WsSink, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PING_PERIOD);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let mut sink = sink.lock().await;
                let sent = tokio::time::timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

/// Forward PTY output as binary frames until EOF or error.
async fn pump_pty_output(master: Arc<PtyMaster>, sink: WsSink, cancel: CancellationToken) {
    let mut buf = [0u8; PTY_BUF_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = master.read(&mut buf) => read,
        };
        match read {
            // EOF or EIO: the child went away.
            Ok(0) | Err(_) => {
                cancel.cancel();
                return;
            }
            Ok(n) => {
                let mut sink = sink.lock().await;
                let sent =
                    tokio::time::timeout(WRITE_WAIT, sink.send(Message::Binary(buf[..n].to_vec())))
                        .await;
                if !matches!(sent, Ok(Ok(()))) {
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

/// Recognize a resize control frame: first byte `{` and well-formed JSON
/// with `type == "resize"`. Anything else is PTY input.
fn parse_resize(data: &[u8]) -> Option<(u16, u16)> {
    if data.first() != Some(&b'{') {
        return None;
    }
    let msg: ResizeMessage = serde_json::from_slice(data).ok()?;
    (msg.kind == "resize").then_some((msg.rows, msg.cols))
}

/// Reject cross-site WebSocket connections.
///
/// Allowed: no Origin header (curl, native clients), localhost variants,
/// and same-origin requests.
fn origin_allowed(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };

    let origin_host = match origin.split_once("://") {
        Some((_, rest)) => rest.split('/').next().unwrap_or(rest),
        None => return false,
    };
    let origin_host = strip_port(origin_host);

    if matches!(origin_host, "localhost" | "127.0.0.1" | "::1") {
        return true;
    }

    let request_host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(strip_port)
        .unwrap_or_default();
    origin_host == request_host
}

/// Hostname without the port; handles bracketed IPv6 literals.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((hostname, port)) if port.bytes().all(|b| b.is_ascii_digit()) => hostname,
        _ => host,
    }
}
