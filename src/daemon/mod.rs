//! Daemon assembly: compose the subsystems behind one HTTP server.
//!
//! Request flow: the VM host router is the outermost layer — requests whose
//! Host header names a VM never reach the management routes. Everything
//! under `/api` (except login/logout) sits behind the token middleware.

pub mod auth;
pub mod error;
pub mod handlers;

mod idle;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::RwLock;
use serde_json::json;
use tokio::net::TcpListener;
use tower::Service;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use idle::IdleTimeout;

use crate::agent::AgentManager;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::multipass::Client;
use crate::network::Applier;
use crate::proxy::{vm_request_middleware, VmRouter};
use crate::tunnel;
use crate::watchdog::Watchdog;

/// Budget for one management request. The streaming endpoints (shell,
/// proxy) are exempt.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Socket-level budget for reading a request's headers.
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Connections with no read or write activity this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long graceful shutdown waits for connections to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state behind every management handler.
pub struct AppState {
    pub mp: Client,
    pub config: RwLock<Config>,
    pub tunnels: tunnel::Manager,
    pub agents: AgentManager,
    pub applier: Applier,
    pub launcher: Launcher,
}

impl AppState {
    pub fn auth_token(&self) -> String {
        self.config.read().auth_token.clone()
    }

    pub fn behind_tls(&self) -> bool {
        self.config.read().behind_tls
    }

    pub fn domain(&self) -> Option<String> {
        self.config.read().domain.clone()
    }
}

/// The nimbus daemon.
pub struct Server {
    state: Arc<AppState>,
    vm_router: Arc<VmRouter>,
    watchdog: Watchdog,
    addr: SocketAddr,
}

impl Server {
    pub fn new(config: Config, mp: Client, addr: SocketAddr) -> Self {
        let behind_tls = config.behind_tls;
        let timeout = Duration::from_secs(config.shutdown_timeout_mins * 60);
        let vm_router = VmRouter::new(mp.clone(), Some(config.auth_token.clone()), behind_tls);
        let watchdog = Watchdog::new(mp.clone(), timeout);

        let state = Arc::new(AppState {
            mp: mp.clone(),
            config: RwLock::new(config),
            tunnels: tunnel::Manager::new(mp.clone()),
            agents: AgentManager::new(mp.clone(), behind_tls),
            applier: Applier::new(mp.clone()),
            launcher: Launcher::new(mp),
        });

        Self {
            state,
            vm_router,
            watchdog,
            addr,
        }
    }

    /// Bind, serve, and tear down on ctrl-c / SIGTERM.
    ///
    /// A failed bind is fatal; everything after that is recoverable. The
    /// accept loop drives hyper directly so socket-level timeouts apply:
    /// a header-read budget per request and an inactivity bound on every
    /// connection, including idle keep-alive sockets.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::config("bind", format!("{}: {}", self.addr, e)))?;
        info!(addr = %self.addr, "nimbus daemon listening");

        let watchdog_task = self.watchdog.spawn();
        let app = build_router(self.state.clone(), self.vm_router.clone());

        let mut builder = ConnBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(READ_HEADER_TIMEOUT);
        builder.http2().timer(TokioTimer::new());

        let graceful = GracefulShutdown::new();
        let mut shutdown = std::pin::pin!(shutdown_signal());

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let io = TokioIo::new(IdleTimeout::new(stream, IDLE_TIMEOUT));
                    let app = app.clone();
                    let service =
                        service_fn(move |req: hyper::Request<Incoming>| app.clone().call(req));
                    let conn = graceful
                        .watch(builder.serve_connection_with_upgrades(io, service).into_owned());
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            debug!(%peer, error = %e, "connection ended");
                        }
                    });
                }
            }
        }

        // Orderly teardown: stop the watchdog, drain tunnels, drop agent
        // listeners. VM state lives in the engine, so nothing to persist.
        self.watchdog.shutdown();
        self.state.tunnels.shutdown();
        self.state.agents.stop_all();

        tokio::select! {
            _ = graceful.shutdown() => {}
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                warn!("shutdown grace period expired, dropping open connections");
            }
        }
        let _ = watchdog_task.await;
        info!("nimbus daemon stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Assemble the full router.
pub fn build_router(state: Arc<AppState>, vm_router: Arc<VmRouter>) -> Router {
    // Streaming endpoints must outlive the API timeout.
    let shell_route = Router::new().route("/vms/:name/shell", get(handlers::shell::shell));

    let api = Router::new()
        .route("/defaults", get(handlers::vms::defaults))
        .route("/vms", get(handlers::vms::list).post(handlers::vms::create))
        .route(
            "/vms/:name",
            get(handlers::vms::info).delete(handlers::vms::remove),
        )
        .route("/vms/:name/state", post(handlers::vms::change_state))
        .route("/vms/:name/clone", post(handlers::vms::clone))
        .route(
            "/vms/:name/snapshots",
            get(handlers::snapshots::list).post(handlers::snapshots::create),
        )
        .route(
            "/vms/:name/snapshots/restore",
            post(handlers::snapshots::restore),
        )
        .route(
            "/vms/:name/snapshots/:snap",
            delete(handlers::snapshots::remove),
        )
        .route(
            "/vms/:name/files",
            get(handlers::files::browse).post(handlers::files::upload),
        )
        .route("/vms/:name/files/download", get(handlers::files::download))
        .route(
            "/vms/:name/mounts",
            get(handlers::mounts::list)
                .post(handlers::mounts::add)
                .delete(handlers::mounts::remove),
        )
        .route(
            "/tunnels",
            get(handlers::tunnels::list).post(handlers::tunnels::create),
        )
        .route("/tunnels/:port", delete(handlers::tunnels::remove))
        .route(
            "/vms/:name/network",
            get(handlers::network::get)
                .put(handlers::network::update)
                .delete(handlers::network::remove),
        )
        .route("/vms/:name/network/apply", post(handlers::network::apply))
        .route(
            "/network/defaults",
            get(handlers::network::get_defaults).put(handlers::network::set_defaults),
        )
        .route("/vms/:name/agent-url", get(handlers::agent::agent_url))
        .layer(TimeoutLayer::new(API_TIMEOUT))
        .merge(shell_route)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .nest("/api", api)
        .fallback(|| async {
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "not found"})),
            )
        })
        .layer(middleware::from_fn_with_state(
            vm_router,
            vm_request_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
