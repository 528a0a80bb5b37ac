//! Per-VM agent proxy listeners.
//!
//! Every VM runs an interactive assistant on [`crate::proxy::AGENT_PORT`].
//! For clients that cannot use subdomain routing, the daemon exposes each
//! agent on a deterministic host port derived from the VM name and
//! reverse-proxies to the VM. Listeners are lazy: they come up on first
//! request for a VM's agent URL and are all torn down at shutdown.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::multipass::{Client, VmState};
use crate::proxy::{Forwarder, AGENT_PORT};

/// First port of the agent listener range.
pub const BASE_PORT: u16 = 11000;
/// Number of ports in the range.
pub const PORT_RANGE: u32 = 1000;

/// Deterministic agent port for a VM (FNV-1a over the name).
pub fn port_for_vm(vm_name: &str) -> u16 {
    let mut hash: u32 = 2166136261;
    for byte in vm_name.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    BASE_PORT + (hash % PORT_RANGE) as u16
}

struct ListenerRecord {
    port: u16,
    cancel: CancellationToken,
}

/// Manages the agent proxy listeners.
#[derive(Clone)]
pub struct AgentManager {
    mp: Client,
    behind_tls: bool,
    listeners: Arc<DashMap<String, ListenerRecord>>,
}

struct AgentProxyState {
    forwarder: Forwarder,
    vm_ip: String,
}

impl AgentManager {
    pub fn new(mp: Client, behind_tls: bool) -> Self {
        Self {
            mp,
            behind_tls,
            listeners: Arc::new(DashMap::new()),
        }
    }

    /// Ensure a listener is serving this VM's agent; returns its port.
    pub async fn start(&self, vm_name: &str) -> Result<u16> {
        if let Some(record) = self.listeners.get(vm_name) {
            return Ok(record.port);
        }

        let vm_ip = self.verify_vm(vm_name).await?;
        let port = port_for_vm(vm_name);

        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            Error::Upstream(format!("agent listener bind on port {} failed: {}", port, e))
        })?;

        let cancel = CancellationToken::new();
        let state = Arc::new(AgentProxyState {
            forwarder: Forwarder::new(self.behind_tls),
            vm_ip,
        });
        let app = axum::Router::new()
            .fallback(agent_proxy_handler)
            .with_state(state);

        let record = ListenerRecord {
            port,
            cancel: cancel.clone(),
        };
        self.listeners.insert(vm_name.to_string(), record);

        let listeners = self.listeners.clone();
        let name = vm_name.to_string();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(cancel.cancelled_owned());
            if let Err(e) = serve.await {
                warn!(vm = %name, error = %e, "agent listener failed");
            }
            listeners.remove(&name);
            debug!(vm = %name, "agent listener closed");
        });

        info!(vm = %vm_name, port, "agent listener started");
        Ok(port)
    }

    /// Stop one VM's listener.
    pub fn stop(&self, vm_name: &str) {
        if let Some((_, record)) = self.listeners.remove(vm_name) {
            record.cancel.cancel();
        }
    }

    /// Stop every listener (daemon shutdown).
    pub fn stop_all(&self) {
        let names: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop(&name);
        }
    }

    /// Whether a listener is currently serving this VM.
    pub fn is_running(&self, vm_name: &str) -> bool {
        self.listeners.contains_key(vm_name)
    }

    /// URL a browser can use to reach this VM's agent, starting the
    /// listener if needed. `request_host` is the management request's Host
    /// header; its hostname is reused so the URL resolves for the caller.
    pub async fn agent_url(&self, vm_name: &str, request_host: &str) -> Result<String> {
        let port = self.start(vm_name).await?;
        let hostname = request_host
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(request_host);
        Ok(format!("http://{}:{}/", hostname, port))
    }

    /// Check the VM exists, runs, and has an address; returns the address.
    pub async fn verify_vm(&self, vm_name: &str) -> Result<String> {
        let vm = self.mp.info(vm_name).await?;
        if vm.state != VmState::Running {
            return Err(Error::invalid_state("Running", vm.state.as_str()));
        }
        vm.primary_ip()
            .map(str::to_string)
            .ok_or_else(|| Error::NoIpAddress {
                name: vm_name.to_string(),
            })
    }
}

async fn agent_proxy_handler(State(state): State<Arc<AgentProxyState>>, req: Request) -> Response {
    match state.forwarder.forward(req, &state.vm_ip, AGENT_PORT).await {
        Ok(resp) => resp,
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            format!("agent proxy error: {}", e),
        )
            .into_response(),
    }
}
