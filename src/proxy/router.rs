//! Host parsing, state dispatch, and the reverse-proxy data path.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::daemon::auth::AUTH_COOKIE;
use crate::error::Error;
use crate::multipass::{Client, VmState};

use super::forward::Forwarder;
use super::wakeup;

/// Well-known agent port inside every VM; requests to it require the token.
pub const AGENT_PORT: u16 = 1234;

/// Header alternative to the `?token=` query parameter.
pub const TOKEN_HEADER: &str = "x-nimbus-token";

/// `<vm>-<port>.<host>[:<port>]`. Deliberately permissive with dashes:
/// `myvm--8080.localhost` parses as VM `myvm-` on port 8080.
static HOST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9][A-Za-z0-9-]*)-(\d+)\.(localhost|[A-Za-z0-9.-]+)(:\d+)?$")
        .expect("host pattern")
});

/// Routes VM-shaped hosts; everything else passes through.
pub struct VmRouter {
    mp: Client,
    forwarder: Forwarder,
    /// Wake tickets: present while a start attempt is in flight.
    waking: DashMap<String, ()>,
    auth_token: Option<String>,
}

impl VmRouter {
    pub fn new(mp: Client, auth_token: Option<String>, behind_tls: bool) -> Arc<Self> {
        Arc::new(Self {
            mp,
            forwarder: Forwarder::new(behind_tls),
            waking: DashMap::new(),
            auth_token,
        })
    }

    /// Extract `(vm_name, vm_port)` from a Host header value.
    ///
    /// Ports that overflow u16 fail the parse and fall through with the
    /// rest of the non-matching hosts.
    pub fn parse_host(host: &str) -> Option<(String, u16)> {
        let caps = HOST_PATTERN.captures(host)?;
        let port: u16 = caps[2].parse().ok()?;
        Some((caps[1].to_string(), port))
    }

    pub(super) fn engine(&self) -> &Client {
        &self.mp
    }

    pub(super) fn waking_map(&self) -> &DashMap<String, ()> {
        &self.waking
    }

    /// Dispatch one matched request.
    pub(super) async fn handle_vm_request(
        self: &Arc<Self>,
        req: Request,
        vm_name: &str,
        vm_port: u16,
    ) -> Response {
        // Agent-port rule: the in-VM assistant is token-protected.
        let set_cookie = match self.check_agent_auth(&req, vm_port) {
            Ok(set_cookie) => set_cookie,
            Err(resp) => return resp,
        };

        let vm = match self.mp.info(vm_name).await {
            Ok(vm) => vm,
            Err(Error::VmNotFound { .. }) => {
                return text_response(
                    StatusCode::NOT_FOUND,
                    format!("VM '{}' not found", vm_name),
                );
            }
            Err(e) => {
                warn!(vm = %vm_name, error = %e, "vm lookup failed");
                return text_response(StatusCode::BAD_GATEWAY, format!("engine error: {}", e));
            }
        };

        let mut resp = match vm.state {
            VmState::Running => match vm.primary_ip() {
                Some(ip) => {
                    let ip = ip.to_string();
                    match self.forwarder.forward(req, &ip, vm_port).await {
                        Ok(resp) => resp,
                        Err(e) => {
                            debug!(vm = %vm_name, error = %e, "proxy failed");
                            text_response(StatusCode::BAD_GATEWAY, format!("proxy error: {}", e))
                        }
                    }
                }
                None => text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "VM has no IP address".to_string(),
                ),
            },
            state if state.is_dormant() => {
                // Stopped, suspended, or mid-transition: serve the loading
                // page. The ticket CAS makes sure only one start runs.
                wakeup::wake(self, vm_name, vm_port);
                wakeup::loading_page(vm_name, vm_port)
            }
            state => text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("VM in unexpected state: {}", state),
            ),
        };

        if set_cookie {
            if let Some(token) = &self.auth_token {
                let cookie = format!(
                    "{}={}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=86400",
                    AUTH_COOKIE, token
                );
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    resp.headers_mut().append(header::SET_COOKIE, value);
                }
            }
        }
        resp
    }

    /// Token check for the agent port. Returns whether a cookie should be
    /// set on the response (query/header hits only), or the 401 to serve.
    fn check_agent_auth(&self, req: &Request, vm_port: u16) -> Result<bool, Response> {
        if vm_port != AGENT_PORT {
            return Ok(false);
        }
        let Some(token) = &self.auth_token else {
            return Ok(false);
        };

        // Order: query parameter, custom header, then session cookie.
        if query_param(req.uri(), "token") == Some(token.as_str()) {
            return Ok(true);
        }
        if req
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            == Some(token.as_str())
        {
            return Ok(true);
        }
        if cookie_value(req, AUTH_COOKIE) == Some(token.as_str()) {
            return Ok(false);
        }

        Err(text_response(
            StatusCode::UNAUTHORIZED,
            "agent access requires a token".to_string(),
        ))
    }

}

/// Middleware: offered every request before the management routes.
pub async fn vm_request_middleware(
    State(router): State<Arc<VmRouter>>,
    req: Request,
    next: Next,
) -> Response {
    // HTTP/2 requests carry the authority in the URI instead of a header.
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();

    match VmRouter::parse_host(&host) {
        Some((vm_name, vm_port)) => router.handle_vm_request(req, &vm_name, vm_port).await,
        None => next.run(req).await,
    }
}

fn text_response(status: StatusCode, body: String) -> Response {
    (status, body).into_response()
}

fn query_param<'a>(uri: &'a Uri, name: &str) -> Option<&'a str> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn cookie_value<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    let cookies = req.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies
        .split(';')
        .map(str::trim)
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}
