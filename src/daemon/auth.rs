//! Token authentication for the management API.
//!
//! One shared bearer token protects everything under `/api`. Browsers hold
//! it in an HttpOnly cookie minted by the login endpoint; API clients send
//! `Authorization: Bearer`. The cookie is checked first so WebSocket
//! connections (which cannot set headers from a browser) authenticate too.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::AppState;

/// Session cookie name, shared with the host router's agent-port rule.
pub const AUTH_COOKIE: &str = "nimbus_auth";

/// Cookie lifetime for browser logins.
const LOGIN_COOKIE_MAX_AGE_SECS: u64 = 86400 * 30;

/// Middleware rejecting requests without a valid cookie or bearer token.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let token = state.auth_token();

    if let Some(cookie) = cookie_value(&req, AUTH_COOKIE) {
        if cookie == token {
            return next.run(req).await;
        }
    }

    match bearer_token(&req) {
        Some(presented) if presented == token => next.run(req).await,
        _ => unauthorized(),
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    token: String,
}

/// `POST /api/auth/login` — validate the token and mint the cookie.
///
/// Deliberately outside the auth middleware.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Response {
    if req.token != state.auth_token() {
        return unauthorized();
    }

    let secure = if state.behind_tls() { "; Secure" } else { "" };
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}{}",
        AUTH_COOKIE,
        req.token,
        LOGIN_COOKIE_MAX_AGE_SECS,
        secure
    );

    let mut resp = Json(json!({"status": "ok"})).into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        resp.headers_mut().insert(header::SET_COOKIE, value);
    }
    resp
}

/// `POST /api/auth/logout` — clear the cookie.
pub async fn logout() -> Response {
    let cookie = format!("{}=; Path=/; HttpOnly; Max-Age=0", AUTH_COOKIE);
    let mut resp = Json(json!({"status": "ok"})).into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        resp.headers_mut().insert(header::SET_COOKIE, value);
    }
    resp
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}

fn bearer_token(req: &Request) -> Option<&str> {
    let auth = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = auth.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token)
    } else {
        None
    }
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
