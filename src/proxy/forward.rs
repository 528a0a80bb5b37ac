//! The reverse-proxy data path, shared by the host router and the agent
//! listeners.
//!
//! Requests are re-targeted and streamed through a pooled hyper client
//! rather than re-encoded, which keeps bodies, trailers, SSE, and
//! WebSocket upgrades intact.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{self, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::debug;

use crate::error::{Error, Result};

type ProxyClient = HyperClient<HttpConnector, Body>;

/// Streams requests to a VM service.
#[derive(Clone)]
pub(crate) struct Forwarder {
    http: ProxyClient,
    behind_tls: bool,
}

impl Forwarder {
    pub fn new(behind_tls: bool) -> Self {
        Self {
            http: HyperClient::builder(TokioExecutor::new()).build_http(),
            behind_tls,
        }
    }

    /// Forward `req` to `http://ip:port`, preserving method, headers,
    /// streaming bodies, and bidirectional upgrades.
    pub async fn forward(&self, mut req: Request, ip: &str, port: u16) -> Result<Response> {
        let original_host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target: Uri = format!("http://{}:{}{}", ip, port, path_and_query)
            .parse()
            .map_err(|e| Error::Upstream(format!("bad target uri: {}", e)))?;

        // Snag the client side of a potential upgrade before the request
        // moves into the proxy client.
        let wants_upgrade = req.headers().contains_key(header::UPGRADE);
        let client_upgrade = wants_upgrade.then(|| hyper::upgrade::on(&mut req));

        *req.uri_mut() = target;
        // Rewrite Host to the target so guest virtual hosting resolves;
        // the original host rides in X-Forwarded-Host.
        let host_value = HeaderValue::from_str(&format!("{}:{}", ip, port))
            .map_err(|e| Error::Upstream(e.to_string()))?;
        req.headers_mut().insert(header::HOST, host_value);
        if let Ok(value) = HeaderValue::from_str(&original_host) {
            req.headers_mut().insert("x-forwarded-host", value);
        }
        req.headers_mut().insert(
            "x-forwarded-proto",
            HeaderValue::from_static(if self.behind_tls { "https" } else { "http" }),
        );

        let mut upstream = self
            .http
            .request(req)
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        if upstream.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut upstream);
                tokio::spawn(async move {
                    let (client_io, upstream_io) =
                        match tokio::try_join!(client_upgrade, upstream_upgrade) {
                            Ok(pair) => pair,
                            Err(e) => {
                                debug!(error = %e, "upgrade handshake failed");
                                return;
                            }
                        };
                    let mut client_io = TokioIo::new(client_io);
                    let mut upstream_io = TokioIo::new(upstream_io);
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                    {
                        debug!(error = %e, "upgraded connection ended");
                    }
                });
            }
        }

        Ok(upstream.map(Body::new))
    }
}
