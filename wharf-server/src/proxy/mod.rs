//! HTTP/HTTPS reverse proxy built on Pingora (§4.2).
//!
//! Routing is host-only: a normalized Host header looks up a [`Route`] in
//! the [`Store`] and the request is forwarded to its target verbatim. There
//! is no load balancer and no cold-start spawning here — a host either has
//! a healthy target or it doesn't.

use std::sync::Arc;

use async_trait::async_trait;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use wharf_core::Route;

use crate::routing::{acme_challenge_token, is_acme_challenge_path, normalize_host};
use crate::store::Store;
use crate::tls::ChallengeHandler;

/// Request/response headers that must not be forwarded across a hop
/// (RFC 7230 §6.1), except `Connection` and `Upgrade` which are kept so a
/// WebSocket upgrade can pass through untouched.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

fn is_websocket_upgrade(header: &RequestHeader) -> bool {
    header
        .headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn strip_hop_by_hop(header: &mut RequestHeader) {
    for name in HOP_BY_HOP_HEADERS {
        header.remove_header(*name);
    }
}

/// Request context carrying the resolved route across proxy hooks.
pub struct RequestCtx {
    route: Option<Route>,
    is_https: bool,
    acme_response: Option<String>,
}

pub struct WharfProxy {
    store: Arc<Store>,
    challenge_handler: Option<ChallengeHandler>,
    redirect_http_to_https: bool,
}

impl WharfProxy {
    pub fn new(store: Arc<Store>, redirect_http_to_https: bool) -> Self {
        Self {
            store,
            challenge_handler: None,
            redirect_http_to_https,
        }
    }

    pub fn with_acme_challenges(
        store: Arc<Store>,
        redirect_http_to_https: bool,
        handler: ChallengeHandler,
    ) -> Self {
        Self {
            store,
            challenge_handler: Some(handler),
            redirect_http_to_https,
        }
    }

    async fn write_plain_response(
        session: &mut Session,
        status: u16,
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let mut header = ResponseHeader::build(status, None)?;
        header.insert_header("Content-Type", "text/plain")?;
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session
            .write_response_body(Some(body.into().into()), true)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyHttp for WharfProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx {
            route: None,
            is_https: false,
            acme_response: None,
        }
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let path = session.req_header().uri.path().to_string();

        if is_acme_challenge_path(&path) {
            if let Some(handler) = &self.challenge_handler
                && let Some(token) = acme_challenge_token(&path)
            {
                if let Some(response) = handler.handle(token) {
                    tracing::info!(path = %path, "serving ACME HTTP-01 challenge response");
                    ctx.acme_response = Some(response);
                    return Ok(true);
                }
                tracing::warn!(path = %path, "ACME challenge token not found");
            }
            Self::write_plain_response(session, 404, "not found").await?;
            return Ok(true);
        }

        let host = session
            .req_header()
            .headers
            .get("host")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        let normalized = normalize_host(&host);

        ctx.is_https = session
            .digest()
            .map(|d| d.ssl_digest.is_some())
            .unwrap_or(false);

        if !ctx.is_https && self.redirect_http_to_https {
            let location = format!("https://{normalized}{path}");
            let mut header = ResponseHeader::build(308, None)?;
            header.insert_header("Location", &location)?;
            header.insert_header("Content-Type", "text/plain")?;
            session
                .write_response_header(Box::new(header), false)
                .await?;
            session
                .write_response_body(Some("redirecting to https".into()), true)
                .await?;
            return Ok(true);
        }

        let Some(route) = self.store.get_route(&normalized) else {
            Self::write_plain_response(session, 404, "no route for host").await?;
            return Ok(true);
        };

        if !route.healthy {
            Self::write_plain_response(session, 502, "Service unavailable").await?;
            return Ok(true);
        }

        ctx.route = Some(route);
        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        if ctx.acme_response.is_some() {
            return Err(Error::new(ErrorType::InternalError));
        }

        let route = ctx
            .route
            .as_ref()
            .ok_or_else(|| Error::new(ErrorType::ConnectNoRoute))?;

        let mut peer = HttpPeer::new(route.target.clone(), false, String::new());
        peer.options.connection_timeout = Some(crate::defaults::BACKEND_CONNECT_TIMEOUT);
        peer.options.total_connection_timeout = Some(crate::defaults::BACKEND_CONNECT_TIMEOUT);
        peer.options.read_timeout = Some(crate::defaults::BACKEND_HEADER_TIMEOUT);
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let keep_connection_header = is_websocket_upgrade(session.req_header());
        strip_hop_by_hop(upstream_request);
        if !keep_connection_header {
            upstream_request.remove_header("connection");
            upstream_request.remove_header("upgrade");
        }

        let proto = if ctx.is_https { "https" } else { "http" };
        upstream_request.insert_header("X-Forwarded-Proto", proto)?;

        if let Some(client_addr) = session.client_addr() {
            upstream_request.insert_header("X-Forwarded-For", client_addr.to_string())?;
        }

        if let Some(route) = &ctx.route {
            upstream_request.insert_header("X-Forwarded-Host", route.host.clone())?;
        }

        Ok(())
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        _upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(response) = &ctx.acme_response {
            let mut header = ResponseHeader::build(200, None)?;
            header.insert_header("Content-Type", "text/plain")?;
            header.insert_header("Content-Length", response.len().to_string())?;
            session
                .write_response_header(Box::new(header), false)
                .await?;
            session
                .write_response_body(Some(response.clone().into()), true)
                .await?;
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);
        let host = ctx
            .route
            .as_ref()
            .map(|r| r.host.as_str())
            .unwrap_or("-");
        let path = session.req_header().uri.path();
        let method = session.req_header().method.as_str();

        tracing::info!(
            host = host,
            method = method,
            path = path,
            status = status,
            https = ctx.is_https,
            "request completed"
        );
    }
}
