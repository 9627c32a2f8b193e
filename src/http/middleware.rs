//! Client identification and admission middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use crate::ratelimit::RateLimiter;

/// Identifier used when neither headers nor the socket reveal the caller.
const UNKNOWN_CLIENT: &str = "unknown";

/// Resolved identity of the caller, stored in request extensions by
/// [`rate_limit`] for downstream handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

/// Resolve the client identifier: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the peer IP. Header bytes that are not valid UTF-8 are
/// replaced rather than skipped.
pub fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = header_text(headers, "x-forwarded-for") {
        return forwarded.split(',').next().unwrap_or_default().trim().to_string();
    }

    if let Some(real_ip) = header_text(headers, "x-real-ip") {
        return real_ip;
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .filter(|v| !v.is_empty())
}

/// Reject requests from clients that are out of tokens with `429`.
pub async fn rate_limit(
    State(rate_limiter): State<Arc<RateLimiter>>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_id(request.headers(), peer);

    if !rate_limiter.allow(&client) {
        debug!(
            client_id = %client,
            path = %request.uri().path(),
            "Rejecting rate limited request"
        );
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response();
    }

    request.extensions_mut().insert(ClientId(client));
    next.run(request).await
}
