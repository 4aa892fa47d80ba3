use std::net::{IpAddr, SocketAddr};

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hyper::StatusCode;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::AppState;

pub const HEARTBEAT_TOKEN_HEADER: &str = "x-heartbeat-token";

/// Token check first, then the peer address check. Either is skipped when
/// not configured.
pub async fn heartbeat_guard(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let heartbeat = &state.heartbeat;
    let peer: Option<IpAddr> = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let remote = peer.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

    if let Some(expected) = &heartbeat.token {
        let provided = req
            .headers()
            .get(HEARTBEAT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if !provided.is_some_and(|token| tokens_match(token, expected)) {
            tracing::warn!(remote = %remote, "Unauthorized heartbeat attempt");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Unauthorized" })),
            )
                .into_response();
        }
    }

    if heartbeat.ip_whitelisting_enabled() && !peer.is_some_and(|ip| heartbeat.allows(ip)) {
        tracing::warn!(remote = %remote, "Heartbeat from non-whitelisted address");
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "Forbidden" }))).into_response();
    }

    next.run(req).await
}

/// Compares fixed-length digests so the comparison doesn't leak the token length.
fn tokens_match(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}
