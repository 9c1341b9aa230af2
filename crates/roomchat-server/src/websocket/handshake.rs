//! `GET /ws`: verify the handshake token, then upgrade.
//!
//! The token travels as the first `Sec-WebSocket-Protocol` entry. Any
//! failure refuses the upgrade with `401` before a socket exists.

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use metrics::counter;
use roomchat_core::errors::HandshakeError;
use roomchat_core::ids::ConnectionId;
use serde::Serialize;
use tracing::{debug, warn};

use super::session::{SessionDeps, run_ws_session};
use crate::metrics::WS_HANDSHAKE_REJECTIONS_TOTAL;
use crate::server::AppState;

/// Body of a refused upgrade.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionBody {
    /// Machine-readable failure kind.
    pub error: &'static str,
    /// Close code the failure corresponds to.
    pub code: u16,
    /// Human-readable detail.
    pub message: String,
}

/// GET /ws
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }

    let header = match headers.get(SEC_WEBSOCKET_PROTOCOL).map(|v| v.to_str()) {
        None => None,
        Some(Ok(value)) => Some(value),
        Some(Err(_)) => {
            return reject(&HandshakeError::Malformed(
                "sub-protocol header is not visible ASCII".into(),
            ));
        }
    };
    let verified = match state.verifier.admit(header) {
        Ok(v) => v,
        Err(e) => return reject(&e),
    };

    let connection_id = ConnectionId::new();
    debug!(
        conn_id = %connection_id,
        room = %verified.scope.key,
        identity = %verified.identity,
        "handshake verified"
    );

    let deps = SessionDeps {
        rooms: state.rooms.clone(),
        config: state.config.clone(),
        shutdown: state.shutdown.token(),
    };
    ws.protocols([state.config.subprotocol.clone()])
        .max_message_size(state.config.max_frame_bytes)
        .max_frame_size(state.config.max_frame_bytes)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| run_ws_session(socket, connection_id, verified, deps))
}

fn reject(err: &HandshakeError) -> Response {
    warn!(kind = err.kind(), error = %err, "handshake rejected");
    counter!(WS_HANDSHAKE_REJECTIONS_TOTAL, "kind" => err.kind()).increment(1);
    let body = RejectionBody {
        error: err.kind(),
        code: err.close_code().code(),
        message: err.to_string(),
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejection_is_401_with_kind() {
        let resp = reject(&HandshakeError::Unauthorized);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "unauthorized");
        assert_eq!(parsed["code"], 4001);
    }

    #[tokio::test]
    async fn malformed_is_also_401() {
        let resp = reject(&HandshakeError::Malformed("missing".into()));
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "malformed_handshake");
    }
}
