//! WebSocket upgrade gateway: `GET /ws`.

use crate::auth::{credential_from_headers, AuthError, AuthenticatedUser};
use crate::connection::{
    run_read_loop, run_write_loop, teardown, CloseReason, Connection, InboundHandler,
};
use crate::AppState;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;

/// Query parameters for the WebSocket connection.
///
/// Browsers cannot set headers on a WebSocket handshake, so the access
/// token may be passed as `?token=`. It takes precedence over the
/// `Authorization` header and the `access_token` cookie.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub token: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),
    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(#[from] WebSocketUpgradeRejection),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthenticated(_) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthenticated" })),
            )
                .into_response(),
            Self::UpgradeFailed(rejection) => rejection.into_response(),
        }
    }
}

/// WebSocket handler: `GET /ws?token=...`.
///
/// The credential is checked before the upgrade, so an unauthenticated
/// client gets a plain `401` and no connection state is ever created for
/// it. Successful and failed attempts are logged with the remote address.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<WsConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user = match authenticate_upgrade(&state, params.token, &headers) {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(remote_addr = %addr, "websocket auth failed: {}", e);
            return e.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = GatewayError::from(rejection);
            tracing::warn!(identity = %user.identity, remote_addr = %addr, "{}", err);
            return err.into_response();
        }
    };

    tracing::info!(
        identity = %user.identity,
        role = %user.role,
        remote_addr = %addr,
        "websocket auth success"
    );

    ws.on_failed_upgrade(move |e| {
        tracing::warn!(remote_addr = %addr, "websocket handshake failed: {}", e);
    })
    .on_upgrade(move |socket| serve_socket(socket, state, user, addr))
}

fn authenticate_upgrade(
    state: &AppState,
    query_token: Option<String>,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, GatewayError> {
    let credential = query_token
        .filter(|t| !t.is_empty())
        .or_else(|| credential_from_headers(headers))
        .ok_or(AuthError::MissingCredential)?;
    Ok(state.authenticator.authenticate(&credential)?)
}

/// Runs one upgraded socket until it closes.
///
/// The write loop gets its own task; the read loop runs here. Both end
/// once either side tears the connection down.
async fn serve_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    user: AuthenticatedUser,
    addr: SocketAddr,
) {
    let (conn, queue) = Connection::new(user.identity.clone(), state.realtime.queue_capacity);

    for displaced in state.registry.register(conn.clone()) {
        teardown(&state.registry, &displaced, CloseReason::Replaced);
    }
    tracing::info!(
        identity = %conn.identity(),
        connection_id = %conn.id(),
        remote_addr = %addr,
        sessions = state.registry.connections_for(conn.identity()).len(),
        "connection registered"
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(run_write_loop(
        conn.clone(),
        queue,
        sink,
        state.registry.clone(),
    ));

    let handler: Arc<dyn InboundHandler> = state.delivery.clone();
    run_read_loop(conn.clone(), stream, handler, state.registry.clone()).await;

    if let Err(e) = writer.await {
        tracing::error!(connection_id = %conn.id(), "write loop task failed: {}", e);
    }
}
