use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::auth::Role;
use crate::dispatch;
use crate::error::{GatewayError, GatewayResult};
use crate::lifecycle::RetryPolicy;
use crate::pool::Admission;
use crate::protocol::codec::WireMessage;
use crate::protocol::{Frame, CLOSE_POLICY_VIOLATION, MSG_CONNECTION_ESTABLISHED};
use crate::state::GatewayState;

// ============================================================================
// Query params
// ============================================================================

/// The bearer token is passed as a query parameter because WebSocket upgrade
/// requests are plain GET requests and cannot carry an Authorization header
/// reliably across all client environments.
///
/// Note: query-parameter tokens appear in server and proxy access logs; use
/// short-lived tokens to limit exposure.
///
/// Every field is optional at the type level so that missing credentials can
/// be answered with a proper policy-violation close instead of an HTTP 400.
#[derive(Debug, serde::Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
    #[serde(rename = "tableId")]
    pub table_id: Option<String>,
    /// `off` opts this client out of compressed batches.
    pub compression: Option<String>,
    /// `true` requests the spectator role (unless the token carries a role).
    pub spectator: Option<String>,
    /// Role override fallback; a role in the token always wins.
    pub role: Option<String>,
}

// ============================================================================
// Upgrade handler
// ============================================================================

/// GET /ws?token=<token>&tableId=<table> — upgrade to a WebSocket connection.
///
/// Authentication happens after the upgrade so failures can close with the
/// protocol's 1008 policy-violation code and a readable reason.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<GatewayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

// ============================================================================
// Connection lifecycle
// ============================================================================

async fn handle_socket(socket: WebSocket, params: WsParams, state: GatewayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();

    // Forward outbound wire messages from the pipeline to the WebSocket.
    let mut send_task = tokio::spawn(async move {
        while let Some(wire) = rx.recv().await {
            let result = match wire {
                WireMessage::Text(text) => ws_sender.send(Message::Text(text)).await,
                WireMessage::Binary(bytes) => ws_sender.send(Message::Binary(bytes)).await,
                WireMessage::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    // Authenticate and admit. Failures close the fresh socket with 1008 (or
    // 1011 for internal inconsistencies) and the documented reason.
    let admission = match admit(&state, &params, &tx).await {
        Ok(admission) => admission,
        Err(e) => {
            tracing::info!(error = %e, "Upgrade rejected");
            let _ = tx.send(WireMessage::Close {
                code: e.close_code().unwrap_or(CLOSE_POLICY_VIOLATION),
                reason: e.user_message(state.config.is_production),
            });
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };
    let connection = admission.connection().clone();

    // Welcome the client before any broadcast can reach it.
    let welcome = Frame::new(
        MSG_CONNECTION_ESTABLISHED,
        json!({
            "connectionId": connection.id,
            "principal": {
                "userId": connection.principal.user_id,
                "username": connection.principal.username,
                "role": connection.principal.role,
            },
            "tableId": connection.table_id(),
            "reconnect": {
                "graceSeconds": state.config.grace_period.as_secs(),
                "maxAttempts": state.config.max_reconnect_attempts,
                "backoffMs": state.config.reconnect_backoff.as_millis() as u64,
                "policies": {
                    "websocketSend": RetryPolicy::websocket_send().hints(),
                    "websocketReconnect": RetryPolicy::websocket_reconnect().hints(),
                },
            },
        }),
    );
    connection.pipeline.send_direct(&welcome).await;

    if matches!(admission, Admission::Reconnected(_)) {
        state.supervisor.announce_reconnect(&connection).await;
    }

    // Inbound dispatch loop.
    let recv_state = state.clone();
    let recv_conn = connection.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    dispatch::handle_text(&recv_state, &recv_conn, &text).await;
                }
                Ok(Message::Binary(bytes)) => {
                    dispatch::handle_binary(&recv_state, &recv_conn, &bytes).await;
                }
                Ok(Message::Close(_)) => break,
                // Transport-level ping/pong is handled by axum; it still
                // counts as liveness.
                Ok(_) => {
                    recv_conn.touch_pong();
                    recv_conn.touch_activity();
                }
                Err(e) => {
                    tracing::debug!(
                        connection_id = %recv_conn.id,
                        error = ?e,
                        "WebSocket receive error; closing connection"
                    );
                    break;
                }
            }
        }
    });

    // Wait for either task to finish — then abort the other.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Unexpected closes get a grace window; explicit leavers and already
    // terminated connections are final.
    state.supervisor.handle_socket_closed(connection).await;
}

// ============================================================================
// Authentication and admission
// ============================================================================

async fn admit(
    state: &GatewayState,
    params: &WsParams,
    tx: &mpsc::UnboundedSender<WireMessage>,
) -> GatewayResult<Admission> {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(GatewayError::MissingCredentials)?;
    let table_id = params
        .table_id
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or(GatewayError::MissingCredentials)?;

    let fallback_role = if params.spectator.as_deref() == Some("true") {
        Role::Spectator
    } else {
        params
            .role
            .as_deref()
            .and_then(|r| r.parse().ok())
            .unwrap_or(Role::Player)
    };

    let principal = state
        .verifier
        .verify(token, fallback_role)
        .await
        .map_err(|_| GatewayError::InvalidToken)?;

    let compression = params.compression.as_deref() != Some("off");

    state
        .pool
        .admit(principal, table_id, tx.clone(), compression)
        .await
}
