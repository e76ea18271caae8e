// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::{routing::get, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use table_gateway::{
    auth::create_token,
    config::Config,
    handlers,
    protocol::{codec, Frame},
    state::GatewayState,
    websocket,
};

pub const TEST_JWT_SECRET: &str = "test-secret-min-32-characters-long!!";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestGateway {
    pub state: GatewayState,
    pub addr: SocketAddr,
}

/// Boot the gateway router on an ephemeral port. The returned state handle
/// lets tests reach into the fabric (registry, pool, history) directly.
pub async fn spawn_gateway(mut config: Config) -> TestGateway {
    config.jwt_secret = TEST_JWT_SECRET.to_string();
    let state = GatewayState::with_defaults(config);
    // Heartbeat / stale / cleanup loops, exactly as main wires them.
    let _background = state.supervisor.start();

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Test server failed");
    });

    TestGateway { state, addr }
}

pub fn token_for(user_id: Uuid, username: &str, roles: &[&str]) -> String {
    create_token(user_id, username, roles, TEST_JWT_SECRET).expect("test token")
}

pub fn ws_url(gw: &TestGateway, query: &str) -> String {
    format!("ws://{}/ws?{query}", gw.addr)
}

/// Open a socket as a player and swallow the welcome frame.
pub async fn connect_player(gw: &TestGateway, user_id: Uuid, name: &str, table: &str) -> WsClient {
    let token = token_for(user_id, name, &["player"]);
    let url = ws_url(gw, &format!("token={token}&tableId={table}"));
    let (mut client, _) = connect_async(url).await.expect("upgrade should succeed");
    let welcome = expect_kind(&mut client, "connection_established").await;
    assert_eq!(welcome.payload["tableId"], table);
    client
}

/// Connect and subscribe to the GAME channel of the table.
pub async fn connect_game_player(
    gw: &TestGateway,
    user_id: Uuid,
    name: &str,
    table: &str,
) -> WsClient {
    let mut client = connect_player(gw, user_id, name, table).await;
    subscribe(&mut client, "game", table).await;
    client
}

pub async fn send_frame(client: &mut WsClient, kind: &str, payload: Value) {
    let frame = json!({ "type": kind, "payload": payload });
    client
        .send(Message::Text(frame.to_string()))
        .await
        .expect("send should succeed");
}

pub async fn subscribe(client: &mut WsClient, channel: &str, table: &str) {
    send_frame(
        client,
        "subscribe",
        json!({ "channel": channel, "tableId": table }),
    )
    .await;
    let confirm = expect_kind(client, "subscription_confirmed").await;
    assert_eq!(confirm.payload["channel"], channel);
}

/// Next protocol frame from the socket, decoding both text and the
/// `[0x01][gzip]` binary form. Returns `None` on close or timeout.
pub async fn recv_frame(client: &mut WsClient) -> Option<Frame> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .ok()??;
        match msg {
            Ok(Message::Text(text)) => return codec::decode_text(&text).ok(),
            Ok(Message::Binary(bytes)) => return codec::decode_binary(&bytes).ok(),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Read frames (unwrapping batches) until one matches `kind`. Panics on
/// timeout so scenario failures name the missing frame.
pub async fn expect_kind(client: &mut WsClient, kind: &str) -> Frame {
    let mut seen = Vec::new();
    for _ in 0..50 {
        let Some(frame) = recv_frame(client).await else {
            panic!("socket closed while waiting for {kind}; saw {seen:?}");
        };
        for frame in unwrap_batch(frame) {
            if frame.kind == kind {
                return frame;
            }
            seen.push(frame.kind.clone());
        }
    }
    panic!("never saw frame of type {kind}; saw {seen:?}");
}

/// Flatten a frame into its batched contents (or itself).
pub fn unwrap_batch(frame: Frame) -> Vec<Frame> {
    if frame.kind == "batch" {
        serde_json::from_value(frame.payload["messages"].clone()).expect("batch payload")
    } else {
        vec![frame]
    }
}

/// Drain frames until the socket has been quiet for `idle`. Batches are
/// unwrapped.
pub async fn drain_for(client: &mut WsClient, idle: Duration) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        match tokio::time::timeout(idle, client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(frame) = codec::decode_text(&text) {
                    frames.extend(unwrap_batch(frame));
                }
            }
            Ok(Some(Ok(Message::Binary(bytes)))) => {
                if let Ok(frame) = codec::decode_binary(&bytes) {
                    frames.extend(unwrap_batch(frame));
                }
            }
            Ok(Some(Ok(_))) => continue,
            _ => return frames,
        }
    }
}

/// Wait for the server-side close handshake and return (code, reason).
pub async fn expect_close(client: &mut WsClient) -> (u16, String) {
    for _ in 0..50 {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("expected a close frame before timeout");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (frame.code.into(), frame.reason.to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) | None => {
                panic!("socket closed without a close frame");
            }
            Some(Err(e)) => panic!("unexpected socket error: {e:?}"),
        }
    }
    panic!("no close frame observed");
}
