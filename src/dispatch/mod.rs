use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;
use validator::Validate;

use crate::adapters::{AuditEvent, AuditKind, ChatHistoryQuery, Severity};
use crate::auth::Role;
use crate::channels::{ChannelAction, ChannelKind};
use crate::error::GatewayError;
use crate::limiter::RateDecision;
use crate::protocol::{
    codec, Frame, CLOSE_NORMAL, MSG_ACK, MSG_CHAT, MSG_CHAT_DELIVERED, MSG_CHAT_HISTORY,
    MSG_CHAT_MESSAGE_DELETED, MSG_CHAT_SENT, MSG_DELETE_CHAT_MESSAGE, MSG_GAME_UPDATE,
    MSG_GET_CHAT_HISTORY, MSG_JOIN_TABLE, MSG_LEAVE_TABLE, MSG_MESSAGE_REPORTED, MSG_MUTE_PLAYER,
    MSG_PING, MSG_PLAYER_ACTION, MSG_PLAYER_ACTION_RESULT, MSG_PLAYER_MUTED, MSG_REPORT_MESSAGE,
    MSG_STATE_REQUEST, MSG_SUBSCRIBE, MSG_SUBSCRIPTION_CONFIRMED, MSG_TABLE_STATE,
    MSG_UNSUBSCRIBE, MSG_UNSUBSCRIPTION_CONFIRMED,
};
use crate::registry::Connection;
use crate::state::GatewayState;

const HELP_TEXT: &str = "Commands: /fold /check /call /raise <amount> /allin \
/history /report <messageId> [reason] /mute <player> [reason] (admin) /help";

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Validate)]
struct ChatBody {
    #[validate(length(min = 1, max = 500, message = "Message must be 1-500 characters"))]
    message: String,
}

// ============================================================================
// Entry points
// ============================================================================

pub async fn handle_text(state: &GatewayState, connection: &Arc<Connection>, text: &str) {
    connection.pipeline.note_bytes_in(text.len()).await;
    match codec::decode_text(text) {
        Ok(frame) => handle_frame(state, connection, frame).await,
        Err(e) => send_error(state, connection, &e).await,
    }
}

pub async fn handle_binary(state: &GatewayState, connection: &Arc<Connection>, bytes: &[u8]) {
    connection.pipeline.note_bytes_in(bytes.len()).await;
    match codec::decode_binary(bytes) {
        Ok(frame) => handle_frame(state, connection, frame).await,
        Err(e) => send_error(state, connection, &e).await,
    }
}

/// Classify and route one inbound frame. Every path that rejects keeps the
/// connection open; closing is reserved for leave/termination.
pub async fn handle_frame(state: &GatewayState, connection: &Arc<Connection>, frame: Frame) {
    connection.touch_activity();
    connection.touch_pong();

    match frame.kind.as_str() {
        MSG_PING => {
            connection.pipeline.enqueue(Frame::pong()).await;
        }
        MSG_ACK => handle_ack(state, connection, &frame.payload).await,
        MSG_STATE_REQUEST => {
            let last_seen = frame.payload["lastStateVersion"].as_u64().unwrap_or(0);
            state.supervisor.replay(connection, last_seen).await;
        }
        MSG_SUBSCRIBE => handle_subscribe(state, connection, &frame.payload).await,
        MSG_UNSUBSCRIBE => handle_unsubscribe(state, connection, &frame.payload).await,
        MSG_CHAT => handle_chat(state, connection, &frame.payload).await,
        MSG_PLAYER_ACTION => handle_player_action(state, connection, frame.payload).await,
        MSG_JOIN_TABLE => handle_join_table(state, connection, &frame.payload).await,
        MSG_LEAVE_TABLE => handle_leave_table(state, connection).await,
        MSG_GET_CHAT_HISTORY => handle_chat_history(state, connection, &frame.payload).await,
        MSG_DELETE_CHAT_MESSAGE => handle_delete_message(state, connection, &frame.payload).await,
        MSG_MUTE_PLAYER => handle_mute(state, connection, &frame.payload).await,
        MSG_REPORT_MESSAGE => handle_report(state, connection, &frame.payload).await,
        _ => send_error(state, connection, &GatewayError::UnknownMessageType).await,
    }
}

// ============================================================================
// Heartbeat / replay bookkeeping
// ============================================================================

async fn handle_ack(state: &GatewayState, connection: &Arc<Connection>, payload: &Value) {
    let Some(sequence_id) = payload["sequenceId"].as_u64() else {
        send_error(
            state,
            connection,
            &GatewayError::Protocol("missing sequenceId".into()),
        )
        .await;
        return;
    };
    connection.resolve_ack(sequence_id);
}

// ============================================================================
// Subscriptions
// ============================================================================

fn payload_table(payload: &Value) -> Option<String> {
    payload["tableId"]
        .as_str()
        .filter(|t| !t.is_empty())
        .map(ToOwned::to_owned)
}

async fn handle_subscribe(state: &GatewayState, connection: &Arc<Connection>, payload: &Value) {
    let Some(channel) = payload["channel"]
        .as_str()
        .and_then(|c| c.parse::<ChannelKind>().ok())
    else {
        send_error(state, connection, &GatewayError::InvalidChannel).await;
        return;
    };
    let table_id = payload_table(payload);

    match state
        .channels
        .subscribe(
            connection.id,
            connection.principal.role,
            channel,
            table_id.clone(),
        )
        .await
    {
        Ok(permissions) => {
            connection
                .pipeline
                .enqueue(Frame::new(
                    MSG_SUBSCRIPTION_CONFIRMED,
                    json!({
                        "channel": channel,
                        "tableId": table_id,
                        "permissions": permissions.granted(),
                    }),
                ))
                .await;
        }
        Err(e) => send_error(state, connection, &e).await,
    }
}

async fn handle_unsubscribe(state: &GatewayState, connection: &Arc<Connection>, payload: &Value) {
    let Some(channel) = payload["channel"]
        .as_str()
        .and_then(|c| c.parse::<ChannelKind>().ok())
    else {
        send_error(state, connection, &GatewayError::InvalidChannel).await;
        return;
    };
    let table_id = payload_table(payload);

    match state
        .channels
        .unsubscribe(connection.id, channel, table_id.clone())
        .await
    {
        Ok(()) => {
            connection
                .pipeline
                .enqueue(Frame::new(
                    MSG_UNSUBSCRIPTION_CONFIRMED,
                    json!({ "channel": channel, "tableId": table_id }),
                ))
                .await;
        }
        Err(e) => send_error(state, connection, &e).await,
    }
}

// ============================================================================
// Chat
// ============================================================================

/// Drop control characters and trim. Length bounds are enforced after
/// sanitization so a padding-only message cannot sneak through.
fn sanitize_chat(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_owned()
}

async fn handle_chat(state: &GatewayState, connection: &Arc<Connection>, payload: &Value) {
    let Some(raw) = payload["message"].as_str() else {
        send_error(
            state,
            connection,
            &GatewayError::Protocol("missing message".into()),
        )
        .await;
        return;
    };

    let message = sanitize_chat(raw);
    if let Some(command) = message.strip_prefix('/') {
        // Commands never consume chat tokens.
        handle_command(state, connection, command).await;
        return;
    }

    let body = ChatBody { message };
    if body.validate().is_err() {
        send_error(
            state,
            connection,
            &GatewayError::Protocol("Message must be 1-500 characters".into()),
        )
        .await;
        return;
    }
    let message = body.message;

    // Role permission over the chat matrix; spectators read but never write.
    if !ChannelKind::Chat
        .config()
        .permissions_for(connection.principal.role)
        .write
    {
        send_error(state, connection, &GatewayError::InsufficientPermissions).await;
        return;
    }

    let table_id = connection.table_id();
    let decision = state
        .limiter
        .check(&connection.principal, ChannelKind::Chat, Some(&table_id))
        .await;
    if let RateDecision::Limited { retry_after } = decision {
        send_error(state, connection, &GatewayError::RateLimited { retry_after }).await;
        return;
    }

    let outcome = match state
        .moderator
        .send_chat(&connection.principal, &table_id, &message)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            send_error(state, connection, &e).await;
            return;
        }
    };

    if !outcome.accepted {
        connection
            .pipeline
            .enqueue(Frame::new(
                MSG_CHAT_DELIVERED,
                json!({
                    "status": "failed",
                    "reason": outcome.reason,
                }),
            ))
            .await;
        return;
    }

    let Some(record) = outcome.record else {
        send_error(
            state,
            connection,
            &GatewayError::Upstream("Failed to process chat message".into()),
        )
        .await;
        return;
    };

    connection
        .pipeline
        .send_direct(&Frame::new(
            MSG_CHAT_SENT,
            json!({
                "messageId": record.id,
                "timestamp": record.created_at.timestamp_millis(),
            }),
        ))
        .await;

    state
        .pool
        .broadcast_to_table(
            &table_id,
            Frame::new(
                MSG_CHAT,
                json!({
                    "messageId": record.id,
                    "playerId": connection.principal.user_id,
                    "username": connection.principal.username,
                    "message": record.message,
                    "tableId": table_id,
                }),
            ),
        )
        .await;

    connection
        .pipeline
        .enqueue(Frame::new(
            MSG_CHAT_DELIVERED,
            json!({ "messageId": record.id, "status": "delivered" }),
        ))
        .await;
}

// ============================================================================
// Chat commands
// ============================================================================

async fn handle_command(state: &GatewayState, connection: &Arc<Connection>, command: &str) {
    let mut parts = command.split_whitespace();
    let Some(name) = parts.next() else {
        send_error(
            state,
            connection,
            &GatewayError::Protocol("unknown command".into()),
        )
        .await;
        return;
    };
    let args: Vec<&str> = parts.collect();

    match name {
        "fold" | "check" | "call" | "allin" => {
            let action = json!({
                "playerId": connection.principal.user_id,
                "action": name,
            });
            handle_player_action(state, connection, action).await;
        }
        "raise" => {
            let Some(amount) = args.first().and_then(|a| a.parse::<u64>().ok()) else {
                send_error(
                    state,
                    connection,
                    &GatewayError::Protocol("raise amount required".into()),
                )
                .await;
                return;
            };
            let action = json!({
                "playerId": connection.principal.user_id,
                "action": "raise",
                "amount": amount,
            });
            handle_player_action(state, connection, action).await;
        }
        "history" => {
            handle_chat_history(state, connection, &json!({})).await;
        }
        "mute" => {
            let payload = json!({
                "player": args.first(),
                "reason": (args.len() > 1).then(|| args[1..].join(" ")),
            });
            handle_mute(state, connection, &payload).await;
        }
        "report" => {
            let payload = json!({
                "messageId": args.first(),
                "reason": (args.len() > 1).then(|| args[1..].join(" ")),
            });
            handle_report(state, connection, &payload).await;
        }
        "help" => {
            connection.pipeline.send_direct(&Frame::system(HELP_TEXT)).await;
        }
        _ => {
            send_error(
                state,
                connection,
                &GatewayError::Protocol("unknown command".into()),
            )
            .await;
        }
    }
}

// ============================================================================
// Player actions
// ============================================================================

async fn handle_player_action(state: &GatewayState, connection: &Arc<Connection>, payload: Value) {
    let claimed = payload["playerId"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok());
    if claimed != Some(connection.principal.user_id) {
        // A payload claiming someone else's seat is worth flagging.
        state
            .audit
            .emit(AuditEvent::for_connection(
                AuditKind::SuspiciousActivity,
                Severity::High,
                connection.principal.user_id,
                connection.id,
                json!({ "reason": "player_action for another playerId" }),
            ))
            .await;
        send_error(state, connection, &GatewayError::UnauthorizedAction).await;
        return;
    }

    let table_id = connection.table_id();
    if !state
        .channels
        .check_permission(
            connection.id,
            ChannelKind::Game,
            Some(&table_id),
            ChannelAction::Write,
        )
        .await
    {
        send_error(state, connection, &GatewayError::InsufficientPermissions).await;
        return;
    }

    let delta = match state
        .game
        .player_action(&table_id, &connection.principal, payload)
        .await
    {
        Ok(delta) => delta,
        Err(e) => {
            send_error(state, connection, &e).await;
            return;
        }
    };

    connection
        .pipeline
        .send_direct(&Frame::new(
            MSG_PLAYER_ACTION_RESULT,
            json!({ "success": true, "state": delta }),
        ))
        .await;

    state
        .pool
        .broadcast_to_table(&table_id, Frame::new(MSG_GAME_UPDATE, delta))
        .await;
}

// ============================================================================
// Table membership
// ============================================================================

async fn handle_join_table(state: &GatewayState, connection: &Arc<Connection>, payload: &Value) {
    let Some(table_id) = payload_table(payload) else {
        send_error(state, connection, &GatewayError::TableIdRequired).await;
        return;
    };

    let old_table = connection.table_id();
    if let Err(e) = state.registry.move_table(connection.id, table_id.clone()).await {
        send_error(state, connection, &e).await;
        return;
    }

    // Release subscriptions scoped to the table being left.
    if old_table != table_id {
        for sub in state.channels.subscriptions(connection.id).await {
            if sub.table_id.as_ref() == Some(&old_table) {
                let _ = state
                    .channels
                    .unsubscribe(connection.id, sub.channel, sub.table_id)
                    .await;
            }
        }
    }

    // Players join the game channel; spectators the spectator channel.
    let channel = if connection.principal.role == Role::Spectator {
        ChannelKind::Spectator
    } else {
        ChannelKind::Game
    };
    if let Err(e) = state
        .channels
        .subscribe(
            connection.id,
            connection.principal.role,
            channel,
            Some(table_id.clone()),
        )
        .await
    {
        send_error(state, connection, &e).await;
        return;
    }

    match state.game.table_state(&table_id).await {
        Ok(table_state) => {
            connection
                .pipeline
                .send_direct(&Frame::new(MSG_TABLE_STATE, table_state))
                .await;
        }
        Err(e) => send_error(state, connection, &e).await,
    }

    state
        .pool
        .broadcast_system(
            &table_id,
            &format!("{} joined the table", connection.principal.username),
        )
        .await;
}

async fn handle_leave_table(state: &GatewayState, connection: &Arc<Connection>) {
    connection.mark_explicit_leave();
    let table_id = connection.table_id();
    state
        .pool
        .broadcast_system(
            &table_id,
            &format!("{} left the table", connection.principal.username),
        )
        .await;
    state
        .pool
        .terminate(connection, CLOSE_NORMAL, "left table")
        .await;
}

// ============================================================================
// Moderation surface
// ============================================================================

async fn handle_chat_history(state: &GatewayState, connection: &Arc<Connection>, payload: &Value) {
    let table_id = connection.table_id();
    let query = ChatHistoryQuery {
        limit: payload["limit"]
            .as_u64()
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_HISTORY_LIMIT),
        offset: payload["offset"].as_u64().unwrap_or(0) as usize,
        ..ChatHistoryQuery::for_table(&table_id, DEFAULT_HISTORY_LIMIT)
    };

    match state.moderator.history(query).await {
        Ok(messages) => {
            connection
                .pipeline
                .enqueue(Frame::new(
                    MSG_CHAT_HISTORY,
                    json!({ "tableId": table_id, "messages": messages }),
                ))
                .await;
        }
        Err(e) => send_error(state, connection, &e).await,
    }
}

async fn handle_delete_message(state: &GatewayState, connection: &Arc<Connection>, payload: &Value) {
    let Some(message_id) = payload["messageId"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        send_error(
            state,
            connection,
            &GatewayError::Protocol("missing messageId".into()),
        )
        .await;
        return;
    };

    match state
        .moderator
        .delete_message(&connection.principal, message_id)
        .await
    {
        Ok(()) => {
            let table_id = connection.table_id();
            state
                .pool
                .broadcast_to_table(
                    &table_id,
                    Frame::new(
                        MSG_CHAT_MESSAGE_DELETED,
                        json!({ "messageId": message_id }),
                    ),
                )
                .await;
        }
        Err(e) => send_error(state, connection, &e).await,
    }
}

async fn handle_mute(state: &GatewayState, connection: &Arc<Connection>, payload: &Value) {
    if connection.principal.role != Role::Admin {
        send_error(state, connection, &GatewayError::InsufficientPermissions).await;
        return;
    }
    let Some(target) = payload["player"].as_str().filter(|p| !p.is_empty()) else {
        send_error(
            state,
            connection,
            &GatewayError::Protocol("missing player".into()),
        )
        .await;
        return;
    };
    let reason = payload["reason"].as_str();

    match state
        .moderator
        .mute_player(&connection.principal, target, reason)
        .await
    {
        Ok(()) => {
            let table_id = connection.table_id();
            state
                .pool
                .broadcast_to_table(
                    &table_id,
                    Frame::new(
                        MSG_PLAYER_MUTED,
                        json!({ "player": target, "reason": reason }),
                    ),
                )
                .await;
        }
        Err(e) => send_error(state, connection, &e).await,
    }
}

async fn handle_report(state: &GatewayState, connection: &Arc<Connection>, payload: &Value) {
    let Some(message_id) = payload["messageId"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        send_error(
            state,
            connection,
            &GatewayError::Protocol("missing messageId".into()),
        )
        .await;
        return;
    };
    let reason = payload["reason"].as_str();

    match state
        .moderator
        .report_message(&connection.principal, message_id, reason)
        .await
    {
        Ok(report_id) => {
            connection
                .pipeline
                .enqueue(Frame::new(
                    MSG_MESSAGE_REPORTED,
                    json!({ "reportId": report_id, "messageId": message_id }),
                ))
                .await;
        }
        Err(e) => send_error(state, connection, &e).await,
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn send_error(state: &GatewayState, connection: &Arc<Connection>, error: &GatewayError) {
    let message = error.user_message(state.config.is_production);
    connection.pipeline.enqueue(Frame::error(&message)).await;
}

// ── Unit tests ────────────────────────────────────────────────────────────────
