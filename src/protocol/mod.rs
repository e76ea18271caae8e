pub mod codec;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Tables are identified by the opaque `tableId` string from the upgrade
/// query; the gateway never parses or interprets it.
pub type TableId = String;

// ============================================================================
// Close codes
// ============================================================================

/// Normal closure — also used for "replaced", idle eviction and shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation — authentication and admission failures at upgrade.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Internal error — unrecoverable inconsistency (duplicate principal, etc.).
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

// ============================================================================
// Frame envelope
// ============================================================================

/// Envelope for all gateway messages (both client→server and server→client).
///
/// Wire field names are camelCase; `payload` is free-form JSON interpreted per
/// `kind`. `sequence_id` is only present on frames recorded in a table's
/// history ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "sequenceId", skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "requiresAck", skip_serializing_if = "Option::is_none")]
    pub requires_ack: Option<bool>,
}

impl Frame {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_owned(),
            payload,
            sequence_id: None,
            timestamp: Some(Utc::now().timestamp_millis()),
            requires_ack: None,
        }
    }

    /// Outbound `error { message }` frame.
    pub fn error(message: &str) -> Self {
        Self::new(MSG_ERROR, json!({ "message": message }))
    }

    /// Server-originated chat line shown in the table chat (joins, leaves,
    /// disconnect notices, `/help` output).
    pub fn system(text: &str) -> Self {
        Self::new(MSG_SYSTEM, json!({ "message": text }))
    }

    pub fn pong() -> Self {
        Self::new(MSG_PONG, json!({}))
    }
}

// ── Client-to-server message types ───────────────────────────────────────────

pub const MSG_PING: &str = "ping";
pub const MSG_ACK: &str = "ack";
pub const MSG_STATE_REQUEST: &str = "state_request";
pub const MSG_SUBSCRIBE: &str = "subscribe";
pub const MSG_UNSUBSCRIBE: &str = "unsubscribe";
pub const MSG_CHAT: &str = "chat";
pub const MSG_PLAYER_ACTION: &str = "player_action";
pub const MSG_JOIN_TABLE: &str = "join_table";
pub const MSG_LEAVE_TABLE: &str = "leave_table";
pub const MSG_GET_CHAT_HISTORY: &str = "get_chat_history";
pub const MSG_DELETE_CHAT_MESSAGE: &str = "delete_chat_message";
pub const MSG_MUTE_PLAYER: &str = "mute_player";
pub const MSG_REPORT_MESSAGE: &str = "report_message";

// ── Server-to-client message types ───────────────────────────────────────────

pub const MSG_CONNECTION_ESTABLISHED: &str = "connection_established";
pub const MSG_PONG: &str = "pong";
pub const MSG_SUBSCRIPTION_CONFIRMED: &str = "subscription_confirmed";
pub const MSG_UNSUBSCRIPTION_CONFIRMED: &str = "unsubscription_confirmed";
pub const MSG_CHAT_SENT: &str = "chat_sent";
pub const MSG_CHAT_HISTORY: &str = "chat_history";
pub const MSG_CHAT_MESSAGE_DELETED: &str = "chat_message_deleted";
pub const MSG_CHAT_DELIVERED: &str = "chat_delivered";
pub const MSG_PLAYER_MUTED: &str = "player_muted";
pub const MSG_MESSAGE_REPORTED: &str = "message_reported";
pub const MSG_GAME_UPDATE: &str = "game_update";
pub const MSG_TABLE_STATE: &str = "table_state";
pub const MSG_PLAYER_ACTION_RESULT: &str = "player_action_result";
pub const MSG_BATCH: &str = "batch";
pub const MSG_RECONNECTION_SUCCESSFUL: &str = "reconnection_successful";
pub const MSG_ERROR: &str = "error";
pub const MSG_SYSTEM: &str = "system";
pub const MSG_DISCONNECT_WARNING: &str = "disconnect_warning";

// ============================================================================
// Delivery classification
// ============================================================================

/// Priority forces an immediate flush of the outbound queue at or above this
/// value, regardless of queue depth.
pub const PRIORITY_FLUSH_NOW: u8 = 10;

/// Default delivery priority for a frame type (0..10, higher first).
pub fn default_priority(kind: &str) -> u8 {
    match kind {
        MSG_DISCONNECT_WARNING => 10,
        MSG_ERROR => 8,
        MSG_PLAYER_ACTION => 5,
        MSG_GAME_UPDATE => 3,
        MSG_SYSTEM => 2,
        MSG_CHAT => 1,
        _ => 2,
    }
}

/// Realtime-critical frames bypass batching and compression entirely; they
/// never wait in the queue.
pub fn is_realtime_critical(kind: &str) -> bool {
    matches!(
        kind,
        MSG_PLAYER_ACTION | MSG_PING | MSG_PONG | MSG_DISCONNECT_WARNING
    )
}

// ── Unit tests ────────────────────────────────────────────────────────────────
