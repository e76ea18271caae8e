use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::Display;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::TableId;
use crate::registry::ConnectionId;

// ============================================================================
// Chat records
// ============================================================================

/// Append-only chat row as exchanged with the moderator and its store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: Uuid,
    pub player_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<TableId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tournament_id: Option<String>,
    pub message: String,
    pub message_type: String,
    pub is_moderated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moderation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatHistoryQuery {
    pub table_id: Option<TableId>,
    pub tournament_id: Option<String>,
    pub player_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl ChatHistoryQuery {
    pub fn for_table(table_id: &TableId, limit: usize) -> Self {
        Self {
            table_id: Some(table_id.clone()),
            limit,
            ..Default::default()
        }
    }
}

/// Outcome of forwarding a chat line to the moderator. A rejection is a
/// policy decision, not a failure; transport errors surface as `Err`.
#[derive(Debug, Clone)]
pub struct ModerationResult {
    pub accepted: bool,
    pub record: Option<ChatRecord>,
    pub reason: Option<String>,
}

impl ModerationResult {
    pub fn accepted(record: ChatRecord) -> Self {
        Self {
            accepted: true,
            record: Some(record),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            record: None,
            reason: Some(reason.into()),
        }
    }
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// The chat-moderation collaborator. The gateway forwards and never
/// interprets moderation policy; persistence of accepted messages is the
/// moderator's responsibility (single write path).
#[async_trait]
pub trait ChatModerator: Send + Sync {
    async fn send_chat(
        &self,
        principal: &Principal,
        table_id: &TableId,
        message: &str,
    ) -> GatewayResult<ModerationResult>;

    async fn delete_message(
        &self,
        principal: &Principal,
        message_id: Uuid,
    ) -> GatewayResult<()>;

    async fn mute_player(
        &self,
        principal: &Principal,
        target: &str,
        reason: Option<&str>,
    ) -> GatewayResult<()>;

    async fn report_message(
        &self,
        principal: &Principal,
        message_id: Uuid,
        reason: Option<&str>,
    ) -> GatewayResult<Uuid>;

    async fn history(&self, query: ChatHistoryQuery) -> GatewayResult<Vec<ChatRecord>>;
}

/// What happens to a seated player who loses their socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    AutoFold,
    AwaitReconnect,
}

/// The table/game-engine collaborator. Action payloads and state deltas are
/// opaque JSON — the gateway routes them without game-rule knowledge.
#[async_trait]
pub trait GameEngine: Send + Sync {
    async fn player_action(
        &self,
        table_id: &TableId,
        principal: &Principal,
        action: Value,
    ) -> GatewayResult<Value>;

    async fn table_state(&self, table_id: &TableId) -> GatewayResult<Value>;

    /// Report a disconnect; the engine decides the recovery policy for this
    /// player (it knows whether they are in a hand or have chips committed).
    async fn player_disconnected(
        &self,
        table_id: &TableId,
        principal: &Principal,
        grace: Duration,
    ) -> RecoveryPolicy;
}

/// Durable chat storage behind the moderator. Query results are ordered by
/// `created_at` descending.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(&self, record: ChatRecord) -> GatewayResult<()>;
    async fn delete(&self, id: Uuid) -> GatewayResult<bool>;
    async fn query(&self, query: &ChatHistoryQuery) -> GatewayResult<Vec<ChatRecord>>;
}

// ============================================================================
// Audit events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    Login,
    RateLimit,
    Disconnect,
    SuspiciousActivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: AuditKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<TableId>,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, severity: Severity, detail: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            user_id: None,
            connection_id: None,
            table_id: None,
            detail,
            at: Utc::now(),
        }
    }

    pub fn for_connection(
        kind: AuditKind,
        severity: Severity,
        user_id: Uuid,
        connection_id: ConnectionId,
        detail: Value,
    ) -> Self {
        Self {
            user_id: Some(user_id),
            connection_id: Some(connection_id),
            ..Self::new(kind, severity, detail)
        }
    }
}

/// Consumer of gateway security/operations events. The gateway produces;
/// alert state lives with the monitoring collaborator.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent);
}

// ============================================================================
// In-process defaults
// ============================================================================

/// Chat store holding rows in memory; the dev/test backend for the
/// in-process moderator.
#[derive(Default)]
pub struct MemoryChatStore {
    rows: RwLock<Vec<ChatRecord>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn append(&self, record: ChatRecord) -> GatewayResult<()> {
        self.rows.write().await.push(record);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> GatewayResult<bool> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|r| r.id != id);
        Ok(rows.len() != before)
    }

    async fn query(&self, query: &ChatHistoryQuery) -> GatewayResult<Vec<ChatRecord>> {
        let rows = self.rows.read().await;
        let mut hits: Vec<ChatRecord> = rows
            .iter()
            .filter(|r| {
                query
                    .table_id
                    .as_ref()
                    .map(|t| r.table_id.as_ref() == Some(t))
                    .unwrap_or(true)
                    && query
                        .tournament_id
                        .as_ref()
                        .map(|t| r.tournament_id.as_ref() == Some(t))
                        .unwrap_or(true)
                    && query.player_id.map(|p| r.player_id == p).unwrap_or(true)
                    && query.since.map(|s| r.created_at >= s).unwrap_or(true)
                    && query.until.map(|u| r.created_at <= u).unwrap_or(true)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let limit = if query.limit == 0 { 50 } else { query.limit };
        Ok(hits.into_iter().skip(query.offset).take(limit).collect())
    }
}

/// In-process moderator: accepts everything except messages from muted
/// players, persists to its store, and serves history from it. Used when no
/// `CHAT_MODERATOR_URL` is configured, and by tests.
pub struct PermissiveModerator {
    store: Arc<dyn ChatStore>,
    muted: RwLock<HashSet<String>>,
}

impl PermissiveModerator {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            muted: RwLock::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ChatModerator for PermissiveModerator {
    async fn send_chat(
        &self,
        principal: &Principal,
        table_id: &TableId,
        message: &str,
    ) -> GatewayResult<ModerationResult> {
        if self.muted.read().await.contains(&principal.username) {
            return Ok(ModerationResult::rejected("You are muted"));
        }

        let now = Utc::now();
        let record = ChatRecord {
            id: Uuid::new_v4(),
            player_id: principal.user_id,
            table_id: Some(table_id.clone()),
            tournament_id: None,
            message: message.to_owned(),
            message_type: "chat".to_owned(),
            is_moderated: false,
            moderation_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.append(record.clone()).await?;
        Ok(ModerationResult::accepted(record))
    }

    async fn delete_message(&self, _principal: &Principal, message_id: Uuid) -> GatewayResult<()> {
        self.store.delete(message_id).await.map(|_| ())
    }

    async fn mute_player(
        &self,
        _principal: &Principal,
        target: &str,
        _reason: Option<&str>,
    ) -> GatewayResult<()> {
        self.muted.write().await.insert(target.to_owned());
        Ok(())
    }

    async fn report_message(
        &self,
        _principal: &Principal,
        _message_id: Uuid,
        _reason: Option<&str>,
    ) -> GatewayResult<Uuid> {
        Ok(Uuid::new_v4())
    }

    async fn history(&self, query: ChatHistoryQuery) -> GatewayResult<Vec<ChatRecord>> {
        self.store.query(&query).await
    }
}

// ============================================================================
// HTTP moderator
// ============================================================================

/// Wire envelope of the moderator service: every endpoint takes
/// `{ channel, principal, payload }` and answers `{ success, data?, error? }`.
#[derive(Debug, Deserialize)]
struct ModeratorResponse {
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpChatModerator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatModerator {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build moderator HTTP client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn post(
        &self,
        endpoint: &str,
        principal: &Principal,
        payload: Value,
    ) -> GatewayResult<ModeratorResponse> {
        let url = format!("{}/{endpoint}", self.base_url.trim_end_matches('/'));
        let body = json!({
            "channel": "chat",
            "principal": {
                "userId": principal.user_id,
                "username": principal.username,
                "role": principal.role,
            },
            "payload": payload,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(endpoint, error = ?e, "Chat moderator unreachable");
                GatewayError::Upstream("Failed to process chat message".into())
            })?;

        response.json::<ModeratorResponse>().await.map_err(|e| {
            tracing::warn!(endpoint, error = ?e, "Chat moderator returned malformed body");
            GatewayError::Upstream("Failed to process chat message".into())
        })
    }
}

#[async_trait]
impl ChatModerator for HttpChatModerator {
    async fn send_chat(
        &self,
        principal: &Principal,
        table_id: &TableId,
        message: &str,
    ) -> GatewayResult<ModerationResult> {
        let response = self
            .post(
                "chat/send",
                principal,
                json!({ "tableId": table_id, "message": message }),
            )
            .await?;

        if !response.success {
            return Ok(ModerationResult::rejected(
                response.error.unwrap_or_else(|| "Message rejected".into()),
            ));
        }
        let record = serde_json::from_value(response.data)
            .map_err(|_| GatewayError::Upstream("Failed to process chat message".into()))?;
        Ok(ModerationResult::accepted(record))
    }

    async fn delete_message(&self, principal: &Principal, message_id: Uuid) -> GatewayResult<()> {
        let response = self
            .post("chat/delete", principal, json!({ "messageId": message_id }))
            .await?;
        if response.success {
            Ok(())
        } else {
            Err(GatewayError::Upstream(
                response.error.unwrap_or_else(|| "Delete failed".into()),
            ))
        }
    }

    async fn mute_player(
        &self,
        principal: &Principal,
        target: &str,
        reason: Option<&str>,
    ) -> GatewayResult<()> {
        let response = self
            .post(
                "chat/mute",
                principal,
                json!({ "target": target, "reason": reason }),
            )
            .await?;
        if response.success {
            Ok(())
        } else {
            Err(GatewayError::Upstream(
                response.error.unwrap_or_else(|| "Mute failed".into()),
            ))
        }
    }

    async fn report_message(
        &self,
        principal: &Principal,
        message_id: Uuid,
        reason: Option<&str>,
    ) -> GatewayResult<Uuid> {
        let response = self
            .post(
                "chat/report",
                principal,
                json!({ "messageId": message_id, "reason": reason }),
            )
            .await?;
        if !response.success {
            return Err(GatewayError::Upstream(
                response.error.unwrap_or_else(|| "Report failed".into()),
            ));
        }
        serde_json::from_value(response.data["reportId"].clone())
            .map_err(|_| GatewayError::Upstream("Report failed".into()))
    }

    async fn history(&self, query: ChatHistoryQuery) -> GatewayResult<Vec<ChatRecord>> {
        let response = self
            .post(
                "chat/history",
                &Principal {
                    user_id: query.player_id.unwrap_or_else(Uuid::nil),
                    username: String::new(),
                    role: crate::auth::Role::Player,
                },
                json!({
                    "tableId": query.table_id,
                    "tournamentId": query.tournament_id,
                    "limit": query.limit,
                    "offset": query.offset,
                }),
            )
            .await?;
        if !response.success {
            return Err(GatewayError::Upstream(
                response.error.unwrap_or_else(|| "History unavailable".into()),
            ));
        }
        serde_json::from_value(response.data)
            .map_err(|_| GatewayError::Upstream("History unavailable".into()))
    }
}

// ============================================================================
// Loopback game engine
// ============================================================================

/// Stand-in engine for dev and tests: echoes actions back as state deltas
/// and always asks for auto-fold on disconnect.
#[derive(Default)]
pub struct LoopbackGameEngine;

#[async_trait]
impl GameEngine for LoopbackGameEngine {
    async fn player_action(
        &self,
        table_id: &TableId,
        principal: &Principal,
        action: Value,
    ) -> GatewayResult<Value> {
        Ok(json!({
            "tableId": table_id,
            "playerId": principal.user_id,
            "action": action,
            "appliedAt": Utc::now().timestamp_millis(),
        }))
    }

    async fn table_state(&self, table_id: &TableId) -> GatewayResult<Value> {
        Ok(json!({
            "tableId": table_id,
            "players": [],
            "status": "waiting",
        }))
    }

    async fn player_disconnected(
        &self,
        _table_id: &TableId,
        _principal: &Principal,
        _grace: Duration,
    ) -> RecoveryPolicy {
        RecoveryPolicy::AutoFold
    }
}

// ============================================================================
// Tracing audit sink
// ============================================================================

/// Default sink: structured log lines plus per-kind counters surfaced in
/// `/health` and assertable from tests.
#[derive(Default)]
pub struct TracingAuditSink {
    logins: AtomicU64,
    rate_limits: AtomicU64,
    disconnects: AtomicU64,
    suspicious: AtomicU64,
}

impl TracingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: AuditKind) -> u64 {
        match kind {
            AuditKind::Login => self.logins.load(Ordering::Relaxed),
            AuditKind::RateLimit => self.rate_limits.load(Ordering::Relaxed),
            AuditKind::Disconnect => self.disconnects.load(Ordering::Relaxed),
            AuditKind::SuspiciousActivity => self.suspicious.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) {
        let counter = match event.kind {
            AuditKind::Login => &self.logins,
            AuditKind::RateLimit => &self.rate_limits,
            AuditKind::Disconnect => &self.disconnects,
            AuditKind::SuspiciousActivity => &self.suspicious,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        match event.severity {
            Severity::High => {
                tracing::warn!(kind = %event.kind, user_id = ?event.user_id, detail = %event.detail, "Audit event")
            }
            _ => {
                tracing::info!(kind = %event.kind, user_id = ?event.user_id, detail = %event.detail, "Audit event")
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    fn principal(name: &str) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            username: name.into(),
            role: Role::Player,
        }
    }

    fn table() -> TableId {
        "t1".to_string()
    }

    #[tokio::test]
    async fn permissive_moderator_accepts_and_persists() {
        let store = Arc::new(MemoryChatStore::new());
        let moderator = PermissiveModerator::new(store.clone());
        let alice = principal("alice");

        let result = moderator.send_chat(&alice, &table(), "gg").await.unwrap();
        assert!(result.accepted);
        let record = result.record.unwrap();
        assert_eq!(record.message, "gg");
        assert_eq!(record.player_id, alice.user_id);

        let history = store
            .query(&ChatHistoryQuery::for_table(&table(), 10))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn muted_players_are_rejected_not_errored() {
        let moderator = PermissiveModerator::new(Arc::new(MemoryChatStore::new()));
        let admin = principal("admin");
        let bob = principal("bob");

        moderator.mute_player(&admin, "bob", Some("spam")).await.unwrap();
        let result = moderator.send_chat(&bob, &table(), "hi").await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason.as_deref(), Some("You are muted"));
    }

    #[tokio::test]
    async fn store_query_orders_newest_first_with_limit_and_offset() {
        let store = MemoryChatStore::new();
        let alice = principal("alice");
        for i in 0..5 {
            let now = Utc::now() + chrono::Duration::milliseconds(i);
            store
                .append(ChatRecord {
                    id: Uuid::new_v4(),
                    player_id: alice.user_id,
                    table_id: Some(table()),
                    tournament_id: None,
                    message: format!("m{i}"),
                    message_type: "chat".into(),
                    is_moderated: false,
                    moderation_reason: None,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }

        let query = ChatHistoryQuery {
            table_id: Some(table()),
            limit: 2,
            offset: 1,
            ..Default::default()
        };
        let rows = store.query(&query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "m3");
        assert_eq!(rows[1].message, "m2");
    }

    #[tokio::test]
    async fn store_filters_by_player() {
        let store = MemoryChatStore::new();
        let alice = principal("alice");
        let bob = principal("bob");
        for p in [&alice, &bob] {
            let now = Utc::now();
            store
                .append(ChatRecord {
                    id: Uuid::new_v4(),
                    player_id: p.user_id,
                    table_id: Some(table()),
                    tournament_id: None,
                    message: p.username.clone(),
                    message_type: "chat".into(),
                    is_moderated: false,
                    moderation_reason: None,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }

        let rows = store
            .query(&ChatHistoryQuery {
                player_id: Some(alice.user_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "alice");
    }

    #[tokio::test]
    async fn loopback_engine_echoes_actions() {
        let engine = LoopbackGameEngine;
        let alice = principal("alice");
        let delta = engine
            .player_action(&table(), &alice, json!({ "action": "fold" }))
            .await
            .unwrap();
        assert_eq!(delta["action"]["action"], "fold");
        assert_eq!(delta["tableId"], "t1");
    }

    #[tokio::test]
    async fn audit_sink_counts_by_kind() {
        let sink = TracingAuditSink::new();
        sink.emit(AuditEvent::new(
            AuditKind::RateLimit,
            Severity::Warning,
            json!({}),
        ))
        .await;
        sink.emit(AuditEvent::new(
            AuditKind::RateLimit,
            Severity::Warning,
            json!({}),
        ))
        .await;
        sink.emit(AuditEvent::new(AuditKind::Login, Severity::Info, json!({})))
            .await;

        assert_eq!(sink.count(AuditKind::RateLimit), 2);
        assert_eq!(sink.count(AuditKind::Login), 1);
        assert_eq!(sink.count(AuditKind::Disconnect), 0);
    }

    #[test]
    fn chat_record_serializes_camel_case() {
        let now = Utc::now();
        let record = ChatRecord {
            id: Uuid::new_v4(),
            player_id: Uuid::new_v4(),
            table_id: Some(table()),
            tournament_id: None,
            message: "gg".into(),
            message_type: "chat".into(),
            is_moderated: false,
            moderation_reason: None,
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("playerId").is_some());
        assert!(value.get("messageType").is_some());
        assert!(value.get("createdAt").is_some());
        assert!(value.get("tournamentId").is_none());
    }
}
