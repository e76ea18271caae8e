use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::adapters::{AuditEvent, AuditKind, AuditSink, Severity};
use crate::auth::Principal;
use crate::channels::{ChannelKind, ChannelMultiplexer};
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::history::MessageHistory;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::protocol::codec::WireMessage;
use crate::protocol::{Frame, TableId, CLOSE_NORMAL};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, ConnectionState, LoadTag};

// ============================================================================
// Counters
// ============================================================================

#[derive(Default)]
struct PoolCounters {
    admitted: AtomicU64,
    connection_reuses: AtomicU64,
    idle_connections_removed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub admitted: u64,
    pub connection_reuses: u64,
    pub idle_connections_removed: u64,
    pub rejected: u64,
}

// ============================================================================
// Admission
// ============================================================================

/// How an upgrade was installed: a brand-new connection, or a takeover of a
/// graced connection by the same principal (the caller replays history for
/// the latter).
pub enum Admission {
    New(Arc<Connection>),
    Reconnected(Arc<Connection>),
}

impl Admission {
    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            Admission::New(conn) | Admission::Reconnected(conn) => conn,
        }
    }
}

// ============================================================================
// Pool manager
// ============================================================================

struct PoolInner {
    config: Arc<Config>,
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelMultiplexer>,
    history: Arc<MessageHistory>,
    audit: Arc<dyn AuditSink>,
    counters: PoolCounters,
    pending: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

/// Enforces admission caps, reuses slots for returning principals, evicts
/// idle connections, and fans broadcasts out to table subscribers.
///
/// Cheaply cloneable — all clones share the same state via `Arc`.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl PoolManager {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ConnectionRegistry>,
        channels: Arc<ChannelMultiplexer>,
        history: Arc<MessageHistory>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                registry,
                channels,
                history,
                audit,
                counters: PoolCounters::default(),
                pending: Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Admission contract: cap checks, then same-principal reuse, then
    /// install. A graced connection for the same principal is rebound to the
    /// new socket instead of being replaced.
    pub async fn admit(
        &self,
        principal: Principal,
        table_id: TableId,
        sink: UnboundedSender<WireMessage>,
        compression: bool,
    ) -> GatewayResult<Admission> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Relaxed) {
            return Err(GatewayError::ConnectionFailed);
        }

        let prior = inner.registry.get_by_principal(principal.user_id).await;

        // Cap checks never count the principal's own slot: a replacement or
        // reconnect leaves totals unchanged.
        let own = usize::from(prior.is_some());
        let own_at_table = usize::from(
            prior
                .as_ref()
                .map(|p| p.table_id() == table_id)
                .unwrap_or(false),
        );
        if inner.registry.connection_count().await - own >= inner.config.max_total_connections {
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::TotalConnectionLimit);
        }
        if inner.registry.table_connection_count(&table_id).await - own_at_table
            >= inner.config.max_connections_per_table
        {
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::TableConnectionLimit);
        }

        if let Some(prior) = prior {
            if prior.state() == ConnectionState::Grace {
                return Ok(Admission::Reconnected(
                    self.resume(prior, table_id, sink).await?,
                ));
            }
            // A second upgrade for a live principal replaces the old socket.
            tracing::info!(
                user_id = %principal.user_id,
                connection_id = %prior.id,
                "Replacing existing connection for principal"
            );
            self.terminate(&prior, CLOSE_NORMAL, "replaced").await;
            inner
                .counters
                .connection_reuses
                .fetch_add(1, Ordering::Relaxed);
        }

        let settings = PipelineSettings::from_config(&inner.config, compression);
        let connection = Arc::new(Connection::new(
            principal,
            table_id,
            Pipeline::new(settings, sink),
            compression,
        ));

        if let Err(e) = inner.registry.insert(connection.clone()).await {
            // A live entry for this principal at this point means the
            // registry and pool disagree about who is connected.
            inner
                .audit
                .emit(AuditEvent::for_connection(
                    AuditKind::SuspiciousActivity,
                    Severity::High,
                    connection.principal.user_id,
                    connection.id,
                    json!({ "reason": "duplicate principal at insert" }),
                ))
                .await;
            return Err(e);
        }

        inner.counters.admitted.fetch_add(1, Ordering::Relaxed);
        self.start_idle_watch(&connection);
        inner
            .audit
            .emit(AuditEvent::for_connection(
                AuditKind::Login,
                Severity::Info,
                connection.principal.user_id,
                connection.id,
                json!({ "tableId": connection.table_id() }),
            ))
            .await;

        Ok(Admission::New(connection))
    }

    /// Rebind a graced connection to a fresh socket.
    async fn resume(
        &self,
        connection: Arc<Connection>,
        table_id: TableId,
        sink: UnboundedSender<WireMessage>,
    ) -> GatewayResult<Arc<Connection>> {
        connection.cancel_grace_timer();
        connection.pipeline.rebind(sink).await;
        if connection.table_id() != table_id {
            self.inner
                .registry
                .move_table(connection.id, table_id)
                .await?;
        }
        connection.set_state(ConnectionState::Open);
        connection.touch_activity();
        connection.touch_pong();
        connection.note_reconnect();
        self.inner
            .counters
            .connection_reuses
            .fetch_add(1, Ordering::Relaxed);
        self.start_idle_watch(&connection);
        Ok(connection)
    }

    /// Close a connection and remove every trace of it. Idempotent: a
    /// connection that already left the registry is only audited once because
    /// `remove` returns `None` the second time.
    pub async fn terminate(&self, connection: &Arc<Connection>, code: u16, reason: &str) {
        connection.abort_timers();
        connection.set_state(ConnectionState::Closed);
        connection.pipeline.send_close(code, reason).await;
        connection.pipeline.shutdown().await;
        self.inner.channels.remove_connection(connection.id).await;
        if self.inner.registry.remove(connection.id).await.is_some() {
            self.inner
                .audit
                .emit(AuditEvent::for_connection(
                    AuditKind::Disconnect,
                    Severity::Info,
                    connection.principal.user_id,
                    connection.id,
                    json!({ "reason": reason }),
                ))
                .await;
        }
    }

    /// Arm (or re-arm) the inactivity eviction watch. The task re-checks the
    /// activity stamp at each computed deadline, so any inbound frame pushes
    /// the eviction out without touching the timer.
    fn start_idle_watch(&self, connection: &Arc<Connection>) {
        let pool = self.clone();
        let conn = Arc::clone(connection);
        let idle_timeout = self.inner.config.idle_timeout;

        connection.set_idle_timer(tokio::spawn(async move {
            loop {
                let last = conn.last_activity();
                tokio::time::sleep_until(last + idle_timeout).await;
                if conn.state() != ConnectionState::Open {
                    return;
                }
                if conn.last_activity() == last {
                    tracing::info!(
                        connection_id = %conn.id,
                        user_id = %conn.principal.user_id,
                        "Evicting idle connection"
                    );
                    pool.inner
                        .counters
                        .idle_connections_removed
                        .fetch_add(1, Ordering::Relaxed);
                    pool.terminate(&conn, CLOSE_NORMAL, "idle timeout").await;
                    return;
                }
            }
        }));
    }

    // ── Broadcast ────────────────────────────────────────────────────────

    /// Record the frame in the table's history ring and enqueue it on every
    /// GAME-channel subscriber of the table. Per-connection failures are
    /// counted by the pipeline and never abort the fan-out. Returns the
    /// number of connections reached.
    pub async fn broadcast_to_table(&self, table_id: &TableId, frame: Frame) -> usize {
        let stamped = self.inner.history.record(table_id, frame).await;
        let subscribers = self
            .inner
            .channels
            .subscribers(ChannelKind::Game, Some(table_id))
            .await;

        let mut reached = 0;
        for id in subscribers {
            let Some(connection) = self.inner.registry.get(id).await else {
                continue;
            };
            if connection.state() == ConnectionState::Closed {
                continue;
            }
            if stamped.requires_ack == Some(true) {
                if let Some(sequence_id) = stamped.sequence_id {
                    connection.track_ack(sequence_id);
                }
            }
            connection.pipeline.enqueue(stamped.clone()).await;
            reached += 1;
        }
        reached
    }

    /// Broadcast a server-originated chat line to the table.
    pub async fn broadcast_system(&self, table_id: &TableId, text: &str) -> usize {
        self.broadcast_to_table(table_id, Frame::system(text)).await
    }

    // ── Load signals ─────────────────────────────────────────────────────

    /// Pick a connection for unicast fanout, preferring peers not marked
    /// high-load.
    pub async fn optimal_connection(&self, table_id: &TableId) -> Option<Arc<Connection>> {
        let members = self.inner.registry.table_connections(table_id).await;
        members
            .iter()
            .find(|c| c.state() == ConnectionState::Open && c.load() == LoadTag::Normal)
            .or_else(|| members.iter().find(|c| c.state() == ConnectionState::Open))
            .cloned()
    }

    pub async fn mark_connection_load(&self, id: ConnectionId, tag: LoadTag) -> bool {
        match self.inner.registry.get(id).await {
            Some(connection) => {
                connection.set_load(tag);
                true
            }
            None => false,
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Track an in-flight operation that shutdown must wait for.
    pub async fn register_pending_operation(&self, handle: JoinHandle<()>) {
        self.inner.pending.lock().await.push(handle);
    }

    /// Close every socket, cancel every timer, clear every map, then await
    /// registered pending operations.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Relaxed);

        for connection in self.inner.registry.drain().await {
            connection.abort_timers();
            connection.set_state(ConnectionState::Closed);
            connection
                .pipeline
                .send_close(CLOSE_NORMAL, "Server shutdown")
                .await;
            connection.pipeline.shutdown().await;
            self.inner.channels.remove_connection(connection.id).await;
        }

        let pending = std::mem::take(&mut *self.inner.pending.lock().await);
        for handle in pending {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = ?e, "Pending operation failed during shutdown");
                }
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let counters = &self.inner.counters;
        PoolSnapshot {
            admitted: counters.admitted.load(Ordering::Relaxed),
            connection_reuses: counters.connection_reuses.load(Ordering::Relaxed),
            idle_connections_removed: counters.idle_connections_removed.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::TracingAuditSink;
    use crate::auth::Role;
    use crate::protocol::MSG_GAME_UPDATE;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Harness {
        pool: PoolManager,
        channels: Arc<ChannelMultiplexer>,
        registry: Arc<ConnectionRegistry>,
        audit: Arc<TracingAuditSink>,
    }

    fn harness(config: Config) -> Harness {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new());
        let channels = Arc::new(ChannelMultiplexer::new(config.max_channels_per_connection));
        let history = Arc::new(MessageHistory::default());
        let audit = Arc::new(TracingAuditSink::new());
        let pool = PoolManager::new(
            config,
            registry.clone(),
            channels.clone(),
            history,
            audit.clone(),
        );
        Harness {
            pool,
            channels,
            registry,
            audit,
        }
    }

    fn principal(name: &str) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            username: name.into(),
            role: Role::Player,
        }
    }

    fn sink() -> (
        UnboundedSender<WireMessage>,
        mpsc::UnboundedReceiver<WireMessage>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn per_table_cap_rejects_with_the_documented_reason() {
        let h = harness(Config {
            max_connections_per_table: 3,
            ..Default::default()
        });

        for i in 0..3 {
            let (tx, _rx) = sink();
            h.pool
                .admit(principal(&format!("p{i}")), "t1".into(), tx, true)
                .await
                .expect("under the cap");
        }

        let (tx, _rx) = sink();
        let rejected = h.pool.admit(principal("p4"), "t1".into(), tx, true).await;
        assert!(matches!(rejected, Err(GatewayError::TableConnectionLimit)));

        // A different table is unaffected.
        let (tx, _rx) = sink();
        assert!(h
            .pool
            .admit(principal("p5"), "t2".into(), tx, true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn global_cap_rejects_with_the_documented_reason() {
        let h = harness(Config {
            max_total_connections: 2,
            ..Default::default()
        });

        for i in 0..2 {
            let (tx, _rx) = sink();
            h.pool
                .admit(principal(&format!("p{i}")), format!("t{i}"), tx, true)
                .await
                .unwrap();
        }

        let (tx, _rx) = sink();
        let rejected = h.pool.admit(principal("p3"), "t9".into(), tx, true).await;
        assert!(matches!(rejected, Err(GatewayError::TotalConnectionLimit)));
    }

    #[tokio::test]
    async fn same_principal_upgrade_replaces_the_prior_socket() {
        let h = harness(Config::default());
        let alice = principal("alice");

        let (tx1, mut rx1) = sink();
        let first = h
            .pool
            .admit(alice.clone(), "t1".into(), tx1, true)
            .await
            .unwrap();
        let first_id = first.connection().id;

        let (tx2, _rx2) = sink();
        let second = h
            .pool
            .admit(alice.clone(), "t2".into(), tx2, true)
            .await
            .unwrap();
        assert!(matches!(second, Admission::New(_)));
        assert_ne!(second.connection().id, first_id);

        // The old socket got a normal close with the replace reason.
        let close = rx1.recv().await.unwrap();
        assert_eq!(
            close,
            WireMessage::Close {
                code: CLOSE_NORMAL,
                reason: "replaced".into()
            }
        );

        // Exactly one live connection for the principal, on the new table.
        assert_eq!(h.registry.connection_count().await, 1);
        let live = h.registry.get_by_principal(alice.user_id).await.unwrap();
        assert_eq!(live.table_id(), "t2");
        assert_eq!(h.pool.snapshot().connection_reuses, 1);
    }

    #[tokio::test]
    async fn replacement_is_not_blocked_by_a_full_table() {
        let h = harness(Config {
            max_connections_per_table: 1,
            ..Default::default()
        });
        let alice = principal("alice");

        let (tx1, _rx1) = sink();
        h.pool
            .admit(alice.clone(), "t1".into(), tx1, true)
            .await
            .unwrap();

        // Alice reconnecting to her own full table must not be rejected.
        let (tx2, _rx2) = sink();
        assert!(h.pool.admit(alice, "t1".into(), tx2, true).await.is_ok());
    }

    #[tokio::test]
    async fn graced_connection_is_resumed_not_replaced() {
        let h = harness(Config::default());
        let alice = principal("alice");

        let (tx1, _rx1) = sink();
        let first = h
            .pool
            .admit(alice.clone(), "t1".into(), tx1, true)
            .await
            .unwrap();
        let conn = first.connection().clone();
        conn.set_state(ConnectionState::Grace);
        conn.pipeline.detach().await;

        let (tx2, _rx2) = sink();
        let admission = h.pool.admit(alice, "t1".into(), tx2, true).await.unwrap();
        match admission {
            Admission::Reconnected(resumed) => {
                assert_eq!(resumed.id, conn.id);
                assert_eq!(resumed.state(), ConnectionState::Open);
                assert_eq!(resumed.reconnect_count(), 1);
            }
            Admission::New(_) => panic!("grace takeover must reuse the connection"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_exactly_game_subscribers() {
        let h = harness(Config::default());
        let table: TableId = "t1".into();

        let (tx_a, mut rx_a) = sink();
        let a = h
            .pool
            .admit(principal("a"), table.clone(), tx_a, true)
            .await
            .unwrap();
        let (tx_b, mut rx_b) = sink();
        let b = h
            .pool
            .admit(principal("b"), table.clone(), tx_b, true)
            .await
            .unwrap();
        let (tx_c, mut rx_c) = sink();
        let _c = h
            .pool
            .admit(principal("c"), table.clone(), tx_c, true)
            .await
            .unwrap();

        // Only a and b subscribe to the game channel.
        for conn in [a.connection(), b.connection()] {
            h.channels
                .subscribe(conn.id, Role::Player, ChannelKind::Game, Some(table.clone()))
                .await
                .unwrap();
        }

        let reached = h
            .pool
            .broadcast_to_table(&table, Frame::new(MSG_GAME_UPDATE, json!({ "pot": 40 })))
            .await;
        assert_eq!(reached, 2);

        for conn in [a.connection(), b.connection()] {
            conn.pipeline.flush().await;
        }
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
        assert!(rx_c.try_recv().is_err(), "non-subscriber must not receive");
    }

    #[tokio::test]
    async fn broadcast_frames_carry_increasing_sequence_ids() {
        let h = harness(Config::default());
        let table: TableId = "t1".into();

        let (tx, mut rx) = sink();
        let a = h
            .pool
            .admit(principal("a"), table.clone(), tx, true)
            .await
            .unwrap();
        h.channels
            .subscribe(
                a.connection().id,
                Role::Player,
                ChannelKind::Game,
                Some(table.clone()),
            )
            .await
            .unwrap();

        h.pool
            .broadcast_to_table(&table, Frame::new(MSG_GAME_UPDATE, json!({ "n": 1 })))
            .await;
        h.pool
            .broadcast_to_table(&table, Frame::new(MSG_GAME_UPDATE, json!({ "n": 2 })))
            .await;
        a.connection().pipeline.flush().await;

        let text = match rx.recv().await.unwrap() {
            WireMessage::Text(t) => t,
            other => panic!("expected text, got {other:?}"),
        };
        let batch: Frame = serde_json::from_str(&text).unwrap();
        let frames: Vec<Frame> = serde_json::from_value(batch.payload["messages"].clone()).unwrap();
        let seqs: Vec<u64> = frames.iter().filter_map(|f| f.sequence_id).collect();
        assert_eq!(seqs.len(), 2);
        assert!(seqs[0] < seqs[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_evicted() {
        let h = harness(Config {
            idle_timeout: Duration::from_secs(5),
            ..Default::default()
        });

        let (tx, mut rx) = sink();
        let admission = h
            .pool
            .admit(principal("sleepy"), "t1".into(), tx, true)
            .await
            .unwrap();
        let conn = admission.connection().clone();

        tokio::time::advance(Duration::from_secs(6)).await;
        // Let the idle watch task run to completion.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(h.registry.get(conn.id).await.is_none());
        assert_eq!(h.pool.snapshot().idle_connections_removed, 1);
        let mut saw_close = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, WireMessage::Close { code: CLOSE_NORMAL, .. }) {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_defers_idle_eviction() {
        let h = harness(Config {
            idle_timeout: Duration::from_secs(5),
            ..Default::default()
        });

        let (tx, _rx) = sink();
        let admission = h
            .pool
            .admit(principal("busy"), "t1".into(), tx, true)
            .await
            .unwrap();
        let conn = admission.connection().clone();

        tokio::time::advance(Duration::from_secs(4)).await;
        conn.touch_activity();
        tokio::time::advance(Duration::from_secs(4)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(h.registry.get(conn.id).await.is_some(), "still active");
    }

    #[tokio::test]
    async fn optimal_connection_prefers_normal_load() {
        let h = harness(Config::default());
        let table: TableId = "t1".into();

        let (tx_a, _rx_a) = sink();
        let a = h
            .pool
            .admit(principal("a"), table.clone(), tx_a, true)
            .await
            .unwrap();
        let (tx_b, _rx_b) = sink();
        let b = h
            .pool
            .admit(principal("b"), table.clone(), tx_b, true)
            .await
            .unwrap();

        h.pool
            .mark_connection_load(a.connection().id, LoadTag::High)
            .await;

        let optimal = h.pool.optimal_connection(&table).await.unwrap();
        assert_eq!(optimal.id, b.connection().id);
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_drains_pending() {
        let h = harness(Config::default());

        let (tx, mut rx) = sink();
        h.pool
            .admit(principal("a"), "t1".into(), tx, true)
            .await
            .unwrap();

        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        h.pool
            .register_pending_operation(tokio::spawn(async move {
                flag.store(true, Ordering::Relaxed);
            }))
            .await;

        h.pool.shutdown().await;

        assert_eq!(h.registry.connection_count().await, 0);
        assert!(drained.load(Ordering::Relaxed));
        let mut saw_shutdown_close = false;
        while let Ok(msg) = rx.try_recv() {
            if let WireMessage::Close { reason, .. } = msg {
                assert_eq!(reason, "Server shutdown");
                saw_shutdown_close = true;
            }
        }
        assert!(saw_shutdown_close);

        // New admissions are refused while shutting down.
        let (tx, _rx) = sink();
        assert!(h
            .pool
            .admit(principal("late"), "t1".into(), tx, true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn terminate_emits_a_disconnect_audit_event() {
        let h = harness(Config::default());
        let (tx, _rx) = sink();
        let admission = h
            .pool
            .admit(principal("a"), "t1".into(), tx, true)
            .await
            .unwrap();

        h.pool
            .terminate(admission.connection(), CLOSE_NORMAL, "test close")
            .await;
        assert_eq!(h.audit.count(AuditKind::Disconnect), 1);
    }
}
