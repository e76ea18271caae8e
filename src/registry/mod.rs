use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::Pipeline;
use crate::protocol::TableId;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Grace,
    Closed,
}

/// Load tag set by the back end to steer unicast fanouts away from slow
/// peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadTag {
    Normal,
    High,
}

// ============================================================================
// Connection
// ============================================================================

struct ConnectionTimers {
    grace: Option<JoinHandle<()>>,
    idle: Option<JoinHandle<()>>,
}

/// Server-side bookkeeping for one upgraded socket.
///
/// The registry exclusively owns these; every other component refers to a
/// connection by id and re-resolves through the registry. Small mutable
/// fields use `std::sync::Mutex` — none are held across an await.
pub struct Connection {
    pub id: ConnectionId,
    pub principal: Principal,
    pub created_at: DateTime<Utc>,
    /// Whether this client accepted compressed batches (`compression=off`
    /// opts out at upgrade).
    pub compression: bool,
    pub pipeline: Pipeline,
    table_id: StdMutex<TableId>,
    state: StdMutex<ConnectionState>,
    load: StdMutex<LoadTag>,
    last_activity: StdMutex<Instant>,
    last_pong: StdMutex<Instant>,
    reconnect_count: AtomicU32,
    /// Set by `leave_table`; suppresses the grace window on socket close.
    explicit_leave: AtomicBool,
    pending_acks: StdMutex<HashSet<u64>>,
    timers: StdMutex<ConnectionTimers>,
}

impl Connection {
    pub fn new(principal: Principal, table_id: TableId, pipeline: Pipeline, compression: bool) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            principal,
            created_at: Utc::now(),
            compression,
            pipeline,
            table_id: StdMutex::new(table_id),
            state: StdMutex::new(ConnectionState::Open),
            load: StdMutex::new(LoadTag::Normal),
            last_activity: StdMutex::new(now),
            last_pong: StdMutex::new(now),
            reconnect_count: AtomicU32::new(0),
            explicit_leave: AtomicBool::new(false),
            pending_acks: StdMutex::new(HashSet::new()),
            timers: StdMutex::new(ConnectionTimers {
                grace: None,
                idle: None,
            }),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id.lock().unwrap().clone()
    }

    pub(crate) fn set_table_id(&self, table_id: TableId) {
        *self.table_id.lock().unwrap() = table_id;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Atomically transition between states; returns false when the
    /// connection was not in `from` (someone else already moved it).
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    pub fn load(&self) -> LoadTag {
        *self.load.lock().unwrap()
    }

    pub fn set_load(&self, tag: LoadTag) {
        *self.load.lock().unwrap() = tag;
    }

    pub fn touch_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn touch_pong(&self) {
        *self.last_pong.lock().unwrap() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn note_reconnect(&self) -> u32 {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn mark_explicit_leave(&self) {
        self.explicit_leave.store(true, Ordering::Relaxed);
    }

    pub fn left_explicitly(&self) -> bool {
        self.explicit_leave.load(Ordering::Relaxed)
    }

    /// Track an outbound sequence id awaiting client acknowledgement.
    pub fn track_ack(&self, sequence_id: u64) {
        self.pending_acks.lock().unwrap().insert(sequence_id);
    }

    /// Returns true when the sequence id was actually pending.
    pub fn resolve_ack(&self, sequence_id: u64) -> bool {
        self.pending_acks.lock().unwrap().remove(&sequence_id)
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().unwrap().len()
    }

    pub fn set_grace_timer(&self, handle: JoinHandle<()>) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.grace.replace(handle) {
            old.abort();
        }
    }

    pub fn cancel_grace_timer(&self) {
        if let Some(timer) = self.timers.lock().unwrap().grace.take() {
            timer.abort();
        }
    }

    pub fn set_idle_timer(&self, handle: JoinHandle<()>) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.idle.replace(handle) {
            old.abort();
        }
    }

    /// Abort every timer this connection owns. After this, no timer owned by
    /// the connection will fire.
    pub fn abort_timers(&self) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(timer) = timers.grace.take() {
            timer.abort();
        }
        if let Some(timer) = timers.idle.take() {
            timer.abort();
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_principal: HashMap<Uuid, ConnectionId>,
    by_table: HashMap<TableId, HashSet<ConnectionId>>,
}

/// Tracks live connections under one lock so the three indexes can never
/// disagree: no caller observes a half-installed connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a connection in all three indexes.
    ///
    /// A live entry for the same principal at this point is an invariant
    /// violation — the pool replaces prior connections before inserting.
    pub async fn insert(&self, connection: Arc<Connection>) -> GatewayResult<()> {
        let mut inner = self.inner.write().await;
        let user_id = connection.principal.user_id;
        if inner.by_principal.contains_key(&user_id) {
            return Err(GatewayError::Fatal(format!(
                "principal {user_id} already has a live connection"
            )));
        }
        inner.by_principal.insert(user_id, connection.id);
        inner
            .by_table
            .entry(connection.table_id())
            .or_default()
            .insert(connection.id);
        inner.by_id.insert(connection.id, connection);
        Ok(())
    }

    /// Remove a connection from every index. Idempotent.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        let connection = inner.by_id.remove(&id)?;

        let user_id = connection.principal.user_id;
        if inner.by_principal.get(&user_id) == Some(&id) {
            inner.by_principal.remove(&user_id);
        }

        let table_id = connection.table_id();
        if let Some(set) = inner.by_table.get_mut(&table_id) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_table.remove(&table_id);
            }
        }

        Some(connection)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    pub async fn get_by_principal(&self, user_id: Uuid) -> Option<Arc<Connection>> {
        let inner = self.inner.read().await;
        let id = inner.by_principal.get(&user_id)?;
        inner.by_id.get(id).cloned()
    }

    /// Rebind a connection to a different table, updating the table index in
    /// the same critical section.
    pub async fn move_table(&self, id: ConnectionId, new_table: TableId) -> GatewayResult<()> {
        let mut inner = self.inner.write().await;
        let connection = inner
            .by_id
            .get(&id)
            .cloned()
            .ok_or(GatewayError::ConnectionFailed)?;

        let old_table = connection.table_id();
        if old_table == new_table {
            return Ok(());
        }

        if let Some(set) = inner.by_table.get_mut(&old_table) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_table.remove(&old_table);
            }
        }
        inner.by_table.entry(new_table.clone()).or_default().insert(id);
        connection.set_table_id(new_table);
        Ok(())
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn table_connection_count(&self, table_id: &TableId) -> usize {
        self.inner
            .read()
            .await
            .by_table
            .get(table_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub async fn table_connections(&self, table_id: &TableId) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner
            .by_table
            .get(table_id)
            .map(|set| set.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every live connection, for supervisor sweeps.
    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.inner.read().await.by_id.values().cloned().collect()
    }

    /// Drop all connections, returning them for the shutdown close loop.
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        inner.by_principal.clear();
        inner.by_table.clear();
        inner.by_id.drain().map(|(_, c)| c).collect()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
