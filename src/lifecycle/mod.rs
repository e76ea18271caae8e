use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::adapters::{GameEngine, RecoveryPolicy};
use crate::config::Config;
use crate::history::MessageHistory;
use crate::limiter::RateLimiter;
use crate::pool::PoolManager;
use crate::protocol::{Frame, CLOSE_NORMAL, MSG_PING, MSG_RECONNECTION_SUCCESSFUL};
use crate::registry::{Connection, ConnectionRegistry, ConnectionState};

/// Replayed history is enqueued in one priority class so ascending sequence
/// order survives the pipeline's priority sort.
const REPLAY_PRIORITY: u8 = 5;

// ============================================================================
// Retry policies
// ============================================================================

/// Exponential backoff with jitter. Exposed to clients as reconnect hints in
/// the welcome frame; the delivery pipeline itself never retries on the same
/// socket.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn websocket_send() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }

    pub fn websocket_reconnect() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Delay before the given attempt (1-based): exponential growth capped at
    /// `max_delay`, with equal jitter so simultaneous reconnectors spread out.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        let half_ms = (ceiling / 2).as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=half_ms);
        Duration::from_millis(half_ms + jitter)
    }

    pub fn hints(&self) -> serde_json::Value {
        json!({
            "maxAttempts": self.max_attempts,
            "baseDelayMs": self.base_delay.as_millis() as u64,
            "maxDelayMs": self.max_delay.as_millis() as u64,
        })
    }
}

// ============================================================================
// Supervisor
// ============================================================================

struct SupervisorInner {
    config: Arc<Config>,
    registry: Arc<ConnectionRegistry>,
    pool: PoolManager,
    history: Arc<MessageHistory>,
    limiter: Arc<RateLimiter>,
    game: Arc<dyn GameEngine>,
}

/// Owns the connection lifecycle: heartbeats, stale detection, the grace
/// window with auto-fold, reconnect replay, and the periodic cleanup task.
///
/// Cheaply cloneable — all clones share the same state via `Arc`.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ConnectionRegistry>,
        pool: PoolManager,
        history: Arc<MessageHistory>,
        limiter: Arc<RateLimiter>,
        game: Arc<dyn GameEngine>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                registry,
                pool,
                history,
                limiter,
                game,
            }),
        }
    }

    /// Spawn the background loops. The returned handles are aborted at
    /// shutdown.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let supervisor = self.clone();
            let period = supervisor.inner.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    supervisor.heartbeat_tick().await;
                }
            })
        };

        let stale = {
            let supervisor = self.clone();
            let period = supervisor.inner.config.heartbeat_interval / 2;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    supervisor.stale_tick().await;
                }
            })
        };

        let cleanup = {
            let supervisor = self.clone();
            let period = supervisor.inner.config.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    supervisor.cleanup_tick().await;
                }
            })
        };

        vec![heartbeat, stale, cleanup]
    }

    /// Ping every open connection; any inbound frame refreshes the pong
    /// stamp.
    pub async fn heartbeat_tick(&self) {
        for connection in self.inner.registry.all().await {
            if connection.state() == ConnectionState::Open {
                connection
                    .pipeline
                    .enqueue(Frame::new(MSG_PING, json!({})))
                    .await;
            }
        }
    }

    /// Move connections whose peer went quiet into the grace window.
    pub async fn stale_tick(&self) {
        let now = Instant::now();
        for connection in self.inner.registry.all().await {
            if connection.state() != ConnectionState::Open {
                continue;
            }
            if now.duration_since(connection.last_pong()) > self.inner.config.connection_timeout {
                tracing::info!(
                    connection_id = %connection.id,
                    user_id = %connection.principal.user_id,
                    "Missed-pong threshold exceeded; starting grace window"
                );
                self.begin_grace(connection).await;
            }
        }
    }

    /// Periodic housekeeping: trim history rings and collect idle rate
    /// buckets.
    pub async fn cleanup_tick(&self) {
        self.inner.history.trim().await;
        self.inner.limiter.collect_idle().await;
    }

    /// Entry point for a socket that went away. Explicit leavers and already
    /// terminated connections are final; everyone else gets a grace window.
    pub async fn handle_socket_closed(&self, connection: Arc<Connection>) {
        if connection.state() == ConnectionState::Closed {
            return;
        }
        if connection.left_explicitly() {
            self.inner
                .pool
                .terminate(&connection, CLOSE_NORMAL, "left table")
                .await;
            return;
        }
        self.begin_grace(connection).await;
    }

    /// Start the reconnect window: detach the dead socket, tell the table,
    /// ask the game engine for its recovery policy, and arm the expiry timer.
    pub async fn begin_grace(&self, connection: Arc<Connection>) {
        if !connection.transition(ConnectionState::Open, ConnectionState::Grace) {
            return;
        }
        connection.pipeline.detach().await;

        let table_id = connection.table_id();
        let username = connection.principal.username.clone();
        let grace = self.inner.config.grace_period;

        self.inner
            .pool
            .broadcast_system(
                &table_id,
                &format!("{username} disconnected ({}s to reconnect)", grace.as_secs()),
            )
            .await;

        let policy = self
            .inner
            .game
            .player_disconnected(&table_id, &connection.principal, grace)
            .await;

        let supervisor = self.clone();
        let conn = Arc::clone(&connection);
        connection.set_grace_timer(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            supervisor.expire_grace(conn, policy).await;
        }));
    }

    async fn expire_grace(&self, connection: Arc<Connection>, policy: RecoveryPolicy) {
        if connection.state() != ConnectionState::Grace {
            return;
        }
        let table_id = connection.table_id();
        if policy == RecoveryPolicy::AutoFold {
            self.inner
                .pool
                .broadcast_system(
                    &table_id,
                    &format!(
                        "{} folded due to disconnection",
                        connection.principal.username
                    ),
                )
                .await;
        }
        self.inner
            .pool
            .terminate(&connection, CLOSE_NORMAL, "grace period expired")
            .await;
    }

    /// Announce a successful takeover to the table.
    pub async fn announce_reconnect(&self, connection: &Arc<Connection>) {
        let table_id = connection.table_id();
        self.inner
            .pool
            .broadcast_system(
                &table_id,
                &format!("{} reconnected", connection.principal.username),
            )
            .await;
    }

    /// Replay history the client missed: one `reconnection_successful` frame
    /// followed by every recorded frame past the client's watermark, in
    /// ascending sequence order (heartbeats are never recorded).
    pub async fn replay(&self, connection: &Arc<Connection>, last_seen: u64) -> usize {
        let table_id = connection.table_id();
        let missed = self.inner.history.missed_since(&table_id, last_seen).await;

        connection
            .pipeline
            .send_direct(&Frame::new(
                MSG_RECONNECTION_SUCCESSFUL,
                json!({ "missedUpdates": missed.len() }),
            ))
            .await;

        let count = missed.len();
        for frame in missed {
            connection
                .pipeline
                .enqueue_with_priority(frame, REPLAY_PRIORITY)
                .await;
        }
        connection.pipeline.flush().await;
        count
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
