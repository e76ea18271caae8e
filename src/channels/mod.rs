use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use strum::{Display, EnumString};
use tokio::sync::RwLock;

use crate::auth::Role;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::TableId;
use crate::registry::ConnectionId;

// ============================================================================
// Channels
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChannelKind {
    Game,
    Lobby,
    Chat,
    Spectator,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    Read,
    Write,
    Broadcast,
}

/// Permissions a role holds on a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionSet {
    pub read: bool,
    pub write: bool,
    pub broadcast: bool,
}

impl PermissionSet {
    pub const NONE: Self = Self {
        read: false,
        write: false,
        broadcast: false,
    };
    pub const READ: Self = Self {
        read: true,
        write: false,
        broadcast: false,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        broadcast: false,
    };
    pub const ALL: Self = Self {
        read: true,
        write: true,
        broadcast: true,
    };

    pub fn allows(&self, action: ChannelAction) -> bool {
        match action {
            ChannelAction::Read => self.read,
            ChannelAction::Write => self.write,
            ChannelAction::Broadcast => self.broadcast,
        }
    }

    /// Wire form for `subscription_confirmed { grantedPermissions }`.
    pub fn granted(&self) -> Vec<&'static str> {
        let mut granted = Vec::with_capacity(3);
        if self.read {
            granted.push("read");
        }
        if self.write {
            granted.push("write");
        }
        if self.broadcast {
            granted.push("broadcast");
        }
        granted
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_subscriptions_per_connection: usize,
    pub requires_table_id: bool,
    pub rate_limit_per_minute: Option<u32>,
    pub player: PermissionSet,
    pub spectator: PermissionSet,
    pub admin: PermissionSet,
}

impl ChannelConfig {
    pub fn permissions_for(&self, role: Role) -> PermissionSet {
        match role {
            Role::Player => self.player,
            Role::Spectator => self.spectator,
            Role::Admin => self.admin,
        }
    }
}

static CHANNEL_CONFIGS: Lazy<HashMap<ChannelKind, ChannelConfig>> = Lazy::new(|| {
    HashMap::from([
        (
            ChannelKind::Game,
            ChannelConfig {
                max_subscriptions_per_connection: 1,
                requires_table_id: true,
                rate_limit_per_minute: None,
                player: PermissionSet::READ_WRITE,
                spectator: PermissionSet::NONE,
                admin: PermissionSet::READ_WRITE,
            },
        ),
        (
            ChannelKind::Lobby,
            ChannelConfig {
                max_subscriptions_per_connection: 1,
                requires_table_id: false,
                rate_limit_per_minute: None,
                player: PermissionSet::READ,
                spectator: PermissionSet::READ,
                admin: PermissionSet::READ_WRITE,
            },
        ),
        (
            ChannelKind::Chat,
            ChannelConfig {
                max_subscriptions_per_connection: 5,
                requires_table_id: true,
                rate_limit_per_minute: Some(30),
                player: PermissionSet::READ_WRITE,
                spectator: PermissionSet::READ,
                admin: PermissionSet::READ_WRITE,
            },
        ),
        (
            ChannelKind::Spectator,
            ChannelConfig {
                max_subscriptions_per_connection: 3,
                requires_table_id: true,
                rate_limit_per_minute: None,
                player: PermissionSet::NONE,
                spectator: PermissionSet::READ,
                admin: PermissionSet::READ,
            },
        ),
        (
            ChannelKind::Admin,
            ChannelConfig {
                max_subscriptions_per_connection: 1,
                requires_table_id: false,
                rate_limit_per_minute: None,
                player: PermissionSet::NONE,
                spectator: PermissionSet::NONE,
                admin: PermissionSet::ALL,
            },
        ),
    ])
});

impl ChannelKind {
    pub fn config(&self) -> &'static ChannelConfig {
        &CHANNEL_CONFIGS[self]
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Clone)]
pub struct Subscription {
    pub channel: ChannelKind,
    pub table_id: Option<TableId>,
    pub permissions: PermissionSet,
    pub subscribed_at: DateTime<Utc>,
}

type SubscriberKey = (ChannelKind, Option<TableId>);

#[derive(Default)]
struct MuxInner {
    by_connection: HashMap<ConnectionId, Vec<Subscription>>,
    subscribers: HashMap<SubscriberKey, HashSet<ConnectionId>>,
}

/// Subscription state for every live connection, plus the
/// `(channel, table) → subscriber set` index used for broadcast fan-out.
///
/// Cheaply cloneable is not needed here — the multiplexer is shared behind an
/// `Arc` in the gateway state, and all mutation goes through `&self`.
pub struct ChannelMultiplexer {
    inner: RwLock<MuxInner>,
    max_channels_per_connection: usize,
}

impl ChannelMultiplexer {
    pub fn new(max_channels_per_connection: usize) -> Self {
        Self {
            inner: RwLock::new(MuxInner::default()),
            max_channels_per_connection,
        }
    }

    /// Validate and install a subscription, returning the granted permission
    /// set for the confirmation frame.
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        role: Role,
        channel: ChannelKind,
        table_id: Option<TableId>,
    ) -> GatewayResult<PermissionSet> {
        let config = channel.config();

        if config.requires_table_id && table_id.is_none() {
            return Err(GatewayError::TableIdRequired);
        }

        let permissions = config.permissions_for(role);
        if !permissions.read {
            return Err(GatewayError::InsufficientPermissions);
        }

        let mut inner = self.inner.write().await;
        let subs = inner.by_connection.entry(connection_id).or_default();

        if subs
            .iter()
            .any(|s| s.channel == channel && s.table_id == table_id)
        {
            // A (channel, table) pair is present at most once; re-subscribing
            // is an idempotent confirmation.
            return Ok(permissions);
        }

        if subs.len() >= self.max_channels_per_connection {
            return Err(GatewayError::TotalSubscriptionCap);
        }

        let per_channel = subs.iter().filter(|s| s.channel == channel).count();
        if per_channel >= config.max_subscriptions_per_connection {
            return Err(GatewayError::ChannelSubscriptionCap);
        }

        subs.push(Subscription {
            channel,
            table_id: table_id.clone(),
            permissions,
            subscribed_at: Utc::now(),
        });
        inner
            .subscribers
            .entry((channel, table_id))
            .or_default()
            .insert(connection_id);

        Ok(permissions)
    }

    pub async fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        channel: ChannelKind,
        table_id: Option<TableId>,
    ) -> GatewayResult<()> {
        let mut inner = self.inner.write().await;

        let subs = inner
            .by_connection
            .get_mut(&connection_id)
            .ok_or(GatewayError::NotSubscribed)?;
        let before = subs.len();
        subs.retain(|s| !(s.channel == channel && s.table_id == table_id));
        if subs.len() == before {
            return Err(GatewayError::NotSubscribed);
        }
        if subs.is_empty() {
            inner.by_connection.remove(&connection_id);
        }

        let key = (channel, table_id);
        if let Some(set) = inner.subscribers.get_mut(&key) {
            set.remove(&connection_id);
            if set.is_empty() {
                inner.subscribers.remove(&key);
            }
        }

        Ok(())
    }

    /// Read-only predicate over the permission matrix for an installed
    /// subscription. Connections without the subscription hold no permissions.
    pub async fn check_permission(
        &self,
        connection_id: ConnectionId,
        channel: ChannelKind,
        table_id: Option<&TableId>,
        action: ChannelAction,
    ) -> bool {
        let inner = self.inner.read().await;
        inner
            .by_connection
            .get(&connection_id)
            .map(|subs| {
                subs.iter().any(|s| {
                    s.channel == channel
                        && s.table_id.as_ref() == table_id
                        && s.permissions.allows(action)
                })
            })
            .unwrap_or(false)
    }

    pub async fn is_subscribed(
        &self,
        connection_id: ConnectionId,
        channel: ChannelKind,
        table_id: Option<&TableId>,
    ) -> bool {
        let inner = self.inner.read().await;
        inner
            .by_connection
            .get(&connection_id)
            .map(|subs| {
                subs.iter()
                    .any(|s| s.channel == channel && s.table_id.as_ref() == table_id)
            })
            .unwrap_or(false)
    }

    /// Current subscriber set for a `(channel, table)` pair.
    pub async fn subscribers(
        &self,
        channel: ChannelKind,
        table_id: Option<&TableId>,
    ) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .subscribers
            .get(&(channel, table_id.cloned()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn subscriptions(&self, connection_id: ConnectionId) -> Vec<Subscription> {
        let inner = self.inner.read().await;
        inner
            .by_connection
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every subscription a connection holds; called on close.
    /// Returns the removed subscriptions so callers can log or audit them.
    pub async fn remove_connection(&self, connection_id: ConnectionId) -> Vec<Subscription> {
        let mut inner = self.inner.write().await;
        let subs = inner.by_connection.remove(&connection_id).unwrap_or_default();
        for sub in &subs {
            let key = (sub.channel, sub.table_id.clone());
            if let Some(set) = inner.subscribers.get_mut(&key) {
                set.remove(&connection_id);
                if set.is_empty() {
                    inner.subscribers.remove(&key);
                }
            }
        }
        subs
    }

    pub async fn subscription_count(&self, connection_id: ConnectionId) -> usize {
        let inner = self.inner.read().await;
        inner
            .by_connection
            .get(&connection_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
