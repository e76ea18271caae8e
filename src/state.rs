use std::sync::Arc;

use crate::adapters::{
    AuditSink, ChatModerator, GameEngine, HttpChatModerator, LoopbackGameEngine, MemoryChatStore,
    PermissiveModerator, TracingAuditSink,
};
use crate::auth::{JwtVerifier, TokenVerifier};
use crate::channels::ChannelMultiplexer;
use crate::config::Config;
use crate::history::MessageHistory;
use crate::lifecycle::Supervisor;
use crate::limiter::RateLimiter;
use crate::pool::PoolManager;
use crate::registry::ConnectionRegistry;

/// Shared gateway state passed to all handlers and the dispatch layer.
///
/// Every component is either an `Arc` or internally `Arc`-backed, so cloning
/// the state per request is inexpensive.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub channels: Arc<ChannelMultiplexer>,
    pub limiter: Arc<RateLimiter>,
    pub history: Arc<MessageHistory>,
    pub pool: PoolManager,
    pub supervisor: Supervisor,
    pub moderator: Arc<dyn ChatModerator>,
    pub game: Arc<dyn GameEngine>,
    pub audit: Arc<dyn AuditSink>,
}

impl GatewayState {
    /// Wire the gateway fabric around the given collaborators.
    pub fn new(
        config: Config,
        verifier: Arc<dyn TokenVerifier>,
        moderator: Arc<dyn ChatModerator>,
        game: Arc<dyn GameEngine>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new());
        let channels = Arc::new(ChannelMultiplexer::new(config.max_channels_per_connection));
        let history = Arc::new(MessageHistory::default());
        let limiter = Arc::new(RateLimiter::new(audit.clone()));
        let pool = PoolManager::new(
            config.clone(),
            registry.clone(),
            channels.clone(),
            history.clone(),
            audit.clone(),
        );
        let supervisor = Supervisor::new(
            config.clone(),
            registry.clone(),
            pool.clone(),
            history.clone(),
            limiter.clone(),
            game.clone(),
        );

        Self {
            config,
            verifier,
            registry,
            channels,
            limiter,
            history,
            pool,
            supervisor,
            moderator,
            game,
            audit,
        }
    }

    /// Default wiring: local JWT verification, the in-process moderator
    /// unless `CHAT_MODERATOR_URL` points at a real one, the loopback game
    /// engine, and the tracing audit sink. Production deployments swap the
    /// collaborator adapters via `new`.
    pub fn with_defaults(config: Config) -> Self {
        let verifier = Arc::new(JwtVerifier::new(config.jwt_secret.clone()));
        let moderator: Arc<dyn ChatModerator> = match &config.chat_moderator_url {
            Some(url) => Arc::new(HttpChatModerator::new(url.clone())),
            None => Arc::new(PermissiveModerator::new(Arc::new(MemoryChatStore::new()))),
        };
        Self::new(
            config,
            verifier,
            moderator,
            Arc::new(LoopbackGameEngine),
            Arc::new(TracingAuditSink::new()),
        )
    }
}
