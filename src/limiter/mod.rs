use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::adapters::{AuditEvent, AuditKind, AuditSink, Severity};
use crate::auth::Principal;
use crate::channels::ChannelKind;
use crate::protocol::TableId;

/// The token-bucket accounting window. Channel rates are configured per
/// minute.
const WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// Keys and decisions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub user_id: Uuid,
    pub channel: ChannelKind,
    pub table_id: Option<TableId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed {
        remaining: u32,
        /// Time until the bucket is back at full capacity.
        reset_after: Duration,
    },
    Limited {
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    blocked: u64,
}

impl Bucket {
    fn new(max_tokens: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_per_sec,
            last_refill: Instant::now(),
            blocked: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        self.last_refill = now;
    }
}

// ============================================================================
// Limiter
// ============================================================================

/// Token-bucket rate limiting per `(principal, channel[, table])`.
///
/// Buckets start full and refill proportionally to elapsed time. Admins
/// bypass every bucket; the bypass is decided from the verified token's role
/// only. Blocked requests are reported to the audit sink with the running
/// per-key count.
pub struct RateLimiter {
    buckets: RwLock<HashMap<BucketKey, Bucket>>,
    audit: Arc<dyn AuditSink>,
}

impl RateLimiter {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            audit,
        }
    }

    pub async fn check(
        &self,
        principal: &Principal,
        channel: ChannelKind,
        table_id: Option<&TableId>,
    ) -> RateDecision {
        if principal.is_admin() {
            return RateDecision::Allowed {
                remaining: u32::MAX,
                reset_after: Duration::ZERO,
            };
        }

        let Some(rate) = channel.config().rate_limit_per_minute else {
            return RateDecision::Allowed {
                remaining: u32::MAX,
                reset_after: Duration::ZERO,
            };
        };

        let key = BucketKey {
            user_id: principal.user_id,
            channel,
            table_id: table_id.cloned(),
        };

        let now = Instant::now();
        let max_tokens = f64::from(rate);
        let refill_per_sec = max_tokens / WINDOW.as_secs_f64();

        let (decision, blocked) = {
            let mut buckets = self.buckets.write().await;
            let bucket = buckets
                .entry(key.clone())
                .or_insert_with(|| Bucket::new(max_tokens, refill_per_sec));
            bucket.refill(now);

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                let reset_after = Duration::from_secs_f64(
                    (bucket.max_tokens - bucket.tokens) / bucket.refill_per_sec,
                );
                (
                    RateDecision::Allowed {
                        remaining: bucket.tokens as u32,
                        reset_after,
                    },
                    None,
                )
            } else {
                bucket.blocked += 1;
                let retry_after = Duration::from_secs_f64(
                    (1.0 - bucket.tokens).max(0.0) / bucket.refill_per_sec,
                );
                (RateDecision::Limited { retry_after }, Some(bucket.blocked))
            }
        };

        if let Some(count) = blocked {
            self.audit
                .emit(AuditEvent {
                    user_id: Some(principal.user_id),
                    table_id: key.table_id.clone(),
                    ..AuditEvent::new(
                        AuditKind::RateLimit,
                        Severity::Warning,
                        json!({
                            "channel": key.channel,
                            "blocked": count,
                        }),
                    )
                })
                .await;
        }

        decision
    }

    /// Drop buckets untouched for more than two windows — by then they have
    /// fully refilled, so no state is lost.
    pub async fn collect_idle(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) <= WINDOW * 2);
    }

    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
