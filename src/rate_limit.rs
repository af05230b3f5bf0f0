use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::db::Database;

/// Fixed-window hit counters shared by every handler instance.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, identity: &str, window_start: i64, expires_at: i64) -> Result<i64>;

    async fn prune(&self, now: i64) -> Result<u64>;
}

#[async_trait]
impl CounterStore for Database {
    async fn increment(&self, identity: &str, window_start: i64, expires_at: i64) -> Result<i64> {
        self.increment_rate_counter(identity, window_start, expires_at)
            .await
    }

    async fn prune(&self, now: i64) -> Result<u64> {
        self.prune_rate_counters(now).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: i64 },
    Limited { retry_after_secs: i64 },
}

#[derive(Clone)]
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    max_requests: i64,
    window_secs: i64,
}

impl RateLimiter {
    pub fn new(counters: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self {
            counters,
            max_requests: config.max_requests.max(1),
            window_secs: config.window_secs.max(1),
        }
    }

    pub async fn check(&self, identity: &str) -> RateDecision {
        self.check_at(identity, Utc::now().timestamp()).await
    }

    /// Counter failures let the request through.
    pub async fn check_at(&self, identity: &str, now: i64) -> RateDecision {
        let window_start = now - now.rem_euclid(self.window_secs);
        let expires_at = window_start + self.window_secs;

        let hits = match self
            .counters
            .increment(identity, window_start, expires_at)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, identity, "rate counter unavailable, allowing request");
                return RateDecision::Allowed {
                    remaining: self.max_requests,
                };
            }
        };

        if hits == 1 {
            match self.counters.prune(now).await {
                Ok(0) => {}
                Ok(pruned) => debug!(pruned, "pruned expired rate counters"),
                Err(err) => warn!(error = %err, "failed pruning rate counters"),
            }
        }

        if hits > self.max_requests {
            RateDecision::Limited {
                retry_after_secs: (expires_at - now).max(1),
            }
        } else {
            RateDecision::Allowed {
                remaining: self.max_requests - hits,
            }
        }
    }
}
