//! Five-dimensional sliding-window admission: minute dimensions from the
//! in-memory counters, day and lifetime dimensions from the store.

use std::fmt;
use std::sync::Arc;

use crate::config::DefaultLimits;
use crate::counters::WindowCounters;
use crate::error::ProxyError;
use crate::store::{RateLimitRecord, Store, StoreError};

const DAY_WINDOW_SECS: u64 = 86_400;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitDimension {
    RequestsPerMinute,
    RequestsPerDay,
    TokensPerMinute,
    TokensPerDay,
    TotalTokens,
}

impl fmt::Display for LimitDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RequestsPerMinute => "requests per minute",
            Self::RequestsPerDay => "requests per day",
            Self::TokensPerMinute => "tokens per minute",
            Self::TokensPerDay => "tokens per day",
            Self::TotalTokens => "total tokens",
        };
        f.write_str(name)
    }
}

impl LimitDimension {
    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RequestsPerMinute | Self::TokensPerMinute => Some(60),
            Self::RequestsPerDay | Self::TokensPerDay => Some(3600),
            Self::TotalTokens => None,
        }
    }
}

/// Admission verdict naming the dimension that tripped.
#[derive(Debug)]
pub struct LimitExceeded {
    pub dimension: LimitDimension,
    pub limit: u64,
}

impl From<LimitExceeded> for ProxyError {
    fn from(exceeded: LimitExceeded) -> Self {
        let message = match exceeded.dimension {
            LimitDimension::TotalTokens => {
                format!("total token limit exceeded: {} tokens", exceeded.limit)
            }
            dimension => format!("rate limit exceeded: {} {dimension}", exceeded.limit),
        };
        ProxyError::RateLimited {
            message,
            retry_after: exceeded.dimension.retry_after(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Store,
    counters: Arc<WindowCounters>,
    defaults: DefaultLimits,
}

impl RateLimiter {
    pub fn new(store: Store, counters: Arc<WindowCounters>, defaults: DefaultLimits) -> Self {
        Self {
            store,
            counters,
            defaults,
        }
    }

    /// Pre-admission check: the request itself is the only charge. Token
    /// dimensions are evaluated against consumption already on record, so a
    /// single request may still overshoot a token ceiling; the next request
    /// is the one that gets blocked. On success the `+1 request` sample is
    /// recorded.
    pub async fn check_admission(&self, user_id: &str, now: u64) -> Result<(), ProxyError> {
        let limits = self.effective_limits(user_id).await?;

        if let Some(limit) = limits.requests_per_minute {
            let current = self.counters.requests_in_window(user_id, now);
            if current >= limit {
                return Err(exceeded(LimitDimension::RequestsPerMinute, limit));
            }
        }

        if let Some(limit) = limits.requests_per_day {
            let current = self
                .store
                .requests_since(user_id, now.saturating_sub(DAY_WINDOW_SECS))
                .await?;
            if current >= limit {
                return Err(exceeded(LimitDimension::RequestsPerDay, limit));
            }
        }

        if let Some(limit) = limits.tokens_per_minute {
            let current = self.counters.tokens_in_window(user_id, now);
            if current >= limit {
                return Err(exceeded(LimitDimension::TokensPerMinute, limit));
            }
        }

        if let Some(limit) = limits.tokens_per_day {
            let current = self
                .store
                .tokens_since(user_id, now.saturating_sub(DAY_WINDOW_SECS))
                .await?;
            if current >= limit {
                return Err(exceeded(LimitDimension::TokensPerDay, limit));
            }
        }

        if let Some(limit) = limits.total_token_limit {
            let current = self.store.total_tokens(user_id).await?;
            if current >= limit {
                return Err(exceeded(LimitDimension::TotalTokens, limit));
            }
        }

        self.counters.record_request(user_id, now);
        Ok(())
    }

    /// Post-charge accounting for the minute window. The day and lifetime
    /// dimensions read the usage rows, which the tracker persists.
    pub fn note_tokens(&self, user_id: &str, tokens: u64, now: u64) {
        self.counters.record_tokens(user_id, tokens, now);
    }

    async fn effective_limits(&self, user_id: &str) -> Result<RateLimitRecord, StoreError> {
        match self.store.rate_limits(user_id).await? {
            Some(record) => Ok(record),
            None => Ok(self.defaults.into()),
        }
    }
}

fn exceeded(dimension: LimitDimension, limit: u64) -> ProxyError {
    LimitExceeded { dimension, limit }.into()
}
