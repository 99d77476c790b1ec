//! Per-client rate limiting with lazily created token buckets.
//!
//! [`RateLimiterRegistry`] owns one [`TokenBucket`] per client key. Buckets are
//! created on first use, exactly once per key, and kept for the life of the
//! registry. [`RateLimitMiddleware`] maps each request to a key through
//! [`ClientKey`] and answers `429 Too Many Requests` once the bucket is empty.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::Instant;

use crate::{
    Response, StatusCode,
    context::Context,
    middleware::{BoxFuture, Middleware, Next},
    config::ConfigError,
    security::Principal,
};

pub const METRIC_RATE_LIMITED: &str = "rttp_shield_rate_limited_total";

/// Token bucket parameters shared by every bucket in a registry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens added per second. Zero disables refill.
    pub refill_per_second: f64,
    /// Bucket capacity, and the number of tokens a new bucket starts with.
    pub burst: u32,
    /// How requests are mapped to buckets.
    pub client_key: ClientKey,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refill_per_second: 1.0,
            burst: 10,
            client_key: ClientKey::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.refill_per_second.is_finite() || self.refill_per_second < 0.0 {
            return Err(ConfigError::invalid(
                "rate_limit.refill_per_second",
                "must be a finite, non-negative number",
            ));
        }
        if self.burst == 0 {
            return Err(ConfigError::invalid("rate_limit.burst", "must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket.
///
/// Starts full; refills continuously at `refill_per_second` up to `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    refill_per_second: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(refill_per_second: f64, burst: u32) -> Self {
        Self {
            refill_per_second,
            burst,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token becomes available, or `None` when the bucket
    /// never refills (or refills too slowly for the wait to be representable).
    pub fn retry_after(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_per_second <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64((1.0 - state.tokens) / self.refill_per_second).ok()
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let added = elapsed * self.refill_per_second;
        if added > 0.0 {
            state.tokens = (state.tokens + added).min(f64::from(self.burst));
            state.last_refill = now;
        }
    }
}

/// Registry of token buckets keyed by client identity.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    buckets: DashMap<String, Arc<TokenBucket>>,
    refill_per_second: f64,
    burst: u32,
}

impl RateLimiterRegistry {
    pub fn new(refill_per_second: f64, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            refill_per_second,
            burst,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.refill_per_second, config.burst)
    }

    /// Returns the bucket for `key`, creating it on first use.
    ///
    /// The read path takes only a shard read lock; creation goes through the
    /// entry API under the shard write lock, so concurrent first use of a key
    /// still yields a single bucket.
    pub fn limiter(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let entry = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.refill_per_second, self.burst)));
        Arc::clone(entry.value())
    }

    /// Consumes a token for `key`; `false` means the request must be rejected.
    pub fn allow(&self, key: &str) -> bool {
        self.limiter(key).try_acquire()
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// How a request is mapped to a rate-limit key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum ClientKey {
    /// The peer IP address (port ignored).
    #[default]
    RemoteIp,
    /// The first value of the named request header, e.g. `X-Api-Key`.
    Header(String),
    /// The subject of the authenticated [`Principal`]; requires an auth layer
    /// earlier in the chain.
    Principal,
}

impl ClientKey {
    const FALLBACK: &'static str = "anonymous";

    pub fn extract(&self, ctx: &Context) -> String {
        let key = match self {
            ClientKey::RemoteIp => ctx.request().remote_addr().map(|addr| addr.ip().to_string()),
            ClientKey::Header(name) => ctx.request().headers().get(name).map(str::to_owned),
            ClientKey::Principal => ctx
                .extensions()
                .get::<Principal>()
                .map(|principal| principal.subject.clone()),
        };
        key.unwrap_or_else(|| Self::FALLBACK.to_owned())
    }
}

/// Rejects requests with `429 Too Many Requests` once the client's bucket is empty.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rttp_shield::ratelimit::{ClientKey, RateLimitMiddleware, RateLimiterRegistry};
///
/// // 5 requests per second, bursts of up to 20.
/// let registry = Arc::new(RateLimiterRegistry::new(5.0, 20));
/// let layer = RateLimitMiddleware::new(registry, ClientKey::Header("X-Api-Key".into()));
/// ```
#[derive(Clone)]
pub struct RateLimitMiddleware {
    registry: Arc<RateLimiterRegistry>,
    key: ClientKey,
}

impl RateLimitMiddleware {
    pub fn new(registry: Arc<RateLimiterRegistry>, key: ClientKey) -> Self {
        Self { registry, key }
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        let registry = Arc::clone(&self.registry);
        let client = self.key.extract(&ctx);

        Box::pin(async move {
            let bucket = registry.limiter(&client);
            if bucket.try_acquire() {
                return next.run(ctx).await;
            }

            tracing::debug!(client = %client, path = %ctx.request().path(), "rate limit exceeded");
            counter!(METRIC_RATE_LIMITED).increment(1);

            let mut response = Response::error(StatusCode::TooManyRequests, "Rate limit exceeded");
            if let Some(wait) = bucket.retry_after() {
                response.add_header("Retry-After", retry_after_secs(wait).to_string());
            }
            response
        })
    }
}

// Retry-After carries whole seconds; round up so clients never retry early.
pub(crate) fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 { secs.saturating_add(1) } else { secs.max(1) }
}
