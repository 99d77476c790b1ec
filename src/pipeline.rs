//! The standard protection chain, assembled from a [`PipelineConfig`].

use std::sync::Arc;

use crate::{
    cache::{self, CacheStore, ResponseCache},
    circuit::{CircuitBreakerMiddleware, CircuitBreakerRegistry},
    config::{ConfigError, PipelineConfig},
    middleware::{Chain, LoggerMiddleware, MonitoringMiddleware},
    ratelimit::{RateLimitMiddleware, RateLimiterRegistry},
    security::{AuthMiddleware, Authenticator, CorsMiddleware},
};

/// Builds the canonical chain:
///
/// logging → monitoring → CORS → authentication (when `authenticator` is
/// given) → rate limit → circuit breaker → cache.
///
/// The returned [`Chain`] is still open, so callers can append their own
/// layers (role checks, validation) before [`Chain::finish`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rttp_shield::{Response, StatusCode, cache::MemoryStore, config::PipelineConfig, pipeline};
///
/// let config = PipelineConfig::default();
/// let pipeline = pipeline::standard(&config, Arc::new(MemoryStore::new()), None)
///     .unwrap()
///     .finish(|_ctx| async { Response::new(StatusCode::Ok).body("[]") });
/// ```
pub fn standard(
    config: &PipelineConfig,
    store: Arc<dyn CacheStore>,
    authenticator: Option<Arc<dyn Authenticator>>,
) -> Result<Chain, ConfigError> {
    config.validate()?;

    let response_cache = Arc::new(ResponseCache::new(config.cache.clone(), store)?);
    let limiters = Arc::new(RateLimiterRegistry::from_config(&config.rate_limit));
    let breakers = Arc::new(CircuitBreakerRegistry::from_config(&config.circuit_breaker));

    let mut chain = Chain::new()
        .with(LoggerMiddleware)
        .with(MonitoringMiddleware::new())
        .with(CorsMiddleware::from_config(config.cors.clone()));
    if let Some(authenticator) = authenticator {
        chain = chain.with(AuthMiddleware::new(authenticator));
    }

    tracing::debug!(
        strategy = ?config.cache.strategy,
        burst = config.rate_limit.burst,
        failure_threshold = config.circuit_breaker.failure_threshold,
        "assembled standard pipeline"
    );

    Ok(chain
        .with(RateLimitMiddleware::new(limiters, config.rate_limit.client_key.clone()))
        .with(CircuitBreakerMiddleware::new(breakers, config.circuit_breaker.key))
        .with(cache::layer(response_cache)))
}
