//! Response caching over a pluggable key-value store.
//!
//! [`ResponseCache`] owns the key derivation and cacheability rules plus the
//! guarded store operations. Two interceptors sit on top of it:
//!
//! - [`CacheAside`]: reads are served from the store on hit; on miss the origin
//!   is called, its response captured and stored, then returned.
//! - [`WriteThrough`]: reads behave as Cache-Aside; a successful mutation stores
//!   its response under the key the read path derives for the same resource.
//!
//! [`layer`] picks one of them from [`CacheConfig::strategy`]. Store failures
//! of any kind (backend, codec, cancellation, timeout) are logged, counted and
//! bypassed; the client always gets the origin's answer.

use std::{future::Future, sync::{Arc, Once}};

use metrics::{Unit, counter, describe_counter};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    Method, Request, Response, StatusCode,
    config::ConfigError,
    context::{Context, Signal},
    http::sink::mirror,
    middleware::{BoxFuture, Middleware, Next},
};

mod config;
mod entry;
mod key;
mod store;

pub use config::{CacheConfig, CacheStrategy};
pub use entry::CacheEntry;
pub use key::MAX_KEY_LEN;
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use store::{CacheStore, MemoryStore, StoreError};

pub const METRIC_CACHE_HIT: &str = "rttp_shield_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "rttp_shield_cache_miss_total";
pub const METRIC_CACHE_STORE_ERROR: &str = "rttp_shield_cache_store_error_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(METRIC_CACHE_HIT, Unit::Count, "Responses served from the cache.");
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Cacheable reads that had to reach the origin."
        );
        describe_counter!(
            METRIC_CACHE_STORE_ERROR,
            Unit::Count,
            "Cache store operations that failed and were bypassed."
        );
    });
}

/// Cache policy plus the store it applies to.
pub struct ResponseCache {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
}

impl ResponseCache {
    /// Validates `config` and binds it to `store`. The configuration cannot be
    /// changed afterwards.
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        describe_metrics();
        Ok(Self { config, store })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key for `request` as it stands (its own method, path and query).
    pub fn derive_key(&self, request: &Request) -> String {
        key::derive(
            &self.config,
            request.method(),
            request.path(),
            request.query_pairs(),
        )
    }

    /// Key a `GET` for the same path and query would use.
    pub fn read_key(&self, request: &Request) -> String {
        key::derive(&self.config, &Method::Get, request.path(), request.query_pairs())
    }

    fn head_key(&self, request: &Request) -> String {
        key::derive(&self.config, &Method::Head, request.path(), request.query_pairs())
    }

    /// `true` for `GET`/`HEAD` outside excluded paths, unless the client asked
    /// to bypass caches (`Cache-Control: no-cache|no-store`, `Pragma: no-cache`).
    pub fn is_cacheable(&self, request: &Request) -> bool {
        if !matches!(request.method(), Method::Get | Method::Head) {
            return false;
        }
        if self.config.is_excluded(request.path()) {
            return false;
        }
        let headers = request.headers();
        !(headers.has_token("cache-control", "no-cache")
            || headers.has_token("cache-control", "no-store")
            || headers.has_token("pragma", "no-cache"))
    }

    /// Looks up `key`. An entry that fails to decode is reported as
    /// [`StoreError::Codec`].
    pub async fn fetch(&self, signal: &Signal, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let raw = self.guarded(signal, self.store.get(key)).await?;
        raw.map(|raw| CacheEntry::decode(&raw)).transpose()
    }

    /// Replaces whatever is stored under `key` with `entry` for the configured TTL.
    pub async fn store(&self, signal: &Signal, key: &str, entry: &CacheEntry) -> Result<(), StoreError> {
        let raw = entry.encode()?;
        self.guarded(signal, self.store.set(key, raw.into(), self.config.ttl()))
            .await
    }

    pub async fn invalidate(&self, signal: &Signal, key: &str) -> Result<(), StoreError> {
        self.guarded(signal, self.store.del(key)).await
    }

    // Bounds a store operation by the request's cancellation token, its
    // deadline and the per-operation timeout, whichever fires first.
    async fn guarded<T, F>(&self, signal: &Signal, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let mut deadline = Instant::now() + self.config.store_timeout();
        if let Some(request_deadline) = signal.deadline() {
            deadline = deadline.min(request_deadline);
        }

        tokio::select! {
            biased;
            _ = signal.token().cancelled() => Err(StoreError::Cancelled),
            result = tokio::time::timeout_at(deadline, op) => {
                result.unwrap_or(Err(StoreError::Timeout))
            }
        }
    }

    /// Cache-Aside read: replay on hit, otherwise call the origin and keep a
    /// copy of a `200 OK` answer.
    async fn read_through(&self, ctx: Context, next: Next) -> Response {
        let key = self.derive_key(ctx.request());
        let signal = ctx.signal();

        match self.fetch(&signal, &key).await {
            Ok(Some(entry)) => match entry.into_response() {
                Ok(response) => {
                    debug!(key = %key, outcome = "hit", "serving cached response");
                    counter!(METRIC_CACHE_HIT).increment(1);
                    return response;
                }
                Err(e) => report("fetch", &key, &e),
            },
            Ok(None) => {}
            Err(e) => report("fetch", &key, &e),
        }

        debug!(key = %key, outcome = "miss", "cache miss, calling origin");
        counter!(METRIC_CACHE_MISS).increment(1);

        let response = next.run(ctx).await;
        if response.status() != StatusCode::Ok {
            return response;
        }

        let (response, recorded) = mirror(response);
        if let Err(e) = self.store(&signal, &key, &CacheEntry::from(recorded)).await {
            report("store", &key, &e);
        }
        response
    }

    /// Runs a mutation and reconciles the read keys with its outcome.
    ///
    /// With Write-Through, a `200 OK` to POST/PUT/PATCH refreshes the GET
    /// entry and any other successful mutation drops it. With Cache-Aside only
    /// methods in `invalidate_on` drop it. Whenever the GET entry is touched
    /// the HEAD entry for the same resource is dropped too.
    async fn write(&self, ctx: Context, next: Next, write_through: bool) -> Response {
        if self.config.is_excluded(ctx.request().path()) {
            return next.run(ctx).await;
        }

        let method = ctx.request().method().clone();
        let key = self.read_key(ctx.request());
        let head_key = self.head_key(ctx.request());
        let signal = ctx.signal();

        let mut response = next.run(ctx).await;
        if !response.status().is_success() {
            return response;
        }

        let mut stored = false;
        if write_through && response.status() == StatusCode::Ok && carries_representation(&method) {
            let (forwarded, recorded) = mirror(response);
            response = forwarded;
            match self.store(&signal, &key, &CacheEntry::from(recorded)).await {
                Ok(()) => {
                    debug!(key = %key, method = %method, "write-through stored response");
                    stored = true;
                }
                Err(e) => report("store", &key, &e),
            }
        }

        let invalidates = write_through || self.config.invalidate_on.contains(&method);
        if !stored && !invalidates {
            return response;
        }

        let stale = if stored { vec![head_key] } else { vec![key, head_key] };
        for stale_key in &stale {
            match self.invalidate(&signal, stale_key).await {
                Ok(()) => debug!(key = %stale_key, method = %method, "invalidated cached response"),
                Err(e) => report("invalidate", stale_key, &e),
            }
        }

        response
    }
}

// DELETE and friends have no representation worth replaying on the next read.
fn carries_representation(method: &Method) -> bool {
    matches!(method, Method::Post | Method::Put | Method::Patch)
}

fn report(op: &'static str, key: &str, error: &StoreError) {
    warn!(op, key = %key, error = %error, "cache store failure, bypassing cache");
    counter!(METRIC_CACHE_STORE_ERROR, "op" => op, "kind" => error.kind()).increment(1);
}

/// Cache-Aside interceptor.
#[derive(Clone)]
pub struct CacheAside {
    cache: Arc<ResponseCache>,
}

impl CacheAside {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }
}

impl Middleware for CacheAside {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        let cache = Arc::clone(&self.cache);
        Box::pin(async move {
            if cache.is_cacheable(ctx.request()) {
                cache.read_through(ctx, next).await
            } else if ctx.request().method().is_safe() {
                next.run(ctx).await
            } else {
                cache.write(ctx, next, false).await
            }
        })
    }
}

/// Write-Through interceptor.
#[derive(Clone)]
pub struct WriteThrough {
    cache: Arc<ResponseCache>,
}

impl WriteThrough {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }
}

impl Middleware for WriteThrough {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        let cache = Arc::clone(&self.cache);
        Box::pin(async move {
            if cache.is_cacheable(ctx.request()) {
                cache.read_through(ctx, next).await
            } else if ctx.request().method().is_safe() {
                next.run(ctx).await
            } else {
                cache.write(ctx, next, true).await
            }
        })
    }
}

/// The cache interceptor selected by [`CacheConfig::strategy`].
#[derive(Clone)]
pub enum CacheLayer {
    Aside(CacheAside),
    WriteThrough(WriteThrough),
}

impl Middleware for CacheLayer {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        match self {
            CacheLayer::Aside(layer) => layer.handle(ctx, next),
            CacheLayer::WriteThrough(layer) => layer.handle(ctx, next),
        }
    }
}

/// Builds the interceptor for the strategy configured on `cache`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rttp_shield::cache::{self, CacheConfig, CacheStrategy, MemoryStore, ResponseCache};
/// use rttp_shield::middleware::Chain;
/// use rttp_shield::{Response, StatusCode};
///
/// let config = CacheConfig {
///     strategy: CacheStrategy::WriteThrough,
///     ..CacheConfig::default()
/// };
/// let cache = Arc::new(ResponseCache::new(config, Arc::new(MemoryStore::new())).unwrap());
/// let pipeline = Chain::new()
///     .with(cache::layer(cache))
///     .finish(|_ctx| async { Response::new(StatusCode::Ok) });
/// ```
pub fn layer(cache: Arc<ResponseCache>) -> CacheLayer {
    match cache.config().strategy {
        CacheStrategy::CacheAside => CacheLayer::Aside(CacheAside::new(cache)),
        CacheStrategy::WriteThrough => CacheLayer::WriteThrough(WriteThrough::new(cache)),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Barrier;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::middleware::{Chain, Pipeline};

    struct Origin {
        calls: Arc<AtomicUsize>,
    }

    impl Origin {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        // Echoes the request line, numbered by call, so replays are detectable.
        fn pipeline(&self, cache: Arc<ResponseCache>) -> Pipeline {
            let calls = Arc::clone(&self.calls);
            Chain::new().with(layer(cache)).finish(move |ctx: Context| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let status = match ctx.request().path() {
                    "/missing" => StatusCode::NotFound,
                    "/created" => StatusCode::Created,
                    _ => StatusCode::Ok,
                };
                let body = format!("{} {} #{n}", ctx.request().method(), ctx.request().path());
                async move {
                    Response::new(status)
                        .header("Content-Type", "text/plain")
                        .header("X-Origin-Call", n.to_string())
                        .body(body)
                }
            })
        }
    }

    fn cache_with(config: CacheConfig, store: Arc<dyn CacheStore>) -> Arc<ResponseCache> {
        Arc::new(ResponseCache::new(config, store).unwrap())
    }

    fn get(path: &str) -> Request {
        Request::builder(Method::Get, path).build()
    }

    fn body(response: &Response) -> String {
        String::from_utf8(response.body_ref().to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn hit_before_ttl_and_miss_after() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            ttl_ms: 10_000,
            ..CacheConfig::default()
        };
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(config, store));

        let first = pipeline.handle(get("/contacts")).await;
        assert_eq!(origin.calls(), 1);

        tokio::time::advance(Duration::from_millis(9_999)).await;
        let replay = pipeline.handle(get("/contacts")).await;
        assert_eq!(origin.calls(), 1);
        assert_eq!(replay.status(), first.status());
        assert_eq!(replay.headers(), first.headers());
        assert_eq!(replay.body_ref(), first.body_ref());

        tokio::time::advance(Duration::from_millis(2)).await;
        let refreshed = pipeline.handle(get("/contacts")).await;
        assert_eq!(origin.calls(), 2);
        assert_eq!(body(&refreshed), "GET /contacts #2");
    }

    #[tokio::test]
    async fn excluded_paths_never_reach_the_store() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            exclude_paths: vec!["/admin".into()],
            strategy: CacheStrategy::WriteThrough,
            ..CacheConfig::default()
        };
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(config, store.clone()));

        pipeline.handle(get("/admin/stats")).await;
        pipeline.handle(get("/admin/stats")).await;
        pipeline
            .handle(Request::builder(Method::Put, "/admin/stats").build())
            .await;

        assert_eq!(origin.calls(), 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn ignored_params_share_an_entry() {
        let config = CacheConfig {
            ignore_params: vec!["utm_source".into()],
            ..CacheConfig::default()
        };
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(config, Arc::new(MemoryStore::new())));

        let plain = Request::builder(Method::Get, "/contacts")
            .query("page", "1")
            .query("sort", "name")
            .build();
        let tracked = Request::builder(Method::Get, "/contacts")
            .query("sort", "name")
            .query("utm_source", "newsletter")
            .query("page", "1")
            .build();

        pipeline.handle(plain).await;
        pipeline.handle(tracked).await;
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn bypass_directives_skip_the_cache() {
        let store = Arc::new(MemoryStore::new());
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(CacheConfig::default(), store.clone()));

        for (name, value) in [
            ("Cache-Control", "no-cache"),
            ("Cache-Control", "max-age=0, No-Store"),
            ("Pragma", "no-cache"),
        ] {
            let request = Request::builder(Method::Get, "/contacts").header(name, value).build();
            pipeline.handle(request).await;
        }

        assert_eq!(origin.calls(), 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn only_ok_responses_are_stored() {
        let store = Arc::new(MemoryStore::new());
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(CacheConfig::default(), store.clone()));

        pipeline.handle(get("/missing")).await;
        pipeline.handle(get("/created")).await;
        assert!(store.is_empty());

        pipeline.handle(get("/missing")).await;
        assert_eq!(origin.calls(), 3);
    }

    #[tokio::test]
    async fn head_and_get_are_cached_separately() {
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(CacheConfig::default(), Arc::new(MemoryStore::new())));

        pipeline.handle(get("/contacts")).await;
        pipeline
            .handle(Request::builder(Method::Head, "/contacts").build())
            .await;
        pipeline
            .handle(Request::builder(Method::Head, "/contacts").build())
            .await;
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_each_call_the_origin() {
        let barrier = Arc::new(Barrier::new(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with(CacheConfig::default(), Arc::new(MemoryStore::new()));

        let handler_calls = Arc::clone(&calls);
        let pipeline = Chain::new().with(layer(cache)).finish(move |_ctx| {
            let barrier = Arc::clone(&barrier);
            let calls = Arc::clone(&handler_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Both requests must be inside the origin at once.
                barrier.wait().await;
                Response::new(StatusCode::Ok).body("slow")
            }
        });

        let (a, b) = tokio::join!(pipeline.handle(get("/slow")), pipeline.handle(get("/slow")));
        assert_eq!(a.status(), StatusCode::Ok);
        assert_eq!(b.status(), StatusCode::Ok);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        pipeline.handle(get("/slow")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn write_through_is_visible_to_the_next_read() {
        let config = CacheConfig {
            strategy: CacheStrategy::WriteThrough,
            ..CacheConfig::default()
        };
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(config, Arc::new(MemoryStore::new())));

        let update = Request::builder(Method::Put, "/contacts/7")
            .query("view", "full")
            .body(r#"{"name":"Ada"}"#)
            .build();
        let written = pipeline.handle(update).await;
        assert_eq!(origin.calls(), 1);

        let read = Request::builder(Method::Get, "/contacts/7").query("view", "full").build();
        let replay = pipeline.handle(read).await;
        assert_eq!(origin.calls(), 1);
        assert_eq!(body(&replay), "PUT /contacts/7 #1");
        assert_eq!(replay.body_ref(), written.body_ref());
    }

    #[tokio::test]
    async fn cache_aside_does_not_store_writes() {
        let store = Arc::new(MemoryStore::new());
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(CacheConfig::default(), store.clone()));

        pipeline
            .handle(Request::builder(Method::Post, "/contacts").body("{}").build())
            .await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn successful_mutation_invalidates_read_key() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            invalidate_on: vec![Method::Delete],
            ..CacheConfig::default()
        };
        let cache = cache_with(config, store.clone());
        let origin = Origin::new();
        let pipeline = origin.pipeline(Arc::clone(&cache));

        pipeline.handle(get("/contacts/7")).await;
        assert!(store.contains_key(&cache.read_key(&get("/contacts/7"))));

        pipeline
            .handle(Request::builder(Method::Delete, "/contacts/7").build())
            .await;
        assert!(store.is_empty());

        pipeline.handle(get("/contacts/7")).await;
        assert_eq!(origin.calls(), 3);
    }

    #[tokio::test]
    async fn invalidation_drops_head_entry_too() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            invalidate_on: vec![Method::Delete],
            ..CacheConfig::default()
        };
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(config, store.clone()));
        let head = || Request::builder(Method::Head, "/contacts/7").build();

        pipeline.handle(head()).await;
        pipeline.handle(get("/contacts/7")).await;
        assert_eq!(store.len(), 2);

        pipeline
            .handle(Request::builder(Method::Delete, "/contacts/7").build())
            .await;
        assert!(store.is_empty());

        pipeline.handle(head()).await;
        assert_eq!(origin.calls(), 4);
    }

    #[tokio::test]
    async fn write_through_refresh_drops_head_entry() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            strategy: CacheStrategy::WriteThrough,
            ..CacheConfig::default()
        };
        let cache = cache_with(config, store.clone());
        let origin = Origin::new();
        let pipeline = origin.pipeline(Arc::clone(&cache));
        let head = || Request::builder(Method::Head, "/contacts/7").build();

        pipeline.handle(head()).await;
        assert!(store.contains_key(&cache.derive_key(&head())));

        pipeline
            .handle(Request::builder(Method::Put, "/contacts/7").body("{}").build())
            .await;
        assert_eq!(store.keys(), vec![cache.read_key(&head())]);

        pipeline.handle(head()).await;
        assert_eq!(origin.calls(), 3);
    }

    #[tokio::test]
    async fn write_through_drops_entry_on_non_ok_success() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            strategy: CacheStrategy::WriteThrough,
            ..CacheConfig::default()
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let pipeline = Chain::new()
            .with(layer(cache_with(config, store.clone())))
            .finish(move |ctx: Context| {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                let status = if ctx.request().method() == &Method::Put {
                    StatusCode::NoContent
                } else {
                    StatusCode::Ok
                };
                async move { Response::new(status) }
            });

        pipeline.handle(get("/contacts/7")).await;
        assert_eq!(store.len(), 1);

        pipeline
            .handle(Request::builder(Method::Put, "/contacts/7").body("{}").build())
            .await;
        assert!(store.is_empty());

        pipeline.handle(get("/contacts/7")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn del(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
    }

    struct HangingStore;

    #[async_trait]
    impl CacheStore for HangingStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn del(&self, _key: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn failing_store_is_not_fatal() {
        let config = CacheConfig {
            strategy: CacheStrategy::WriteThrough,
            invalidate_on: vec![Method::Delete],
            ..CacheConfig::default()
        };
        let origin = Origin::new();
        let pipeline = origin.pipeline(cache_with(config, Arc::new(FailingStore)));

        let read = pipeline.handle(get("/contacts")).await;
        assert_eq!(read.status(), StatusCode::Ok);
        assert_eq!(body(&read), "GET /contacts #1");

        let write = pipeline
            .handle(Request::builder(Method::Put, "/contacts").build())
            .await;
        assert_eq!(write.status(), StatusCode::Ok);

        let delete = pipeline
            .handle(Request::builder(Method::Delete, "/contacts").build())
            .await;
        assert_eq!(delete.status(), StatusCode::Ok);
        assert_eq!(origin.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out_and_origin_answers() {
        let config = CacheConfig {
            store_timeout_ms: 50,
            ..CacheConfig::default()
        };
        let cache = cache_with(config, Arc::new(HangingStore));
        let signal = Signal::default();
        assert!(matches!(
            cache.fetch(&signal, "k").await,
            Err(StoreError::Timeout)
        ));

        let origin = Origin::new();
        let response = origin.pipeline(cache).handle(get("/contacts")).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_deadline_bounds_store_operations() {
        let config = CacheConfig {
            store_timeout_ms: 60_000,
            ..CacheConfig::default()
        };
        let cache = cache_with(config, Arc::new(HangingStore));
        let start = Instant::now();
        let signal = Signal::new(CancellationToken::new(), Some(start + Duration::from_millis(20)));

        assert!(matches!(cache.invalidate(&signal, "k").await, Err(StoreError::Timeout)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancelled_request_abandons_store_operations() {
        let cache = cache_with(CacheConfig::default(), Arc::new(HangingStore));
        let token = CancellationToken::new();
        token.cancel();
        let signal = Signal::new(token, None);

        let entry = CacheEntry {
            status: 200,
            headers: Vec::new(),
            body: Bytes::from_static(b"x"),
        };
        assert!(matches!(
            cache.store(&signal, "k", &entry).await,
            Err(StoreError::Cancelled)
        ));
    }

    #[test]
    fn zero_ttl_is_rejected_at_construction() {
        let config = CacheConfig {
            ttl_ms: 0,
            ..CacheConfig::default()
        };
        assert!(ResponseCache::new(config, Arc::new(MemoryStore::new())).is_err());
    }
}
