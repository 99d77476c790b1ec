//! Middleware pipeline: composable before/after request handler logic.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, enabling request inspection, short-circuit
//! responses, and response decoration without coupling handlers to infrastructure
//! concerns.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`Chain`]: builder that freezes an ordered middleware list and a terminal
//!   handler into a [`Pipeline`].
//! - [`LoggerMiddleware`]: built-in request/response logger.
//! - [`MonitoringMiddleware`]: request counters and latency histograms.
//! - [`ValidationMiddleware`]: JSON payload validation.

use std::{future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc};

use futures::FutureExt;
use tokio::time::Instant;

use crate::{Request, Response, StatusCode, context::Context};

mod monitoring;
mod validation;

pub use monitoring::MonitoringMiddleware;
pub use validation::ValidationMiddleware;

/// Boxed future returned by middleware and handlers.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Type-erased, heap-allocated async handler that terminates the pipeline.
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and shared across
/// threads without copying the underlying closure. [`Chain::finish`] builds one from any
/// async closure.
pub type Handler = Arc<dyn Fn(Context) -> BoxFuture + Send + Sync + 'static>;

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_shield::{context::Context, middleware::{BoxFuture, MiddlewareHandler, Next}};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next| -> BoxFuture {
///     Box::pin(async move { next.run(ctx).await })
/// });
/// ```
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware, or the terminal handler once the middleware list is exhausted.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a request
/// at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    handler: Handler,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

impl Next {
    fn new(middlewares: Arc<[MiddlewareHandler]>, handler: Handler) -> Self {
        Self {
            middlewares,
            handler,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain (or the terminal handler) and
    /// returns its response.
    ///
    /// A panic raised by the terminal handler is converted into a
    /// `500 Internal Server Error` so outer layers observe it as an origin fault.
    pub async fn run(mut self, ctx: Context) -> Response {
        if let Some(middleware) = self.middlewares.get(self.index).cloned() {
            self.index += 1;
            return middleware(ctx, self).await;
        }

        let handler = self.handler;
        let outcome = AssertUnwindSafe(async move { handler(ctx).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(response) => response,
            Err(_) => {
                tracing::error!("handler panicked while serving request");
                Response::error(StatusCode::InternalServerError, "Internal server error")
            }
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - Implementations **should not** hold locks on shared state across an `.await`
///   point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture;
}

/// Ordered builder for a [`Pipeline`].
///
/// Middleware runs in the order it was added; the first added sees the request
/// first and the response last.
///
/// # Examples
///
/// ```rust
/// use rttp_shield::{Method, Request, Response, StatusCode};
/// use rttp_shield::middleware::{Chain, LoggerMiddleware};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pipeline = Chain::new()
///     .with(LoggerMiddleware)
///     .finish(|_ctx| async { Response::new(StatusCode::Ok).body("hi") });
///
/// let response = pipeline.handle(Request::builder(Method::Get, "/").build()).await;
/// assert_eq!(response.status(), StatusCode::Ok);
/// # }
/// ```
#[derive(Default)]
pub struct Chain {
    middlewares: Vec<MiddlewareHandler>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware.
    #[must_use]
    pub fn with<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.with_handler(from_middleware(Arc::new(middleware)))
    }

    /// Appends an already type-erased middleware.
    #[must_use]
    pub fn with_handler(mut self, handler: MiddlewareHandler) -> Self {
        self.middlewares.push(handler);
        self
    }

    /// Number of middleware layers added so far.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Freezes the chain in front of `handler`.
    pub fn finish<H, F>(self, handler: H) -> Pipeline
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        Pipeline {
            middlewares: self.middlewares.into(),
            handler: Arc::new(move |ctx: Context| -> BoxFuture { Box::pin(handler(ctx)) }),
        }
    }
}

/// An immutable, composed middleware chain plus its terminal handler.
///
/// Cheap to clone; clones share the same layers.
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<[MiddlewareHandler]>,
    handler: Handler,
}

impl Pipeline {
    /// Runs `request` through the pipeline with a fresh [`Context`].
    pub async fn handle(&self, request: Request) -> Response {
        self.call(Context::new(request)).await
    }

    /// Runs a prepared context through the pipeline.
    ///
    /// A panic escaping any middleware is converted into a `500` response.
    pub async fn call(&self, ctx: Context) -> Response {
        let next = Next::new(Arc::clone(&self.middlewares), Arc::clone(&self.handler));
        match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(response) => response,
            Err(_) => {
                tracing::error!("middleware panicked while serving request");
                Response::error(StatusCode::InternalServerError, "Internal server error")
            }
        }
    }
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` record after the downstream handler completes.
/// `LoggerMiddleware` never short-circuits.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();
            let peer = ctx
                .request()
                .remote_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "-".to_string());

            let response = next.run(ctx).await;

            tracing::info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                duration = ?start.elapsed(),
                peer = %peer,
                "request served"
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::Method;

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Tag {
        fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
            let name = self.name;
            let log = Arc::clone(&self.log);
            Box::pin(async move {
                log.lock().push(format!("{name}:in"));
                let response = next.run(ctx).await;
                log.lock().push(format!("{name}:out"));
                response
            })
        }
    }

    struct Reject;

    impl Middleware for Reject {
        fn handle(&self, _ctx: Context, _next: Next) -> BoxFuture {
            Box::pin(async { Response::error(StatusCode::Forbidden, "nope") })
        }
    }

    fn get(path: &str) -> Request {
        Request::builder(Method::Get, path).build()
    }

    #[tokio::test]
    async fn runs_in_construction_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = Arc::clone(&log);
        let pipeline = Chain::new()
            .with(Tag { name: "a", log: Arc::clone(&log) })
            .with(Tag { name: "b", log: Arc::clone(&log) })
            .finish(move |_ctx| {
                let log = Arc::clone(&handler_log);
                async move {
                    log.lock().push("handler".to_string());
                    Response::new(StatusCode::Ok)
                }
            });

        let response = pipeline.handle(get("/")).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(
            *log.lock(),
            vec!["a:in", "b:in", "handler", "b:out", "a:out"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Chain::new()
            .with(Reject)
            .with(Tag { name: "never", log: Arc::clone(&log) })
            .finish(move |_ctx| {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                async { Response::new(StatusCode::Ok) }
            });

        let response = pipeline.handle(get("/")).await;
        assert_eq!(response.status(), StatusCode::Forbidden);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let pipeline = Chain::new().finish(|ctx: Context| async move {
            Response::new(StatusCode::Ok).body(ctx.request().path().to_string())
        });
        let response = pipeline.handle(get("/direct")).await;
        assert_eq!(response.body_ref().as_ref(), b"/direct");
    }

    #[tokio::test]
    async fn handler_panic_becomes_500_seen_by_outer_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Chain::new()
            .with(Tag { name: "outer", log: Arc::clone(&log) })
            .finish(|_ctx| async {
                if true {
                    panic!("origin blew up");
                }
                Response::new(StatusCode::Ok)
            });

        let response = pipeline.handle(get("/")).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(*log.lock(), vec!["outer:in", "outer:out"]);
    }

    #[tokio::test]
    async fn pipeline_is_reusable_across_requests() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let pipeline = Chain::new().with(LoggerMiddleware).finish(move |_ctx| {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            async { Response::new(StatusCode::NoContent) }
        });

        for _ in 0..3 {
            assert_eq!(pipeline.clone().handle(get("/")).await.status(), StatusCode::NoContent);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
