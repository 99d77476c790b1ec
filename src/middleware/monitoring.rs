//! Request counters and latency histograms, recorded through the `metrics` facade.

use std::sync::Once;

use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use tokio::time::Instant;

use super::{BoxFuture, Middleware, Next};
use crate::context::Context;

pub const METRIC_REQUESTS_TOTAL: &str = "http_requests_total";
pub const METRIC_REQUEST_DURATION: &str = "http_request_duration_seconds";

static DESCRIBE: Once = Once::new();

/// Records `http_requests_total{method,path,status}` and
/// `http_request_duration_seconds{method,path}` for every request that passes.
///
/// Place it early in the chain so rejections from later layers are counted too.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonitoringMiddleware;

impl MonitoringMiddleware {
    pub fn new() -> Self {
        DESCRIBE.call_once(|| {
            describe_counter!(
                METRIC_REQUESTS_TOTAL,
                Unit::Count,
                "Total number of HTTP requests."
            );
            describe_histogram!(
                METRIC_REQUEST_DURATION,
                Unit::Seconds,
                "HTTP request duration in seconds."
            );
        });
        Self
    }
}

impl Middleware for MonitoringMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_owned();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx).await;

            counter!(
                METRIC_REQUESTS_TOTAL,
                "method" => method.clone(),
                "path" => path.clone(),
                "status" => response.status().as_u16().to_string()
            )
            .increment(1);
            histogram!(METRIC_REQUEST_DURATION, "method" => method, "path" => path)
                .record(start.elapsed().as_secs_f64());

            response
        })
    }
}
