//! JSON payload validation for requests that carry a body.

use std::sync::Arc;

use serde_json::Value;

use super::{BoxFuture, Middleware, Next};
use crate::{Method, Response, StatusCode, context::Context};

type Validator = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

/// Rejects `POST`, `PUT` and `PATCH` requests whose body is not JSON
/// (`400 Invalid request payload`) or fails the supplied validator (`400` with
/// the validator's message). Other methods pass through untouched.
///
/// # Examples
///
/// ```
/// use rttp_shield::middleware::ValidationMiddleware;
///
/// let validation = ValidationMiddleware::new(|payload| {
///     match payload.get("email").and_then(|v| v.as_str()) {
///         Some(email) if email.contains('@') => Ok(()),
///         _ => Err("email is required".to_string()),
///     }
/// });
/// ```
#[derive(Clone)]
pub struct ValidationMiddleware {
    validator: Arc<Validator>,
}

impl ValidationMiddleware {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
        }
    }

    /// Only checks that the body is well-formed JSON.
    pub fn json_only() -> Self {
        Self::new(|_| Ok(()))
    }
}

fn carries_payload(method: &Method) -> bool {
    matches!(method, Method::Post | Method::Put | Method::Patch)
}

impl Middleware for ValidationMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        let validator = Arc::clone(&self.validator);
        Box::pin(async move {
            if !carries_payload(ctx.request().method()) {
                return next.run(ctx).await;
            }

            let payload: Value = match ctx.json() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::debug!(error = %e, "rejecting malformed payload");
                    return Response::error(StatusCode::BadRequest, "Invalid request payload");
                }
            };

            if let Err(message) = validator(&payload) {
                return Response::error(StatusCode::BadRequest, &message);
            }

            next.run(ctx).await
        })
    }
}
