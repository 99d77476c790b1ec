//! Cross-Origin Resource Sharing.

use std::sync::Arc;

use serde::Deserialize;

use crate::{
    Method, Response, StatusCode,
    context::Context,
    middleware::{BoxFuture, Middleware, Next},
};

const WILDCARD: &str = "*";

/// CORS policy.
///
/// | Setting           | Default                                   |
/// |-------------------|-------------------------------------------|
/// | Allowed origins   | `*`                                       |
/// | Allowed methods   | `GET`, `POST`, `PUT`, `DELETE`, `OPTIONS` |
/// | Allowed headers   | `Content-Type`, `Authorization`           |
/// | Exposed headers   | `Content-Length`                          |
/// | Credentials       | allowed                                   |
/// | Preflight max age | 3600 s                                    |
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
        Self {
            allowed_origins: owned(&[WILDCARD]),
            allowed_methods: owned(&["GET", "POST", "PUT", "DELETE", "OPTIONS"]),
            allowed_headers: owned(&["Content-Type", "Authorization"]),
            exposed_headers: owned(&["Content-Length"]),
            allow_credentials: true,
            max_age_secs: 3600,
        }
    }
}

/// CORS middleware. Validates the `Origin` header, handles preflight
/// requests, and injects `Access-Control-*` headers on actual responses.
///
/// # Behavior
///
/// - Requests without an `Origin`, or with an origin outside the allow-list,
///   pass through unmodified.
/// - `OPTIONS` preflight requests are answered with `204 No Content`; the rest
///   of the chain is **not** called.
/// - Other requests run normally and the CORS headers are appended to the
///   response.
/// - A wildcard allow-list answers `Access-Control-Allow-Origin: *`, except when
///   credentials are allowed: browsers reject `*` with credentials, so the
///   request origin is echoed instead. Echoed origins always add `Vary: Origin`.
///
/// # Examples
///
/// ```rust
/// use rttp_shield::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://app.example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Request-ID")
///     .expose_header("Retry-After")
///     .allow_credentials(false);
/// ```
#[derive(Clone)]
pub struct CorsMiddleware {
    config: Arc<CorsConfig>,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// Creates a middleware with the permissive defaults of [`CorsConfig`].
    pub fn new() -> Self {
        Self::from_config(CorsConfig::default())
    }

    pub fn from_config(config: CorsConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn config_mut(&mut self) -> &mut CorsConfig {
        Arc::make_mut(&mut self.config)
    }

    /// Adds an allowed origin.
    ///
    /// The first explicit origin replaces the default wildcard; pass `"*"` to
    /// accept every origin again.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        let config = self.config_mut();
        if origin != WILDCARD {
            config.allowed_origins.retain(|o| o != WILDCARD);
        }
        config.allowed_origins.push(origin);
        self
    }

    /// Adds an allowed HTTP method, sent verbatim in `Access-Control-Allow-Methods`.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.config_mut().allowed_methods.push(method.into());
        self
    }

    /// Adds an allowed request header, sent verbatim in `Access-Control-Allow-Headers`.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.config_mut().allowed_headers.push(header.into());
        self
    }

    /// Adds a response header scripts may read (`Access-Control-Expose-Headers`).
    #[must_use]
    pub fn expose_header(mut self, header: impl Into<String>) -> Self {
        self.config_mut().exposed_headers.push(header.into());
        self
    }

    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.config_mut().allow_credentials = allow;
        self
    }

    #[must_use]
    pub fn max_age(mut self, secs: u64) -> Self {
        self.config_mut().max_age_secs = secs;
        self
    }

    // Value for Access-Control-Allow-Origin, or None if the origin is refused.
    fn resolve_origin(&self, origin: &str) -> Option<String> {
        let config = &self.config;
        if config.allowed_origins.iter().any(|o| o == WILDCARD) {
            if config.allow_credentials {
                Some(origin.to_owned())
            } else {
                Some(WILDCARD.to_owned())
            }
        } else if config.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        let allow_origin = ctx
            .request()
            .headers()
            .get("origin")
            .and_then(|origin| self.resolve_origin(origin));
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            let Some(allow_origin) = allow_origin else {
                return next.run(ctx).await;
            };
            let echoed = allow_origin != WILDCARD;

            let mut resp = if ctx.request().method() == &Method::Options {
                Response::new(StatusCode::NoContent)
                    .header("Access-Control-Allow-Methods", config.allowed_methods.join(", "))
                    .header("Access-Control-Allow-Headers", config.allowed_headers.join(", "))
                    .header("Access-Control-Max-Age", config.max_age_secs.to_string())
            } else {
                let mut resp = next.run(ctx).await;
                if !config.exposed_headers.is_empty() {
                    resp.add_header(
                        "Access-Control-Expose-Headers",
                        config.exposed_headers.join(", "),
                    );
                }
                resp
            };

            resp.add_header("Access-Control-Allow-Origin", allow_origin);
            if config.allow_credentials {
                resp.add_header("Access-Control-Allow-Credentials", "true");
            }
            if echoed {
                resp.add_header("Vary", "Origin");
            }
            resp
        })
    }
}
