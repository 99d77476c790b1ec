//! Authentication and role-based authorization.
//!
//! Credential verification is delegated to an [`Authenticator`]; this module
//! only extracts the token and maps outcomes onto `401`/`403` responses.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    Response, StatusCode,
    context::Context,
    middleware::{BoxFuture, Middleware, Next},
};

/// The authenticated caller, stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            roles: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown or malformed token")]
    InvalidToken,

    #[error("token expired")]
    Expired,

    #[error("authenticator unavailable: {0}")]
    Unavailable(String),
}

/// Verifies a bearer token.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Fixed token table, for tests and service-to-service keys.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Resolves `Authorization: [Bearer ]<token>` to a [`Principal`].
///
/// Missing header: `401 Missing authorization token`. Rejected token:
/// `401 Invalid token`.
#[derive(Clone)]
pub struct AuthMiddleware {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthMiddleware {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

fn bearer_token(header: &str) -> &str {
    let header = header.trim();
    if header.eq_ignore_ascii_case("bearer") {
        return "";
    }
    match header.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => header[7..].trim_start(),
        _ => header,
    }
}

impl Middleware for AuthMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxFuture {
        let authenticator = Arc::clone(&self.authenticator);
        Box::pin(async move {
            let token = match ctx.request().headers().get("authorization") {
                Some(header) if !bearer_token(header).is_empty() => bearer_token(header).to_owned(),
                _ => {
                    return Response::error(StatusCode::Unauthorized, "Missing authorization token");
                }
            };

            match authenticator.authenticate(&token).await {
                Ok(principal) => {
                    tracing::debug!(subject = %principal.subject, "request authenticated");
                    ctx.extensions_mut().insert(principal);
                    next.run(ctx).await
                }
                Err(e) => {
                    tracing::debug!(error = %e, "authentication failed");
                    Response::error(StatusCode::Unauthorized, "Invalid token")
                }
            }
        })
    }
}

/// Requires the authenticated [`Principal`] to hold a role.
///
/// No principal: `403 No user context found`. Missing role:
/// `403 Insufficient permissions`.
#[derive(Debug, Clone)]
pub struct RequireRole {
    role: String,
}

impl RequireRole {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl Middleware for RequireRole {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        let verdict = match ctx.extensions().get::<Principal>() {
            None => Err("No user context found"),
            Some(principal) if !principal.has_role(&self.role) => Err("Insufficient permissions"),
            Some(_) => Ok(()),
        };
        Box::pin(async move {
            match verdict {
                Ok(()) => next.run(ctx).await,
                Err(message) => Response::error(StatusCode::Forbidden, message),
            }
        })
    }
}
