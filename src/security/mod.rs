//! Security middleware: cross-origin policy, authentication and role checks.
//!
//! - [`CorsMiddleware`]: `Origin` validation, preflight short-circuit and
//!   `Access-Control-*` response headers.
//! - [`AuthMiddleware`]: resolves the `Authorization` header to a [`Principal`]
//!   through an [`Authenticator`] and stores it in the request extensions.
//! - [`RequireRole`]: rejects requests whose principal lacks a role.

mod auth;
mod cors;

pub use auth::{AuthError, AuthMiddleware, Authenticator, Principal, RequireRole, StaticTokenAuthenticator};
pub use cors::{CorsConfig, CorsMiddleware};
