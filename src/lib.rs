//! # rttp-shield
//!
//! An async HTTP/1.1 request pipeline that protects an origin handler with
//! response caching, per-client rate limiting and circuit breaking, composed
//! as an ordered chain of independent middleware.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rttp_shield::cache::MemoryStore;
//! use rttp_shield::config::PipelineConfig;
//! use rttp_shield::server::Server;
//! use rttp_shield::{Response, StatusCode, pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let pipeline = pipeline::standard(&config, Arc::new(MemoryStore::new()), None)?
//!         .finish(|_ctx| async {
//!             Response::new(StatusCode::Ok).body("Hello, World!")
//!         });
//!
//!     let server = Server::from_config(&config.server).await?;
//!     server.run(pipeline).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod circuit;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod pipeline;
pub mod ratelimit;
pub mod security;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::Context;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::{Chain, Middleware, Next, Pipeline};
pub use server::{Server, ServerError};
