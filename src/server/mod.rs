//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests through a
//! [`Pipeline`]. Supports HTTP/1.1 persistent connections (keep-alive) out of
//! the box. Each request runs under a [`Context`] carrying the peer address,
//! an optional deadline and a cancellation token tied to server shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    context::Context,
    http::{
        StatusCode,
        request::{Request, RequestError},
        response::Response,
    },
    middleware::Pipeline,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// HTTP/1.1 front end for a [`Pipeline`].
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_shield::middleware::Chain;
/// use rttp_shield::server::Server;
/// use rttp_shield::{Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = Chain::new().finish(|_ctx| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     });
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(pipeline).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    request_timeout: Option<Duration>,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            request_timeout: None,
        })
    }

    /// Binds to `config.bind` and applies its request timeout.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let server = Self::bind(&config.bind).await?;
        Ok(server.with_request_timeout(config.request_timeout()))
    }

    /// Bounds every request (including cache store calls made on its behalf)
    /// by `timeout`, measured from when the request was parsed.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `pipeline` until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, pipeline: Pipeline) -> Result<(), ServerError> {
        self.run_until(pipeline, CancellationToken::new()).await
    }

    /// Serves `pipeline` until `shutdown` is cancelled.
    ///
    /// Cancelling `shutdown` stops accepting connections and cancels the
    /// signal of every in-flight request.
    pub async fn run_until(
        self,
        pipeline: Pipeline,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "rttp-shield listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(address = %self.local_addr, "shutting down listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let connection = Connection {
                pipeline: pipeline.clone(),
                peer_addr,
                request_timeout: self.request_timeout,
                shutdown: shutdown.child_token(),
            };

            tokio::spawn(async move {
                if let Err(e) = connection.serve(stream).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

struct Connection {
    pipeline: Pipeline,
    peer_addr: SocketAddr,
    request_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Handles a single TCP connection over its lifetime.
    ///
    /// HTTP/1.1 connections are persistent by default: we loop, reading one
    /// request per iteration, until the peer closes the connection or signals
    /// `Connection: close`.
    async fn serve(self, mut stream: TcpStream) -> Result<(), std::io::Error> {
        let peer_addr = self.peer_addr;
        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        // Pipelined requests may already be buffered; only read when the
        // buffer cannot yield a complete request.
        let mut need_read = true;

        loop {
            if need_read {
                let bytes_read = tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    read = stream.read_buf(&mut buf) => read?,
                };

                if bytes_read == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }

                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request too large, sending 413");
                    let response =
                        Response::error(StatusCode::PayloadTooLarge, "Request entity too large")
                            .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    break;
                }
            }
            need_read = true;

            let (mut request, body_offset) = match Request::parse(&buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => continue,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                    let response = Response::error(StatusCode::BadRequest, &format!("Bad Request: {e}"))
                        .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    break;
                }
            };

            // Wait for the full body to arrive if Content-Length is set.
            let content_length = request.content_length().unwrap_or(0);
            let total_needed = match body_offset.checked_add(content_length) {
                Some(total) if total <= MAX_REQUEST_SIZE => total,
                _ => {
                    warn!(peer = %peer_addr, content_length, "declared body too large, sending 413");
                    let response =
                        Response::error(StatusCode::PayloadTooLarge, "Request entity too large")
                            .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    break;
                }
            };
            if buf.len() < total_needed {
                continue;
            }
            request.truncate_body(content_length);
            request.set_remote_addr(peer_addr);

            let keep_alive = request.is_keep_alive();

            debug!(
                peer = %peer_addr,
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );

            let mut ctx = Context::new(request).with_cancellation(self.shutdown.child_token());
            if let Some(timeout) = self.request_timeout {
                ctx = ctx.with_deadline(Instant::now() + timeout);
            }

            let mut response = self.pipeline.call(ctx).await;
            if !keep_alive {
                response = response.keep_alive(false);
            }
            let close_after = !response.is_keep_alive();

            stream.write_all(&response.into_bytes()).await?;
            stream.flush().await?;

            // Drop the consumed request bytes from the buffer.
            let _ = buf.split_to(total_needed);

            if close_after {
                debug!(peer = %peer_addr, "Connection: close, shutting down");
                break;
            }
            need_read = buf.is_empty();
        }

        Ok(())
    }
}
