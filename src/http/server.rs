//! HTTP server implementation.

use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::metrics::Metrics;
use super::service::{router, AppState};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiterBackend;

/// HTTP server for the rate limit service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Handler state shared by every connection
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server around `limiter`.
    pub fn new(
        addr: SocketAddr,
        limiter: Arc<dyn RateLimiterBackend>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        Ok(Self {
            addr,
            state: AppState::new(limiter, metrics, request_timeout),
        })
    }

    /// The router this server runs.
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have completed.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(
            addr = %self.addr,
            algorithm = %self.state_algorithm(),
            "Starting HTTP server for rate limit decisions"
        );

        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }

    fn state_algorithm(&self) -> String {
        self.state.limiter().algorithm().to_string()
    }
}
