//! HTTP server implementation.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::router;
use super::state::RateLimitState;
use crate::error::{Result, TollgateError};

/// HTTP server for the rate limited API.
pub struct HttpServer {
    /// Bound listener
    listener: TcpListener,
    /// Shared middleware state
    state: RateLimitState,
}

impl HttpServer {
    /// Bind the listen address.
    pub async fn bind(addr: SocketAddr, state: RateLimitState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(
            addr = %self.local_addr()?,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TollgateError::Http(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtIdentityProvider;
    use crate::ratelimit::{MemoryBucketStore, RulesHandle, TokenBucketLimiter};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn state() -> RateLimitState {
        RateLimitState::new(
            Arc::new(TokenBucketLimiter::new(Arc::new(MemoryBucketStore::new()))),
            Arc::new(RulesHandle::default()),
            Arc::new(JwtIdentityProvider::disabled()),
        )
    }

    #[tokio::test]
    async fn test_serves_and_shuts_down() {
        let server = HttpServer::bind("127.0.0.1:0".parse().unwrap(), state())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve_with_shutdown(async move {
            let _ = stopped.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"ok\""));

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
