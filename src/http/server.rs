//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::{router, AppState};
use crate::error::{RatewatchError, Result};

/// HTTP server for the request counting service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Counter and limiters shared with the handler
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            RatewatchError::Io(e)
        })?;

        serve_listener(listener, self.state, signal).await
    }
}

/// Serve requests on an already bound listener until `signal` resolves.
pub(crate) async fn serve_listener<F>(listener: TcpListener, state: AppState, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Starting HTTP server");

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            RatewatchError::Io(e)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::CounterResponse;
    use crate::lifetime::Lifetime;
    use crate::ratelimit::{LimiterRegistry, WindowCounter, WindowSettings};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let counter = Arc::new(WindowCounter::new(Duration::from_secs(60), 1000, None).unwrap());
        let _server = HttpServer::new(addr, AppState::new(counter, None));
    }

    #[tokio::test]
    async fn test_serves_over_tcp_until_shutdown() {
        let lifetime = Lifetime::new();
        let counter = Arc::new(WindowCounter::new(Duration::from_secs(60), 1000, None).unwrap());
        let settings = WindowSettings::new(Duration::from_secs(20), 1000).unwrap();
        let registry = Arc::new(LimiterRegistry::new(settings, 3, None, lifetime.clone()));
        let state = AppState::new(counter, Some(registry));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let stop = lifetime.clone();
        let server = tokio::spawn(serve_listener(listener, state, async move {
            stop.cancelled().await
        }));

        let client = reqwest::Client::new();
        for expected in 1..=3 {
            let response = client.get(&url).send().await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            let body: CounterResponse = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
            assert_eq!(body.counter, expected);
        }

        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
        drop(client);

        lifetime.shutdown().await;
        assert!(server.await.unwrap().is_ok());
    }
}
