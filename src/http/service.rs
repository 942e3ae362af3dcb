//! Request counting handler.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::ratelimit::{LimiterRegistry, WindowCounter};

/// Shared state handed to every request.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Requests served in the trailing window
    counter: Arc<WindowCounter>,
    /// Per-client limiters; `None` disables admission control
    registry: Option<Arc<LimiterRegistry>>,
}

impl AppState {
    pub fn new(counter: Arc<WindowCounter>, registry: Option<Arc<LimiterRegistry>>) -> Self {
        Self { counter, registry }
    }

    pub fn counter(&self) -> &Arc<WindowCounter> {
        &self.counter
    }

    pub fn registry(&self) -> Option<&Arc<LimiterRegistry>> {
        self.registry.as_ref()
    }
}

/// Body of a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterResponse {
    /// Requests served in the trailing window, this one included
    pub counter: i64,
}

/// Build the router. Every path and method is counted.
pub fn router(state: AppState) -> Router {
    Router::new().fallback(count_request).with_state(state)
}

#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
async fn count_request(State(state): State<AppState>, request: Request) -> Response {
    if let Some(registry) = &state.registry {
        let Some(peer) = peer_addr(&request) else {
            warn!("Request has no peer address, cannot identify client");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        };

        let client = peer.ip().to_string();
        if !registry.get(&client).is_allowed() {
            debug!(client = %client, "Rate limit exceeded");
            return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
        }
    }

    let counter = state.counter.increase();
    debug!(counter, "Request counted");

    (StatusCode::OK, Json(CounterResponse { counter })).into_response()
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}
