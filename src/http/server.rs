//! HTTP server exposing the limiter as a service.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::middleware::{annotate, client_identity, RateLimitRejection};
use crate::error::{InkgateError, Result};
use crate::ratelimit::{CounterStore, Decision, FailureMode, RateLimitRegistry, StatsSnapshot};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<RateLimitRegistry>,
    store: Arc<dyn CounterStore>,
    health_timeout: Duration,
}

impl AppState {
    pub fn new(
        registry: Arc<RateLimitRegistry>,
        store: Arc<dyn CounterStore>,
        health_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            health_timeout,
        }
    }
}

#[derive(Debug, Serialize)]
struct PolicyView {
    name: String,
    limit: u64,
    window_secs: u64,
    key_prefix: String,
    failure_mode: FailureMode,
    stats: StatsSnapshot,
}

/// Build the service router.
///
/// - `GET /healthz` reports whether the counter store answers
/// - `GET /v1/policies` lists policies and their counters
/// - `POST /v1/policies/{name}/check` counts one request for the caller
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/policies", get(list_policies))
        .route("/v1/policies/{name}/check", post(check_policy))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    let ping = tokio::time::timeout(state.health_timeout, state.store.ping()).await;

    match ping {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Ok(Err(e)) => {
            warn!(error = %e, "Health check: counter store unavailable");
            degraded()
        }
        Err(_) => {
            warn!(timeout_ms = state.health_timeout.as_millis() as u64, "Health check: counter store timed out");
            degraded()
        }
    }
}

fn degraded() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": "degraded" })),
    )
        .into_response()
}

async fn list_policies(State(state): State<AppState>) -> Json<Vec<PolicyView>> {
    let views = state
        .registry
        .iter()
        .map(|limiter| {
            let policy = limiter.policy();
            PolicyView {
                name: policy.name().to_string(),
                limit: policy.limit(),
                window_secs: policy.window().as_secs(),
                key_prefix: policy.key_prefix().to_string(),
                failure_mode: policy.failure_mode(),
                stats: limiter.stats(),
            }
        })
        .collect();

    Json(views)
}

async fn check_policy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    req: Request,
) -> Response {
    let Some(limiter) = state.registry.get(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": format!("Unknown rate limit policy: {}", name) })),
        )
            .into_response();
    };

    let identity = client_identity(&req);

    match limiter.check_identity(&identity).await {
        Decision::Admit { remaining } => {
            let mut response = Json(json!({
                "decision": "admit",
                "policy": name,
                "remaining": remaining,
            }))
            .into_response();
            annotate(&mut response, &limiter, remaining);
            response
        }
        Decision::Reject { retry_after } => RateLimitRejection::new(retry_after).into_response(),
    }
}

/// HTTP server for the rate limit service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Handler state
    state: AppState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have finished.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server for rate limit service");

        axum::serve(
            listener,
            router(self.state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            InkgateError::Server(e.to_string())
        })
    }
}
