//! Rate limit enforcement for axum routers.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::ratelimit::{ClientIdentity, Decision, RateLimiter};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The 429 response for a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRejection {
    retry_after: Duration,
}

impl RateLimitRejection {
    pub fn new(retry_after: Duration) -> Self {
        Self { retry_after }
    }

    /// Whole seconds until the window resets, rounded up and never zero.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let secs = if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        secs.max(1)
    }

    pub fn detail(&self) -> String {
        format!(
            "Rate limit exceeded. Try again in {} seconds.",
            self.retry_after_secs()
        )
    }
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let secs = self.retry_after_secs();
        let reset_at = chrono::Utc::now().timestamp() + secs as i64;

        (
            StatusCode::TOO_MANY_REQUESTS,
            [
                (header::RETRY_AFTER, secs.to_string()),
                (X_RATELIMIT_RESET, reset_at.to_string()),
            ],
            Json(json!({ "detail": self.detail() })),
        )
            .into_response()
    }
}

/// Resolve the caller of `req` from `X-Forwarded-For` or the peer address.
pub fn client_identity(req: &Request) -> ClientIdentity {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    ClientIdentity::resolve(req.headers(), peer)
}

/// Add the limit headers to an admitted response.
pub fn annotate(response: &mut Response, limiter: &RateLimiter, remaining: Option<u64>) {
    // Degraded admits carry no count worth reporting
    let Some(remaining) = remaining else {
        return;
    };
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limiter.policy().limit()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
}

/// Middleware running `limiter` before the inner handler.
#[instrument(skip_all, fields(policy = %limiter.policy().name()))]
pub async fn enforce(State(limiter): State<Arc<RateLimiter>>, req: Request, next: Next) -> Response {
    let identity = client_identity(&req);

    match limiter.check_identity(&identity).await {
        Decision::Admit { remaining } => {
            let mut response = next.run(req).await;
            annotate(&mut response, &limiter, remaining);
            response
        }
        Decision::Reject { retry_after } => RateLimitRejection::new(retry_after).into_response(),
    }
}

/// Put every route of `router` behind `limiter`.
pub fn protect<S>(router: Router<S>, limiter: Arc<RateLimiter>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(limiter, enforce))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Policy, DEFAULT_STORE_TIMEOUT};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::post;
    use tower::ServiceExt;

    fn limited_app(limit: u64) -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let policy = Policy::new("margin", limit, Duration::from_secs(3600), "margin").unwrap();
        let limiter = Arc::new(RateLimiter::new(policy, store.clone(), DEFAULT_STORE_TIMEOUT).unwrap());

        let router = Router::new().route("/margins", post(|| async { "created" }));
        (protect(router, limiter), store)
    }

    fn request_from(ip: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/margins")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(RateLimitRejection::new(Duration::from_millis(57_200)).retry_after_secs(), 58);
        assert_eq!(RateLimitRejection::new(Duration::from_secs(58)).retry_after_secs(), 58);
        assert_eq!(RateLimitRejection::new(Duration::ZERO).retry_after_secs(), 1);
    }

    #[tokio::test]
    async fn test_rejection_response() {
        let response = RateLimitRejection::new(Duration::from_secs(58)).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "58");
        assert!(response.headers().contains_key(X_RATELIMIT_RESET));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["detail"], "Rate limit exceeded. Try again in 58 seconds.");
    }

    #[tokio::test]
    async fn test_admits_then_throttles() {
        let (app, _) = limited_app(2);

        for remaining in ["1", "0"] {
            let response = app.clone().oneshot(request_from("203.0.113.5")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[&X_RATELIMIT_LIMIT], "2");
            assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], remaining);
        }

        let response = app.clone().oneshot(request_from("203.0.113.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3600");

        // Another client is unaffected
        let response = app.oneshot(request_from("203.0.113.6")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_request_without_address_uses_unknown_bucket() {
        let (app, store) = limited_app(5);

        let request = Request::builder()
            .method("POST")
            .uri("/margins")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.get("margin:unknown"), Some(1));
    }

    #[tokio::test]
    async fn test_peer_address_from_connect_info() {
        let (app, store) = limited_app(5);

        let mut request = Request::builder()
            .method("POST")
            .uri("/margins")
            .body(Body::empty())
            .unwrap();
        let peer: SocketAddr = "192.0.2.44:51000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));

        app.oneshot(request).await.unwrap();
        assert_eq!(store.get("margin:192.0.2.44"), Some(1));
    }

    #[tokio::test]
    async fn test_store_outage_is_invisible() {
        let (app, store) = limited_app(1);
        store.set_available(false);

        for _ in 0..5 {
            let response = app.clone().oneshot(request_from("203.0.113.5")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(&X_RATELIMIT_REMAINING));
        }
    }
}
