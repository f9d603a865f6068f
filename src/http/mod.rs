//! HTTP pipeline: the enforcement middleware and the service router.

mod middleware;
mod server;

pub use middleware::{
    annotate, client_identity, enforce, protect, RateLimitRejection, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{router, AppState, HttpServer};
