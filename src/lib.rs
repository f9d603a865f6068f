//! Inkgate - Shared Fixed-Window Rate Limiting
//!
//! This crate implements the request rate limiter that sits in front of the
//! writing platform's protected endpoints. Counts live in a store shared by
//! every serving process (Redis in production), so a policy holds across the
//! whole fleet rather than per process. When that store fails, each policy
//! either admits (fails open) or rejects (fails closed) as configured.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
