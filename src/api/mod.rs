//! HTTP surface: routers and the admission middleware stack.

pub mod auth;
pub mod concurrency;
pub mod rate_limit;
pub mod request_id;
pub mod routes;
