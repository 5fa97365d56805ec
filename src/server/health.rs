//! Liveness endpoint, served next to `/metrics` while `modqueue drain` runs.
//!
//! It reports only that the metrics server is up. Store connectivity shows
//! up in `fetch_errors_total` instead.

use axum::http::StatusCode;

/// Body returned by `/health`.
pub const HEALTHY: &str = "OK";

/// Returns 200 with [`HEALTHY`] as long as the drain process is serving
/// requests.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, HEALTHY)
}
