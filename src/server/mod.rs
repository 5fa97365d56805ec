//! HTTP observability server.
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus text exposition of the pool metrics
//! - `GET /health` - Returns 200 if the server is running

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::pool::PoolMetrics;

pub mod health;
pub mod metrics;

pub use health::health_handler;
pub use metrics::metrics_handler;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    metrics: PoolMetrics,
}

impl AppState {
    pub fn new(metrics: PoolMetrics) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { metrics }),
        }
    }

    /// Returns the metrics served on `/metrics`.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

/// Serves the router on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    app_state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Metrics server listening");
    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}


#[cfg(test)]
mod integration_tests {
    use std::time::Duration;

    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(AppState::new(PoolMetrics::new().unwrap()));
        let (status, _, body) = get(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_recorded_series() {
        let metrics = PoolMetrics::new().unwrap();
        metrics.record_processed("primary", false, Duration::from_millis(7));
        metrics.record_quarantined("primary");

        let app = build_router(AppState::new(metrics));
        let (status, content_type, body) = get(app, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/plain"));
        assert!(body.contains(
            "modkit_report_processor_reports_processed_total{remote=\"primary\",success=\"false\"} 1"
        ));
        assert!(body.contains("modkit_report_processor_reports_quarantined_total{remote=\"primary\"} 1"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let app = build_router(AppState::new(PoolMetrics::new().unwrap()));
        let (status, _, _) = get(app, "/reports").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(
            "127.0.0.1:0".parse().unwrap(),
            AppState::new(PoolMetrics::new().unwrap()),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
