//! Prometheus metrics for report processing.
//!
//! Every name below is exported with the `modkit_report_processor_` prefix,
//! e.g. `modkit_report_processor_reports_processed_total`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `reports_processed_total` | Counter | `remote`, `success` |
//! | `report_processing_duration_seconds` | Histogram | `remote`, `success` |
//! | `reports_quarantined_total` | Counter | `remote` |
//! | `fetch_errors_total` | Counter | `remote` |
//!
//! `remote` is the label given to [`FanInPool::add_remote`](super::FanInPool::add_remote).

use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors from metrics setup or export.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Metric namespace shared with existing dashboards.
pub const NAMESPACE: &str = "modkit";

/// Metric subsystem for the processing pool.
pub const SUBSYSTEM: &str = "report_processor";

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE).subsystem(SUBSYSTEM)
}

/// Processing metrics, registered in a registry owned by this struct.
///
/// Cloning is cheap and clones record into the same series.
#[derive(Clone)]
pub struct PoolMetrics {
    registry: Registry,
    processed_total: CounterVec,
    processing_duration: HistogramVec,
    quarantined_total: CounterVec,
    fetch_errors_total: CounterVec,
}

impl std::fmt::Debug for PoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMetrics").finish_non_exhaustive()
    }
}

fn success_label(success: bool) -> &'static str {
    if success { "true" } else { "false" }
}

impl PoolMetrics {
    /// Creates the metrics in a fresh registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric name is already registered.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let processed_total = CounterVec::new(
            opts(
                "reports_processed_total",
                "Number of processed reports, by remote and outcome",
            ),
            &["remote", "success"],
        )?;
        registry.register(Box::new(processed_total.clone()))?;

        let processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "report_processing_duration_seconds",
                "Time spent processing one report",
            )
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
            &["remote", "success"],
        )?;
        registry.register(Box::new(processing_duration.clone()))?;

        let quarantined_total = CounterVec::new(
            opts(
                "reports_quarantined_total",
                "Number of reports moved to quarantine",
            ),
            &["remote"],
        )?;
        registry.register(Box::new(quarantined_total.clone()))?;

        let fetch_errors_total = CounterVec::new(
            opts(
                "fetch_errors_total",
                "Number of failed attempts to read the next report",
            ),
            &["remote"],
        )?;
        registry.register(Box::new(fetch_errors_total.clone()))?;

        Ok(Self {
            registry,
            processed_total,
            processing_duration,
            quarantined_total,
            fetch_errors_total,
        })
    }

    /// Records one processing attempt.
    pub fn record_processed(&self, remote: &str, success: bool, elapsed: Duration) {
        let labels = [remote, success_label(success)];
        self.processed_total.with_label_values(&labels).inc();
        self.processing_duration
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_quarantined(&self, remote: &str) {
        self.quarantined_total.with_label_values(&[remote]).inc();
    }

    pub fn record_fetch_error(&self, remote: &str) {
        self.fetch_errors_total.with_label_values(&[remote]).inc();
    }

    #[must_use]
    pub fn processed_count(&self, remote: &str, success: bool) -> f64 {
        self.processed_total
            .with_label_values(&[remote, success_label(success)])
            .get()
    }

    #[must_use]
    pub fn duration_sample_count(&self, remote: &str, success: bool) -> u64 {
        self.processing_duration
            .with_label_values(&[remote, success_label(success)])
            .get_sample_count()
    }

    #[must_use]
    pub fn quarantined_count(&self, remote: &str) -> f64 {
        self.quarantined_total.with_label_values(&[remote]).get()
    }

    #[must_use]
    pub fn fetch_error_count(&self, remote: &str) -> f64 {
        self.fetch_errors_total.with_label_values(&[remote]).get()
    }

    /// The registry the metrics live in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_per_remote_and_outcome() {
        let m = PoolMetrics::new().unwrap();
        m.record_processed("primary", true, Duration::from_millis(3));
        m.record_processed("primary", true, Duration::from_millis(4));
        m.record_processed("primary", false, Duration::from_millis(5));
        m.record_processed("10.0.0.7:6379", true, Duration::from_millis(1));

        assert_eq!(m.processed_count("primary", true), 2.0);
        assert_eq!(m.processed_count("primary", false), 1.0);
        assert_eq!(m.processed_count("10.0.0.7:6379", true), 1.0);
        assert_eq!(m.processed_count("10.0.0.7:6379", false), 0.0);
        assert_eq!(m.duration_sample_count("primary", true), 2);
    }

    #[test]
    fn quarantine_and_fetch_error_counters() {
        let m = PoolMetrics::new().unwrap();
        m.record_quarantined("primary");
        m.record_fetch_error("primary");
        m.record_fetch_error("primary");
        assert_eq!(m.quarantined_count("primary"), 1.0);
        assert_eq!(m.fetch_error_count("primary"), 2.0);
    }

    #[test]
    fn clones_share_series() {
        let m = PoolMetrics::new().unwrap();
        m.clone().record_quarantined("primary");
        assert_eq!(m.quarantined_count("primary"), 1.0);
    }

    #[test]
    fn encode_text_contains_recorded_series() {
        let m = PoolMetrics::new().unwrap();
        m.record_processed("primary", true, Duration::from_millis(2));
        let text = m.encode_text().unwrap();
        assert!(text.contains(
            "modkit_report_processor_reports_processed_total{remote=\"primary\",success=\"true\"} 1"
        ));
        assert!(text.contains("modkit_report_processor_report_processing_duration_seconds_bucket"));
    }

    #[test]
    fn every_series_carries_the_modkit_prefix() {
        let m = PoolMetrics::new().unwrap();
        m.record_processed("primary", false, Duration::from_millis(1));
        m.record_quarantined("primary");
        m.record_fetch_error("primary");

        let names: Vec<String> = m
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert_eq!(names.len(), 4);
        for name in &names {
            assert!(name.starts_with("modkit_report_processor_"), "{name}");
        }
        assert!(names.contains(&"modkit_report_processor_fetch_errors_total".to_string()));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        PoolMetrics::with_registry(registry.clone()).unwrap();
        assert!(matches!(
            PoolMetrics::with_registry(registry),
            Err(MetricsError::Registration(_))
        ));
    }
}
