//! Prometheus metrics for fork outcomes.
//!
//! Served by the worker command on `METRICS_PORT` (`/metrics`). Metric names
//! and buckets are part of the external monitoring contract.

use std::sync::LazyLock;

use prometheus::{
    CounterVec, Encoder, HistogramVec, TextEncoder, register_counter_vec, register_histogram_vec,
};

/// Total forks completed, by terminal status and model.
pub static FORK_COMPLETED: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        "sandbox_fork_completed_total",
        "Total forks completed",
        &["status", "model"]
    )
    .expect("metric registration")
});

/// Fork execution duration, by terminal status.
pub static FORK_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "sandbox_fork_duration_seconds",
        "Fork execution duration",
        &["status"],
        vec![60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0]
    )
    .expect("metric registration")
});

/// Fork cost in USD, by model.
pub static FORK_COST: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "sandbox_fork_cost_usd",
        "Fork cost in USD",
        &["model"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .expect("metric registration")
});

/// Render all registered metrics in the Prometheus text format.
pub fn encode() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        FORK_COMPLETED
            .with_label_values(&["success", "sonnet"])
            .inc();
        FORK_DURATION.with_label_values(&["success"]).observe(12.5);
        FORK_COST.with_label_values(&["sonnet"]).observe(0.42);

        let text = encode();
        assert!(text.contains("sandbox_fork_completed_total"));
        assert!(text.contains("sandbox_fork_duration_seconds"));
        assert!(text.contains("sandbox_fork_cost_usd"));
    }
}
