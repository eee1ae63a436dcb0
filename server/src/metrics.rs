//! Prometheus exporter: describes every named series this crate emits and
//! hands back the handle its `/metrics` endpoint renders from.

use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
        metrics::describe_histogram!(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        );
        metrics::describe_gauge!(
            "database_connections_active",
            "Number of active database connections"
        );
        metrics::describe_counter!("database_queries_total", "Total number of database queries");

        metrics::describe_gauge!("hub_connections_active", "Currently registered WebSocket connections");
        metrics::describe_counter!("hub_frames_in_total", "Inbound WebSocket text frames received");
        metrics::describe_counter!("hub_frames_out_total", "Outbound WebSocket text frames sent");
        metrics::describe_counter!(
            "hub_close_total",
            "WebSocket connections closed, labeled by close code"
        );

        metrics::describe_counter!("outbox_claimed_total", "Outbox rows claimed by the dispatcher");
        metrics::describe_counter!("outbox_sent_total", "Outbox rows successfully published to the stream");
        metrics::describe_counter!("outbox_dead_total", "Outbox rows routed to the dead-letter table");
        metrics::describe_histogram!(
            "dispatcher_tick_duration_seconds",
            "Wall-clock time spent in one dispatcher claim-publish cycle"
        );

        metrics::describe_gauge!(
            "consumer_lag",
            "Entries currently held in the consumer's per-aggregate reorder buffers"
        );
        metrics::describe_counter!(
            "consumer_gap_detected_total",
            "Reorder buffers force-flushed after a sequence gap outlived reorderTimeoutMs"
        );

        metrics::describe_counter!(
            "rate_limiter_rejected_total",
            "Requests rejected by the composed rate limiter"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let metrics = handle.render();
    (StatusCode::OK, metrics)
}

/// Middleware to track HTTP request metrics.
pub async fn track_request_metrics(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed();

    metrics::counter!("http_requests_total", 1);
    metrics::histogram!("http_request_duration_seconds", duration.as_secs_f64());

    response
}
