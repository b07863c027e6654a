//! Prometheus metrics for cloudmux.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "cloudmux_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "cloudmux_http_request_duration_seconds";

/// Total S3 operations (counter). Labels: operation, status.
pub const S3_OPERATIONS_TOTAL: &str = "cloudmux_s3_operations_total";

/// Rejected authentications (counter). Labels: code.
pub const AUTH_FAILURES_TOTAL: &str = "cloudmux_auth_failures_total";

/// Smart-upload attempts against one account (counter). Labels: outcome.
pub const SMART_UPLOAD_ATTEMPTS_TOTAL: &str = "cloudmux_smart_upload_attempts_total";

/// Smart uploads that moved on to the next account (counter).
pub const SMART_UPLOAD_FAILOVERS_TOTAL: &str = "cloudmux_smart_upload_failovers_total";

/// Objects deleted by quota GC (counter).
pub const GC_DELETED_OBJECTS_TOTAL: &str = "cloudmux_gc_deleted_objects_total";

/// Bytes freed by quota GC (counter).
pub const GC_FREED_BYTES_TOTAL: &str = "cloudmux_gc_freed_bytes_total";

/// Per-account usage sync runs (counter). Labels: outcome.
pub const USAGE_SYNC_RUNS_TOTAL: &str = "cloudmux_usage_sync_runs_total";

/// Objects removed by the expiration sweep (counter).
pub const EXPIRED_OBJECTS_REMOVED_TOTAL: &str = "cloudmux_expired_objects_removed_total";

/// Last-used updates dropped because the queue was full (counter).
pub const LAST_USED_DROPPED_TOTAL: &str = "cloudmux_last_used_dropped_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(S3_OPERATIONS_TOTAL, "Total S3 operations by type");
    describe_counter!(AUTH_FAILURES_TOTAL, "Rejected authentications by error code");
    describe_counter!(
        SMART_UPLOAD_ATTEMPTS_TOTAL,
        "Smart upload attempts against a single account"
    );
    describe_counter!(
        SMART_UPLOAD_FAILOVERS_TOTAL,
        "Smart uploads retried on the next account"
    );
    describe_counter!(GC_DELETED_OBJECTS_TOTAL, "Objects deleted by quota GC");
    describe_counter!(GC_FREED_BYTES_TOTAL, "Bytes freed by quota GC");
    describe_counter!(USAGE_SYNC_RUNS_TOTAL, "Per-account usage sync runs");
    describe_counter!(
        EXPIRED_OBJECTS_REMOVED_TOTAL,
        "Objects removed by the expiration sweep"
    );
    describe_counter!(
        LAST_USED_DROPPED_TOTAL,
        "Credential last-used updates dropped on a full queue"
    );
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/s3/my-bucket` -> `/s3/{bucket}`
/// - `/s3/my-bucket/path/to/key` -> `/s3/{bucket}/{key}`
/// - anything else (virtual-hosted keys) -> `/{key}`
fn normalize_path(path: &str) -> String {
    match path {
        "/health" | "/metrics" => path.to_string(),
        _ => match path.strip_prefix("/s3/") {
            Some(rest) if rest.trim_end_matches('/').contains('/') => {
                "/s3/{bucket}/{key}".to_string()
            }
            Some(_) => "/s3/{bucket}".to_string(),
            None => "/{key}".to_string(),
        },
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = PROMETHEUS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_fixed() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }

    #[test]
    fn test_normalize_path_bucket() {
        assert_eq!(normalize_path("/s3/my-bucket"), "/s3/{bucket}");
        assert_eq!(normalize_path("/s3/my-bucket/"), "/s3/{bucket}");
    }

    #[test]
    fn test_normalize_path_object() {
        assert_eq!(normalize_path("/s3/my-bucket/key"), "/s3/{bucket}/{key}");
        assert_eq!(
            normalize_path("/s3/my-bucket/path/to/object.txt"),
            "/s3/{bucket}/{key}"
        );
    }

    #[test]
    fn test_normalize_path_virtual_hosted() {
        assert_eq!(normalize_path("/"), "/{key}");
        assert_eq!(normalize_path("/photos/cat.jpg"), "/{key}");
    }

    #[test]
    fn test_init_metrics_idempotent() {
        let a = init_metrics() as *const PrometheusHandle;
        let b = init_metrics() as *const PrometheusHandle;
        assert_eq!(a, b);
    }
}
