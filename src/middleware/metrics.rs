use std::sync::OnceLock;
use std::time::Duration;

use hyper::{Method, StatusCode};
use metrics::{describe_counter, describe_histogram, histogram, increment_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Idempotent; only the first call wins.
pub fn install() {
    if HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            describe_counter!(
                "gonk_http_requests_total",
                "Total number of HTTP requests"
            );
            describe_histogram!(
                "gonk_http_request_duration_seconds",
                "HTTP request duration in seconds"
            );
            let _ = HANDLE.set(handle);
        }
        Err(e) => tracing::warn!(error = %e, "failed to install metrics recorder"),
    }
}

/// Render the Prometheus text exposition.
pub fn render() -> String {
    HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}

/// Record one completed request.
pub fn record_request(route: &str, method: &Method, status: StatusCode, elapsed: Duration) {
    increment_counter!(
        "gonk_http_requests_total",
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status_class" => status_class(status)
    );
    histogram!(
        "gonk_http_request_duration_seconds",
        elapsed.as_secs_f64(),
        "route" => route.to_string(),
        "method" => method.to_string()
    );
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        500.. => "5xx",
        400.. => "4xx",
        300.. => "3xx",
        200.. => "2xx",
        _ => "1xx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert_eq!(status_class(StatusCode::OK), "2xx");
        assert_eq!(status_class(StatusCode::NO_CONTENT), "2xx");
        assert_eq!(status_class(StatusCode::MOVED_PERMANENTLY), "3xx");
        assert_eq!(status_class(StatusCode::TOO_MANY_REQUESTS), "4xx");
        assert_eq!(status_class(StatusCode::BAD_GATEWAY), "5xx");
        assert_eq!(status_class(StatusCode::CONTINUE), "1xx");
    }
}
