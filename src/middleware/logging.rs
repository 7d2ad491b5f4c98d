use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::{Method, StatusCode};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initialise the tracing subscriber from the logging configuration.
/// RUST_LOG overrides the configured level. Safe to call more than once;
/// later calls are ignored.
pub fn init_tracing(cfg: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    let json = cfg.format.eq_ignore_ascii_case("json");

    if cfg.output == "stdout" || cfg.output.is_empty() {
        if json {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .json()
                .try_init();
        } else {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .try_init();
        }
        return;
    }

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.output)
    {
        Ok(file) => {
            let writer = Arc::new(file);
            if json {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .json()
                    .with_writer(writer)
                    .try_init();
            } else {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(writer)
                    .try_init();
            }
        }
        Err(e) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .try_init();
            tracing::warn!(path = %cfg.output, error = %e, "failed to open log file, using stdout");
        }
    }
}

/// Access log line, one per completed request.
pub fn log_request(
    remote_addr: SocketAddr,
    method: &Method,
    path: &str,
    status: StatusCode,
    size: usize,
    elapsed: Duration,
) {
    info!(
        remote = %remote_addr,
        method = %method,
        path = %path,
        status = status.as_u16(),
        size,
        elapsed_ms = elapsed.as_millis() as u64,
        "request"
    );
}
