use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use hyper::StatusCode;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::core::pipeline::{Middleware, MiddlewareHandler};
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    half_open_successes: u32,
    half_open_admitted: u32,
}

/// Per-route three-state circuit breaker.
///
/// Closed admits everything; `max_failures` consecutive failures open the
/// circuit; after `reset_timeout` the next caller moves it to HalfOpen,
/// which admits up to `half_open_max_reqs` probes. That many successes close
/// it again; any failure reopens it.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                last_failure_at: None,
                half_open_successes: 0,
                half_open_admitted: 0,
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.state {
            State::Closed => true,
            State::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|t| now.saturating_duration_since(t));
                if elapsed.is_some_and(|e| e >= self.config.reset_timeout) {
                    info!(breaker = %self.name, "circuit transitioning open -> half-open");
                    inner.state = State::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_admitted = 1;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max_reqs {
                    inner.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record(&self, success: bool) {
        self.record_at(success, Instant::now())
    }

    fn record_at(&self, success: bool, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if success {
            match inner.state {
                State::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_max_reqs {
                        info!(breaker = %self.name, "circuit transitioning half-open -> closed");
                        inner.state = State::Closed;
                        inner.failure_count = 0;
                        inner.half_open_successes = 0;
                        inner.half_open_admitted = 0;
                    }
                }
                State::Closed => inner.failure_count = 0,
                State::Open => {}
            }
        } else {
            inner.failure_count += 1;
            inner.last_failure_at = Some(now);

            let tripping = inner.state == State::HalfOpen
                || (inner.state == State::Closed
                    && inner.failure_count >= self.config.max_failures);
            if tripping {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "circuit transitioning to open"
                );
                inner.state = State::Open;
                inner.half_open_successes = 0;
                inner.half_open_admitted = 0;
            }
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }
}

/// Route-name keyed breaker store; breakers survive configuration reloads
/// so a flapping upstream cannot reset its own breaker by touching the
/// config file.
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = breakers.get(name) {
                return Arc::clone(cb);
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone()))),
        )
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Short-circuits requests while the route's breaker is open and feeds
/// outcomes back on the way out. A failure is any response with status
/// >= 500; transport errors surface as 502 and count the same way.
pub struct CircuitBreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerMiddleware {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    async fn handle(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        if !self.breaker.allow() {
            return Ok(GatewayResponse::error(
                StatusCode::SERVICE_UNAVAILABLE,
                "service temporarily unavailable",
            ));
        }

        match next.handle(request).await {
            Ok(resp) => {
                self.breaker.record(resp.status.as_u16() < 500);
                Ok(resp)
            }
            Err(e) => {
                self.breaker.record(false);
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        "circuit_breaker"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(max_failures: u32, reset_secs: u64, half_open: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            max_failures,
            reset_timeout: Duration::from_secs(reset_secs),
            half_open_max_reqs: half_open,
        }
    }

    #[test]
    fn trips_after_max_failures() {
        let cb = CircuitBreaker::new("t", config(3, 1, 2));
        let now = Instant::now();

        for _ in 0..3 {
            assert!(cb.allow_at(now));
            cb.record_at(false, now);
        }

        assert_eq!(cb.state(), State::Open);
        assert!(!cb.allow_at(now));
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let cb = CircuitBreaker::new("t", config(3, 1, 2));
        let now = Instant::now();

        cb.record_at(false, now);
        cb.record_at(false, now);
        cb.record_at(true, now);
        cb.record_at(false, now);
        cb.record_at(false, now);

        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn half_open_recovery_cycle() {
        let cb = CircuitBreaker::new("t", config(3, 1, 2));
        let start = Instant::now();

        for _ in 0..3 {
            cb.record_at(false, start);
        }
        assert_eq!(cb.state(), State::Open);
        assert!(!cb.allow_at(start + Duration::from_millis(500)));

        // After the reset timeout the next two callers are admitted.
        let after = start + Duration::from_secs(1);
        assert!(cb.allow_at(after));
        assert_eq!(cb.state(), State::HalfOpen);
        assert!(cb.allow_at(after));

        // Only half_open_max_reqs probes may be in flight.
        assert!(!cb.allow_at(after));

        cb.record_at(true, after);
        cb.record_at(true, after);
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.allow_at(after));
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("t", config(1, 1, 2));
        let start = Instant::now();

        cb.record_at(false, start);
        assert_eq!(cb.state(), State::Open);

        let after = start + Duration::from_secs(1);
        assert!(cb.allow_at(after));
        cb.record_at(false, after);
        assert_eq!(cb.state(), State::Open);

        // The clock restarts from the half-open failure.
        assert!(!cb.allow_at(after + Duration::from_millis(500)));
        assert!(cb.allow_at(after + Duration::from_secs(1)));
    }

    #[test]
    fn manager_returns_same_breaker_for_name() {
        let manager = CircuitBreakerManager::new();
        let cfg = config(3, 1, 2);

        let a = manager.get_or_create("route-a", &cfg);
        let b = manager.get_or_create("route-a", &cfg);
        assert!(Arc::ptr_eq(&a, &b));

        let c = manager.get_or_create("route-c", &cfg);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn middleware_short_circuits_with_503() {
        use bytes::Bytes;
        use hyper::{HeaderMap, Method, Uri};

        struct Fail;

        #[async_trait]
        impl MiddlewareHandler for Fail {
            async fn handle(
                &self,
                _request: GatewayRequest,
            ) -> Result<GatewayResponse, GatewayError> {
                Ok(GatewayResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "boom",
                ))
            }
        }

        let breaker = Arc::new(CircuitBreaker::new("t", config(2, 60, 1)));
        let mw = CircuitBreakerMiddleware::new(Arc::clone(&breaker));

        let make_request = || {
            GatewayRequest::new(
                Method::GET,
                Uri::from_static("/x"),
                HeaderMap::new(),
                Bytes::new(),
                "127.0.0.1:1".parse().unwrap(),
            )
        };

        // Two 500s trip the breaker.
        for _ in 0..2 {
            let resp = mw.handle(make_request(), Arc::new(Fail)).await.unwrap();
            assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        }

        let resp = mw.handle(make_request(), Arc::new(Fail)).await.unwrap();
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        let body = String::from_utf8(resp.body_bytes().unwrap().to_vec()).unwrap();
        assert!(body.contains("service temporarily unavailable"));
    }
}
