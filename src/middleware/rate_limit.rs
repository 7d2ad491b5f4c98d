use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use tracing::debug;

use crate::config::{RateLimitConfig, RateLimitKey};
use crate::core::pipeline::{Middleware, MiddlewareHandler};
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;

/// How long an untouched bucket survives before the sweeper drops it.
const BUCKET_IDLE_EVICTION: Duration = Duration::from_secs(600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One token bucket. Refill happens on demand from elapsed wall time,
/// clamped to the burst capacity.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            rate,
            burst,
            last_refill: now,
            last_used: now,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
        self.last_used = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Process-wide bucket store, keyed by (scope, client key). Scope is the
/// route name, or "global" for the gateway-wide limiter. Buckets are created
/// lazily and evicted after sitting idle.
pub struct RateLimiterRegistry {
    buckets: RwLock<HashMap<(String, String), Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn the idle-bucket sweeper; memory stays bounded for
    /// high-cardinality keys over long uptimes.
    pub fn spawn_sweeper(self: Arc<Self>) {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = registry.sweep(Instant::now(), BUCKET_IDLE_EVICTION);
                if removed > 0 {
                    debug!(removed, "evicted idle rate-limit buckets");
                }
            }
        });
    }

    fn sweep(&self, now: Instant, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket
                .lock()
                .map(|b| now.saturating_duration_since(b.last_used) < max_idle)
                .unwrap_or(false)
        });
        before - buckets.len()
    }

    fn bucket(
        &self,
        scope: &str,
        key: &str,
        rate: f64,
        burst: f64,
        now: Instant,
    ) -> Arc<Mutex<TokenBucket>> {
        {
            let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bucket) = buckets.get(&(scope.to_string(), key.to_string())) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            buckets
                .entry((scope.to_string(), key.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(rate, burst, now)))),
        )
    }

    fn allow(&self, scope: &str, key: &str, rate: f64, burst: f64, now: Instant) -> bool {
        let bucket = self.bucket(scope, key, rate, burst, now);
        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.try_acquire(now)
    }

    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Token-bucket admission middleware.
pub struct RateLimitMiddleware {
    scope: String,
    config: RateLimitConfig,
    registry: Arc<RateLimiterRegistry>,
}

impl RateLimitMiddleware {
    pub fn new(scope: &str, config: RateLimitConfig, registry: Arc<RateLimiterRegistry>) -> Self {
        Self {
            scope: scope.to_string(),
            config,
            registry,
        }
    }

    fn key_for(&self, request: &GatewayRequest) -> String {
        match self.config.by {
            RateLimitKey::ClientId => request
                .header("X-Client-ID")
                .unwrap_or_else(|| request.client_ip().to_string()),
            RateLimitKey::Ip => request.client_ip().to_string(),
        }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        if !self.config.enabled {
            return next.handle(request).await;
        }

        let key = self.key_for(&request);
        let allowed = self.registry.allow(
            &self.scope,
            &key,
            f64::from(self.config.requests_per_second),
            f64::from(self.config.burst),
            Instant::now(),
        );

        if !allowed {
            let reset = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                + 1;

            let mut resp =
                GatewayResponse::error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            resp.headers.insert(
                "X-RateLimit-Limit",
                HeaderValue::from_str(&self.config.requests_per_second.to_string())
                    .expect("numeric header value"),
            );
            resp.headers
                .insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
            resp.headers.insert(
                "X-RateLimit-Reset",
                HeaderValue::from_str(&reset.to_string()).expect("numeric header value"),
            );
            return Ok(resp);
        }

        next.handle(request).await
    }

    fn name(&self) -> &str {
        "rate_limit"
    }
}
