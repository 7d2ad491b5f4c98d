use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::HeaderValue;
use hyper::{HeaderMap, Method, StatusCode, Uri};
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;
use crate::core::pipeline::{Middleware, MiddlewareHandler};
use crate::core::request::GatewayRequest;
use crate::core::response::{GatewayResponse, ResponseBody};
use crate::error::GatewayError;

/// A stored response. Fresh while `now - created_at < ttl`.
#[derive(Debug, Clone)]
struct CacheEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }
}

/// Per-route keyed response store. Readers share the lock; writers are
/// serialized per cache. Concurrent misses for one key may both compute and
/// write; last writer wins.
pub struct ResponseCache {
    config: CacheConfig,
    store: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Key = SHA-256(method ∥ full URL with query), hex-encoded.
    pub fn key(method: &Method, uri: &Uri) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(uri.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn cacheable_method(&self, method: &Method) -> bool {
        self.config
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<CacheEntry> {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let entry = store.get(key).filter(|e| e.is_fresh(now)).cloned();

        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    fn put_at(
        &self,
        key: String,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        now: Instant,
    ) {
        let entry = CacheEntry {
            status,
            headers,
            body,
            created_at: now,
            ttl: self.config.ttl,
        };
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.insert(key, entry);
    }

    pub fn clear(&self) {
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self
                .store
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Named caches, one per route; survives configuration reloads.
pub struct CacheManager {
    caches: RwLock<HashMap<String, Arc<ResponseCache>>>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str, config: &CacheConfig) -> Arc<ResponseCache> {
        {
            let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cache) = caches.get(name) {
                return Arc::clone(cache);
            }
        }

        let mut caches = self.caches.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            caches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ResponseCache::new(config.clone()))),
        )
    }

    pub fn clear(&self, name: &str) -> bool {
        let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
        match caches.get(name) {
            Some(cache) => {
                cache.clear();
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&self) {
        let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
        for cache in caches.values() {
            cache.clear();
        }
    }

    pub fn stats(&self) -> HashMap<String, CacheStats> {
        let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
        caches
            .iter()
            .map(|(name, cache)| (name.clone(), cache.stats()))
            .collect()
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves fresh cached responses without invoking inner layers; captures
/// 200 responses on the way out.
pub struct CacheMiddleware {
    cache: Arc<ResponseCache>,
}

impl CacheMiddleware {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    async fn handle(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        if !self.cache.cacheable_method(&request.method) {
            return next.handle(request).await;
        }

        let key = ResponseCache::key(&request.method, &request.uri);

        if let Some(entry) = self.cache.get_at(&key, Instant::now()) {
            let mut headers = entry.headers;
            headers.insert("X-Cache", HeaderValue::from_static("HIT"));
            return Ok(GatewayResponse::new(entry.status, headers, entry.body));
        }

        let resp = next.handle(request).await?;

        if resp.status == StatusCode::OK {
            if let ResponseBody::Full(body) = &resp.body {
                self.cache.put_at(
                    key,
                    resp.status,
                    resp.headers.clone(),
                    body.clone(),
                    Instant::now(),
                );
            }
        }

        Ok(resp)
    }

    fn name(&self) -> &str {
        "cache"
    }
}
