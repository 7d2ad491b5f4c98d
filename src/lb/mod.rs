use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{LoadBalancingConfig, Strategy, Upstream};
use crate::error::LoadBalancerError;

/// Request failures on one upstream before it is marked unhealthy.
const FAILURE_THRESHOLD: u32 = 3;

/// Outcome of a proxied request, reported back through the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Runtime mirror of one configured upstream.
#[derive(Debug)]
pub struct UpstreamState {
    url: Url,
    weight: u32,
    health_check: Option<String>,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    active_connections: AtomicI64,
    total_requests: AtomicU64,
    last_check: Mutex<Instant>,
}

impl UpstreamState {
    fn new(upstream: &Upstream) -> Result<Self, LoadBalancerError> {
        let url = Url::parse(&upstream.url).map_err(|e| {
            LoadBalancerError::InvalidUpstreamUrl(upstream.url.clone(), e.to_string())
        })?;

        Ok(Self {
            url,
            weight: if upstream.weight == 0 {
                100
            } else {
                upstream.weight
            },
            health_check: upstream.health_check.clone(),
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            active_connections: AtomicI64::new(0),
            total_requests: AtomicU64::new(0),
            last_check: Mutex::new(Instant::now()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// URL of the probe target: the configured health-check path, or the
    /// upstream root.
    fn probe_url(&self) -> Url {
        match &self.health_check {
            Some(path) => {
                let mut url = self.url.clone();
                url.set_path(path);
                url
            }
            None => self.url.clone(),
        }
    }

    fn mark_healthy(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if !self.healthy.swap(true, Ordering::AcqRel) {
            info!(upstream = %self.url, "upstream recovered and marked healthy");
        }
    }

    fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            warn!(upstream = %self.url, "upstream marked unhealthy");
        }
    }

    fn record_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.mark_healthy(),
            Outcome::Failure => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= FAILURE_THRESHOLD {
                    self.mark_unhealthy();
                }
            }
        }
    }

    fn snapshot(&self) -> UpstreamStats {
        UpstreamStats {
            url: self.url.to_string(),
            healthy: self.is_healthy(),
            active_connections: self.active_connections(),
            total_requests: self.total_requests.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStats {
    pub url: String,
    pub healthy: bool,
    pub active_connections: i64,
    pub total_requests: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub strategy: &'static str,
    pub total_upstreams: usize,
    pub healthy_upstreams: usize,
    pub upstreams: Vec<UpstreamStats>,
}

/// Token held while a request uses a selected upstream. Releasing it with
/// the request outcome updates the connection and failure counters; a
/// dropped lease still returns its connection slot.
#[derive(Debug)]
pub struct Lease {
    upstream: Arc<UpstreamState>,
    released: bool,
}

impl Lease {
    fn new(upstream: Arc<UpstreamState>) -> Self {
        upstream.active_connections.fetch_add(1, Ordering::AcqRel);
        Self {
            upstream,
            released: false,
        }
    }

    pub fn url(&self) -> &Url {
        self.upstream.url()
    }

    pub fn release(mut self, outcome: Outcome) {
        self.released = true;
        self.upstream
            .active_connections
            .fetch_sub(1, Ordering::AcqRel);
        self.upstream.total_requests.fetch_add(1, Ordering::AcqRel);
        self.upstream.record_outcome(outcome);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.upstream
                .active_connections
                .fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Upstream pool for one route: per-request selection by strategy plus an
/// active health probe task. The probe holds only a weak reference, so the
/// task winds down when the route is retired.
pub struct LoadBalancer {
    upstreams: Vec<Arc<UpstreamState>>,
    strategy: Strategy,
    cursor: AtomicUsize,
    health_interval: Duration,
    health_timeout: Duration,
    probe_client: reqwest::Client,
    stop_tx: watch::Sender<bool>,
}

impl LoadBalancer {
    pub fn new(
        upstreams: &[Upstream],
        config: &LoadBalancingConfig,
    ) -> Result<Arc<Self>, LoadBalancerError> {
        if upstreams.is_empty() {
            return Err(LoadBalancerError::NoUpstreams);
        }

        let states = upstreams
            .iter()
            .map(UpstreamState::new)
            .map(|r| r.map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let probe_client = reqwest::Client::builder()
            .timeout(config.health_check_timeout)
            .connect_timeout(config.health_check_timeout)
            .build()
            .map_err(|e| LoadBalancerError::ProbeClient(e.to_string()))?;

        let (stop_tx, stop_rx) = watch::channel(false);

        let lb = Arc::new(Self {
            upstreams: states,
            strategy: config.strategy,
            cursor: AtomicUsize::new(0),
            health_interval: config.health_check_interval,
            health_timeout: config.health_check_timeout,
            probe_client,
            stop_tx,
        });

        Self::spawn_probe(Arc::downgrade(&lb), stop_rx);

        Ok(lb)
    }

    /// Select an upstream for this request. Only healthy upstreams are
    /// considered; when none are healthy the full set is used so a retry
    /// remains possible.
    pub fn select(&self, client_ip: IpAddr) -> Lease {
        let mut pool: Vec<Arc<UpstreamState>> = self
            .upstreams
            .iter()
            .filter(|u| u.is_healthy())
            .cloned()
            .collect();
        if pool.is_empty() {
            debug!("no healthy upstreams, selecting from full set");
            pool = self.upstreams.clone();
        }

        let chosen = match self.strategy {
            Strategy::RoundRobin => self.round_robin(&pool),
            Strategy::Weighted => self.weighted(&pool),
            Strategy::LeastConnections => Self::least_connections(&pool),
            Strategy::IpHash => Self::ip_hash(&pool, client_ip),
        };

        Lease::new(chosen)
    }

    fn round_robin(&self, pool: &[Arc<UpstreamState>]) -> Arc<UpstreamState> {
        let index = self.cursor.fetch_add(1, Ordering::AcqRel);
        Arc::clone(&pool[index % pool.len()])
    }

    /// Smoothed weighted selection: walk the pool accumulating weights
    /// until the rotating target index is covered.
    fn weighted(&self, pool: &[Arc<UpstreamState>]) -> Arc<UpstreamState> {
        let total: usize = pool.iter().map(|u| u.weight as usize).sum();
        if total == 0 {
            return self.round_robin(pool);
        }

        let target = self.cursor.fetch_add(1, Ordering::AcqRel) % total;

        let mut acc = 0usize;
        for upstream in pool {
            acc += upstream.weight as usize;
            if acc > target {
                return Arc::clone(upstream);
            }
        }

        Arc::clone(&pool[0])
    }

    fn least_connections(pool: &[Arc<UpstreamState>]) -> Arc<UpstreamState> {
        let mut selected = &pool[0];
        let mut min = selected.active_connections();

        for upstream in &pool[1..] {
            let conns = upstream.active_connections();
            if conns < min {
                min = conns;
                selected = upstream;
            }
        }

        Arc::clone(selected)
    }

    fn ip_hash(pool: &[Arc<UpstreamState>], client_ip: IpAddr) -> Arc<UpstreamState> {
        let hash = hash_ip(&client_ip.to_string());
        Arc::clone(&pool[(hash as usize) % pool.len()])
    }

    /// Signal the health probe task to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let upstreams: Vec<UpstreamStats> =
            self.upstreams.iter().map(|u| u.snapshot()).collect();
        let healthy = upstreams.iter().filter(|u| u.healthy).count();

        LoadBalancerStats {
            strategy: strategy_name(self.strategy),
            total_upstreams: upstreams.len(),
            healthy_upstreams: healthy,
            upstreams,
        }
    }

    fn spawn_probe(lb: Weak<LoadBalancer>, mut stop_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let interval = match lb.upgrade() {
                Some(lb) => lb.health_interval,
                None => return,
            };
            if interval.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so freshly created
            // routes are not probed before upstreams finish starting.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            debug!("health probe stopping");
                            return;
                        }
                        continue;
                    }
                }

                let Some(lb) = lb.upgrade() else { return };
                lb.probe_all().await;
            }
        });
    }

    async fn probe_all(&self) {
        let mut probes = Vec::with_capacity(self.upstreams.len());
        for upstream in &self.upstreams {
            let upstream = Arc::clone(upstream);
            let client = self.probe_client.clone();
            let timeout = self.health_timeout;
            probes.push(tokio::spawn(async move {
                probe_upstream(&client, &upstream, timeout).await;
            }));
        }
        for probe in probes {
            let _ = probe.await;
        }
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn probe_upstream(client: &reqwest::Client, upstream: &UpstreamState, timeout: Duration) {
    let url = upstream.probe_url();
    let result = client.get(url.clone()).timeout(timeout).send().await;

    let healthy = match result {
        Ok(resp) => probe_ok(resp.status().as_u16()),
        Err(e) => {
            debug!(upstream = %url, error = %e, "health probe failed");
            false
        }
    };

    if healthy {
        upstream.mark_healthy();
    } else {
        upstream.mark_unhealthy();
    }

    if let Ok(mut last) = upstream.last_check.lock() {
        *last = Instant::now();
    }
}

/// 2xx and 3xx responses count as healthy.
fn probe_ok(status: u16) -> bool {
    (200..400).contains(&status)
}

/// h = h*31 + c over the IP string bytes.
fn hash_ip(ip: &str) -> u32 {
    let mut h: u32 = 0;
    for c in ip.bytes() {
        h = h.wrapping_mul(31).wrapping_add(u32::from(c));
    }
    h
}

fn strategy_name(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::RoundRobin => "round_robin",
        Strategy::Weighted => "weighted",
        Strategy::LeastConnections => "least_connections",
        Strategy::IpHash => "ip_hash",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn upstream(url: &str, weight: u32) -> Upstream {
        Upstream {
            url: url.to_string(),
            weight,
            health_check: None,
        }
    }

    fn config(strategy: Strategy) -> LoadBalancingConfig {
        LoadBalancingConfig {
            strategy,
            health_check_interval: Duration::from_secs(3600),
            health_check_timeout: Duration::from_secs(1),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn construction_fails_without_upstreams() {
        assert!(matches!(
            LoadBalancer::new(&[], &config(Strategy::RoundRobin)),
            Err(LoadBalancerError::NoUpstreams)
        ));
    }

    #[tokio::test]
    async fn round_robin_cycles() {
        let lb = LoadBalancer::new(
            &[
                upstream("http://a:1", 0),
                upstream("http://b:1", 0),
                upstream("http://c:1", 0),
            ],
            &config(Strategy::RoundRobin),
        )
        .unwrap();

        let picks: Vec<String> = (0..6)
            .map(|_| {
                let lease = lb.select(ip("10.0.0.1"));
                let url = lease.url().to_string();
                lease.release(Outcome::Success);
                url
            })
            .collect();

        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
        assert_ne!(picks[0], picks[1]);
        assert_ne!(picks[1], picks[2]);
    }

    #[tokio::test]
    async fn weighted_split_follows_weights() {
        let lb = LoadBalancer::new(
            &[upstream("http://a:1", 70), upstream("http://b:1", 30)],
            &config(Strategy::Weighted),
        )
        .unwrap();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..1000 {
            let lease = lb.select(ip("10.0.0.1"));
            *counts.entry(lease.url().to_string()).or_default() += 1;
            lease.release(Outcome::Success);
        }

        // The cursor walk is exact over whole cycles of the total weight.
        assert_eq!(counts["http://a:1/"], 700);
        assert_eq!(counts["http://b:1/"], 300);
    }

    #[tokio::test]
    async fn least_connections_prefers_idle_and_breaks_ties_by_order() {
        let lb = LoadBalancer::new(
            &[upstream("http://a:1", 0), upstream("http://b:1", 0)],
            &config(Strategy::LeastConnections),
        )
        .unwrap();

        // Tie: first-declared wins.
        let first = lb.select(ip("10.0.0.1"));
        assert_eq!(first.url().as_str(), "http://a:1/");

        // a now has one active connection, so b is picked.
        let second = lb.select(ip("10.0.0.1"));
        assert_eq!(second.url().as_str(), "http://b:1/");

        first.release(Outcome::Success);
        second.release(Outcome::Success);
    }

    #[tokio::test]
    async fn ip_hash_is_deterministic_per_ip() {
        let lb = LoadBalancer::new(
            &[
                upstream("http://a:1", 0),
                upstream("http://b:1", 0),
                upstream("http://c:1", 0),
            ],
            &config(Strategy::IpHash),
        )
        .unwrap();

        let pick = |addr: &str| {
            let lease = lb.select(ip(addr));
            let url = lease.url().to_string();
            lease.release(Outcome::Success);
            url
        };

        let first = pick("192.168.0.7");
        for _ in 0..10 {
            assert_eq!(pick("192.168.0.7"), first);
        }
    }

    #[test]
    fn hash_matches_reference_algorithm() {
        // "a" = 97, "ab" = 97*31 + 98
        assert_eq!(hash_ip("a"), 97);
        assert_eq!(hash_ip("ab"), 97 * 31 + 98);
    }

    #[test]
    fn probe_status_window() {
        assert!(probe_ok(200));
        assert!(probe_ok(204));
        assert!(probe_ok(301));
        assert!(probe_ok(399));
        assert!(!probe_ok(400));
        assert!(!probe_ok(500));
        assert!(!probe_ok(199));
    }

    #[tokio::test]
    async fn three_failures_mark_unhealthy_and_success_revives() {
        let lb = LoadBalancer::new(
            &[upstream("http://a:1", 0), upstream("http://b:1", 0)],
            &config(Strategy::RoundRobin),
        )
        .unwrap();

        // Fail upstream "a" three times.
        let mut failed = 0;
        while failed < 3 {
            let lease = lb.select(ip("10.0.0.1"));
            if lease.url().as_str() == "http://a:1/" {
                lease.release(Outcome::Failure);
                failed += 1;
            } else {
                lease.release(Outcome::Success);
            }
        }

        let stats = lb.stats();
        let a = stats
            .upstreams
            .iter()
            .find(|u| u.url == "http://a:1/")
            .unwrap();
        assert!(!a.healthy);
        assert_eq!(stats.healthy_upstreams, 1);

        // Selection now only yields b.
        for _ in 0..4 {
            let lease = lb.select(ip("10.0.0.1"));
            assert_eq!(lease.url().as_str(), "http://b:1/");
            lease.release(Outcome::Success);
        }
    }

    #[tokio::test]
    async fn all_unhealthy_still_selects_from_full_set() {
        let lb = LoadBalancer::new(
            &[upstream("http://a:1", 0)],
            &config(Strategy::RoundRobin),
        )
        .unwrap();

        for _ in 0..3 {
            lb.select(ip("10.0.0.1")).release(Outcome::Failure);
        }
        assert_eq!(lb.stats().healthy_upstreams, 0);

        // Degraded mode: the lone unhealthy upstream is still returned.
        let lease = lb.select(ip("10.0.0.1"));
        assert_eq!(lease.url().as_str(), "http://a:1/");

        // A success revives it.
        lease.release(Outcome::Success);
        assert_eq!(lb.stats().healthy_upstreams, 1);
    }

    #[tokio::test]
    async fn active_connections_return_to_zero() {
        let lb = LoadBalancer::new(
            &[upstream("http://a:1", 0)],
            &config(Strategy::RoundRobin),
        )
        .unwrap();

        let a = lb.select(ip("10.0.0.1"));
        let b = lb.select(ip("10.0.0.1"));
        assert_eq!(lb.stats().upstreams[0].active_connections, 2);

        a.release(Outcome::Success);
        drop(b); // dropped without release still frees the slot
        assert_eq!(lb.stats().upstreams[0].active_connections, 0);
        assert_eq!(lb.stats().upstreams[0].total_requests, 1);
    }
}
