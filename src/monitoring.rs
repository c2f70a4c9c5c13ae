use crate::leaf_cache::{LeafCacheMetrics, LeafCertificateCache};
use log::info;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Process-wide request counters shared by every connection task.
pub struct ProxyStatistics {
    total_requests: AtomicU64,
    http_requests: AtomicU64,
    https_requests: AtomicU64,
    intercepted_requests: AtomicU64,
    headers_injected: AtomicU64,
    errors: AtomicU64,
    tunnels_active: AtomicU64,
    started: Instant,
}

impl ProxyStatistics {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
            https_requests: AtomicU64::new(0),
            intercepted_requests: AtomicU64::new(0),
            headers_injected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            tunnels_active: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// A plain request that was forwarded to its origin.
    pub fn record_http_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A CONNECT request that was accepted.
    pub fn record_https_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.https_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A request decrypted inside an intercepted tunnel.
    pub fn record_intercepted_request(&self) {
        self.intercepted_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_headers_injected(&self, count: u64) {
        if count > 0 {
            self.headers_injected.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_opened(&self) {
        self.tunnels_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        let _ = self
            .tunnels_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            http_requests: self.http_requests.load(Ordering::Relaxed),
            https_requests: self.https_requests.load(Ordering::Relaxed),
            intercepted_requests: self.intercepted_requests.load(Ordering::Relaxed),
            headers_injected: self.headers_injected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            tunnels_active: self.tunnels_active.load(Ordering::Relaxed),
            leaf_cache_hits: 0,
            leaf_cache_misses: 0,
            leaf_cache_entries: 0,
            uptime_secs: self.uptime().as_secs(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

impl Default for ProxyStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub http_requests: u64,
    pub https_requests: u64,
    pub intercepted_requests: u64,
    pub headers_injected: u64,
    pub errors: u64,
    pub tunnels_active: u64,
    pub leaf_cache_hits: u64,
    pub leaf_cache_misses: u64,
    pub leaf_cache_entries: u64,
    pub uptime_secs: u64,
    pub timestamp: u64,
}

impl StatsSnapshot {
    pub fn with_leaf_cache(mut self, metrics: LeafCacheMetrics) -> Self {
        self.leaf_cache_hits = metrics.hits;
        self.leaf_cache_misses = metrics.misses;
        self.leaf_cache_entries = metrics.entries as u64;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn summary_line(&self) -> String {
        format!(
            "requests={} http={} https={} intercepted={} headers_injected={} errors={} tunnels_active={} leaf_hits={} leaf_misses={} leaf_entries={} uptime={}s",
            self.total_requests,
            self.http_requests,
            self.https_requests,
            self.intercepted_requests,
            self.headers_injected,
            self.errors,
            self.tunnels_active,
            self.leaf_cache_hits,
            self.leaf_cache_misses,
            self.leaf_cache_entries,
            self.uptime_secs
        )
    }
}

/// Request counters together with the leaf cache figures.
pub fn proxy_snapshot(stats: &ProxyStatistics, cache: &LeafCertificateCache) -> StatsSnapshot {
    stats.snapshot().with_leaf_cache(cache.metrics())
}

/// Log a statistics line every `interval` until `shutdown` fires.
pub fn spawn_reporter(
    stats: Arc<ProxyStatistics>,
    cache: Arc<LeafCertificateCache>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = proxy_snapshot(&stats, &cache);
                    if snapshot.total_requests > 0 {
                        info!("Stats: {}", snapshot.summary_line());
                    }
                }
            }
        }
    })
}

pub fn log_final(stats: &ProxyStatistics, cache: &LeafCertificateCache) {
    info!("Final stats: {}", proxy_snapshot(stats, cache).summary_line());
}
