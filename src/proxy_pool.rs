use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::utils::error::{client_setup_error, AppError, Result};

/// Attempts a proxy needs before its success rate can get it evicted.
const MIN_ATTEMPTS_FOR_EVICTION: u64 = 5;
/// Selection picks uniformly among this many best-scoring proxies.
const TOP_CANDIDATES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Available,
    Cooldown,
    Removed,
}

#[derive(Debug, Clone)]
pub struct ProxyRecord {
    pub address: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<Instant>,
    pub state: ProxyState,
}

impl ProxyRecord {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            success_count: 0,
            failure_count: 0,
            // New proxies are trusted until proven otherwise
            success_rate: 1.0,
            last_failure_at: None,
            cooldown_until: None,
            state: ProxyState::Available,
        }
    }

    pub fn attempts(&self) -> u64 {
        self.success_count + self.failure_count
    }

    fn is_live(&self) -> bool {
        self.state != ProxyState::Removed
    }

    fn recompute_rate(&mut self) {
        let total = self.attempts();
        if total > 0 {
            self.success_rate = self.success_count as f64 / total as f64;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStats {
    pub address: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_ms: Option<u64>,
    pub state: ProxyState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPoolMetrics {
    pub total_proxies: usize,
    pub available_count: usize,
    pub removed_count: usize,
    pub total_requests: u64,
    pub aggregate_success_rate: f64,
    pub per_proxy: Vec<ProxyStats>,
}

#[derive(Default)]
struct PoolInner {
    // Evicted proxies stay here as `Removed` so they are reported and never re-added
    records: Vec<ProxyRecord>,
}

impl PoolInner {
    /// Ends elapsed cooldowns and permanently evicts proxies below the success floor.
    fn refresh(&mut self, now: Instant, min_success_rate: f64) {
        for record in self.records.iter_mut() {
            if record.state == ProxyState::Cooldown && record.cooldown_until.is_some_and(|until| now > until) {
                record.state = ProxyState::Available;
                record.cooldown_until = None;
                debug!("Proxy {} left cooldown", record.address);
            }
        }

        for record in self.records.iter_mut().filter(|r| r.is_live()) {
            if record.attempts() >= MIN_ATTEMPTS_FOR_EVICTION && record.success_rate < min_success_rate {
                warn!(
                    "Removing proxy {} for low success rate: {:.2} over {} attempts",
                    record.address,
                    record.success_rate,
                    record.attempts()
                );
                record.state = ProxyState::Removed;
                record.cooldown_until = None;
            }
        }
    }

    fn live(&self) -> impl Iterator<Item = &ProxyRecord> {
        self.records.iter().filter(|r| r.is_live())
    }

    fn find_live_mut(&mut self, address: &str) -> Option<&mut ProxyRecord> {
        self.records.iter_mut().find(|r| r.is_live() && r.address == address)
    }

    fn knows(&self, address: &str) -> bool {
        self.records.iter().any(|r| r.address == address)
    }
}

/// Shared egress proxy set with success telemetry, cooldown and scored selection.
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
    test_url: String,
    min_success_rate: f64,
    cooldown: Duration,
    test_timeout: Duration,
}

impl ProxyPool {
    pub fn new(proxies: Vec<String>, config: &ProxyConfig) -> Self {
        let mut inner = PoolInner::default();
        for address in proxies {
            let address = address.trim();
            if address.is_empty() || inner.knows(address) {
                continue;
            }
            inner.records.push(ProxyRecord::new(address));
        }

        if !inner.records.is_empty() {
            info!("Proxy pool initialized with {} proxies", inner.records.len());
        }

        Self {
            inner: Mutex::new(inner),
            test_url: config.test_url.clone(),
            min_success_rate: config.min_success_rate,
            cooldown: config.cooldown(),
            test_timeout: config.test_timeout(),
        }
    }

    /// `None` when proxying is disabled or no proxies are configured.
    pub fn from_config(config: &ProxyConfig) -> Option<Self> {
        if !config.enabled || config.proxies.is_empty() {
            return None;
        }
        Some(Self::new(config.proxies.clone(), config))
    }

    /// Picks a proxy for the next session.
    ///
    /// Ranks available proxies by success rate and picks uniformly among the top three.
    /// When every proxy is cooling down, any proxy is returned rather than none.
    pub async fn select(&self) -> Option<String> {
        let mut inner = self.inner.lock().await;
        inner.refresh(Instant::now(), self.min_success_rate);

        let live: Vec<&ProxyRecord> = inner.live().collect();
        if live.is_empty() {
            return None;
        }

        let mut available: Vec<&ProxyRecord> = live
            .iter()
            .copied()
            .filter(|r| r.state == ProxyState::Available)
            .collect();

        if available.is_empty() {
            warn!("No proxy available outside cooldown, picking any");
            return live.choose(&mut rand::thread_rng()).map(|r| r.address.clone());
        }

        available.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        let top = available.len().min(TOP_CANDIDATES);
        let selected = available[..top].choose(&mut rand::thread_rng())?;

        debug!("Selected proxy {} (rate {:.2})", selected.address, selected.success_rate);
        Some(selected.address.clone())
    }

    pub async fn report_success(&self, address: &str) {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.find_live_mut(address) else {
            debug!("Ignoring success report for unknown proxy {}", address);
            return;
        };

        record.success_count += 1;
        record.recompute_rate();
        metrics::counter!("adprice_proxy_reports_total", "result" => "success").increment(1);
        debug!("Proxy {} succeeded, rate {:.2}", address, record.success_rate);
    }

    pub async fn report_failure(&self, address: &str) {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.find_live_mut(address) else {
            debug!("Ignoring failure report for unknown proxy {}", address);
            return;
        };

        record.failure_count += 1;
        record.recompute_rate();
        record.last_failure_at = Some(Utc::now());
        record.cooldown_until = Some(Instant::now() + self.cooldown);
        record.state = ProxyState::Cooldown;
        metrics::counter!("adprice_proxy_reports_total", "result" => "failure").increment(1);
        warn!(
            "Proxy {} failed, rate {:.2}, cooling down for {}s",
            address,
            record.success_rate,
            self.cooldown.as_secs()
        );
    }

    /// Adds a proxy, optionally checking it against the test URL first.
    ///
    /// Refuses duplicates and proxies evicted earlier from this pool.
    pub async fn add(&self, address: &str, test: bool) -> bool {
        let address = address.trim();
        if address.is_empty() || self.inner.lock().await.knows(address) {
            return false;
        }

        if test {
            if let Err(e) = self.test_proxy(address).await {
                warn!("New proxy failed its check: {}", e);
                return false;
            }
        }

        let mut inner = self.inner.lock().await;
        // Another task may have added it while we were testing
        if inner.knows(address) {
            return false;
        }
        inner.records.push(ProxyRecord::new(address));
        info!("Proxy added: {}", address);
        true
    }

    async fn test_proxy(&self, address: &str) -> Result<()> {
        let proxy_err = |message: String| AppError::Proxy {
            proxy: address.to_string(),
            message,
        };

        debug!("Testing proxy {}", address);
        let proxy = reqwest::Proxy::all(address).map_err(|e| proxy_err(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.test_timeout)
            .build()
            .map_err(client_setup_error)?;

        client
            .get(&self.test_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| proxy_err(e.to_string()))?;

        debug!("Proxy {} passed its check", address);
        Ok(())
    }

    pub async fn metrics(&self) -> ProxyPoolMetrics {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.refresh(now, self.min_success_rate);

        let total_success: u64 = inner.records.iter().map(|r| r.success_count).sum();
        let total_failure: u64 = inner.records.iter().map(|r| r.failure_count).sum();
        let total_requests = total_success + total_failure;
        let aggregate_success_rate = if total_requests > 0 {
            total_success as f64 / total_requests as f64
        } else {
            0.0
        };

        let per_proxy = inner
            .records
            .iter()
            .map(|r| ProxyStats {
                address: r.address.clone(),
                success_count: r.success_count,
                failure_count: r.failure_count,
                success_rate: r.success_rate,
                last_failure_at: r.last_failure_at,
                cooldown_remaining_ms: r
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64),
                state: r.state,
            })
            .collect::<Vec<_>>();

        let removed_count = per_proxy.iter().filter(|p| p.state == ProxyState::Removed).count();

        ProxyPoolMetrics {
            total_proxies: per_proxy.len() - removed_count,
            available_count: per_proxy.iter().filter(|p| p.state == ProxyState::Available).count(),
            removed_count,
            total_requests,
            aggregate_success_rate,
            per_proxy,
        }
    }

    /// Forgets all telemetry for the surviving proxies. Evictions stay in effect.
    pub async fn reset_stats(&self) {
        let mut inner = self.inner.lock().await;
        for record in inner.records.iter_mut().filter(|r| r.is_live()) {
            *record = ProxyRecord::new(&record.address);
        }
        info!("Proxy statistics reset");
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.live().count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            enabled: true,
            proxies: vec![],
            test_url: "http://127.0.0.1:9/".to_string(),
            min_success_rate: 0.5,
            cooldown: 60,
            test_timeout: 1,
        }
    }

    fn pool(addresses: &[&str]) -> ProxyPool {
        ProxyPool::new(addresses.iter().map(|a| a.to_string()).collect(), &test_config())
    }

    async fn selection_counts(pool: &ProxyPool, rounds: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..rounds {
            if let Some(address) = pool.select().await {
                *counts.entry(address).or_insert(0) += 1;
            }
        }
        counts
    }

    #[tokio::test]
    async fn test_empty_pool_selects_nothing() {
        let pool = pool(&[]);
        assert!(pool.select().await.is_none());
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicates_ignored_on_init() {
        let pool = pool(&["http://a:1", "http://a:1", " ", "http://b:1"]);
        assert_eq!(pool.len().await, 2);
    }

    #[test]
    fn test_from_config_requires_enabled_and_proxies() {
        let mut config = test_config();
        assert!(ProxyPool::from_config(&config).is_none());

        config.proxies = vec!["http://a:1".to_string()];
        assert!(ProxyPool::from_config(&config).is_some());

        config.enabled = false;
        assert!(ProxyPool::from_config(&config).is_none());
    }

    #[tokio::test]
    async fn test_success_rate_recomputed() {
        let pool = pool(&["http://a:1"]);
        pool.report_success("http://a:1").await;
        pool.report_success("http://a:1").await;
        pool.report_success("http://a:1").await;
        pool.report_failure("http://a:1").await;

        let metrics = pool.metrics().await;
        let stats = &metrics.per_proxy[0];
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.failure_count, 1);
        assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.state, ProxyState::Cooldown);
        assert!(stats.last_failure_at.is_some());
        assert_eq!(metrics.total_requests, 4);
        assert!((metrics.aggregate_success_rate - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unknown_proxy_reports_ignored() {
        let pool = pool(&["http://a:1"]);
        pool.report_failure("http://nope:1").await;
        pool.report_success("http://nope:1").await;
        assert_eq!(pool.metrics().await.total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_excludes_until_strictly_elapsed() {
        let pool = pool(&["http://a:1", "http://b:1"]);
        pool.report_failure("http://a:1").await;

        let counts = selection_counts(&pool, 50).await;
        assert_eq!(counts.get("http://b:1"), Some(&50));

        // Exactly at the cooldown boundary the proxy is still excluded
        tokio::time::advance(Duration::from_secs(60)).await;
        let counts = selection_counts(&pool, 50).await;
        assert_eq!(counts.get("http://a:1"), None);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(pool.metrics().await.available_count, 2);
        let counts = selection_counts(&pool, 200).await;
        assert!(counts.get("http://a:1").copied().unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn test_all_in_cooldown_still_returns_a_proxy() {
        let pool = pool(&["http://a:1", "http://b:1"]);
        pool.report_failure("http://a:1").await;
        pool.report_failure("http://b:1").await;

        let selected = pool.select().await;
        assert!(matches!(selected.as_deref(), Some("http://a:1") | Some("http://b:1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_success_proxy_permanently_removed() {
        let pool = pool(&["http://bad:1", "http://good:1"]);
        pool.report_success("http://bad:1").await;
        for _ in 0..4 {
            pool.report_failure("http://bad:1").await;
        }

        tokio::time::advance(Duration::from_secs(120)).await;
        let counts = selection_counts(&pool, 50).await;
        assert_eq!(counts.get("http://bad:1"), None);

        let metrics = pool.metrics().await;
        assert_eq!(metrics.total_proxies, 1);
        assert_eq!(metrics.removed_count, 1);
        let bad = metrics.per_proxy.iter().find(|p| p.address == "http://bad:1").unwrap();
        assert_eq!(bad.state, ProxyState::Removed);
        assert_eq!(bad.failure_count, 4);
        assert_eq!(bad.cooldown_remaining_ms, None);

        // Reports for an evicted proxy change nothing
        pool.report_success("http://bad:1").await;
        let metrics = pool.metrics().await;
        let bad = metrics.per_proxy.iter().find(|p| p.address == "http://bad:1").unwrap();
        assert_eq!(bad.success_count, 1);
        assert_eq!(bad.state, ProxyState::Removed);

        // No way back in
        assert!(!pool.add("http://bad:1", false).await);
        pool.reset_stats().await;
        let counts = selection_counts(&pool, 50).await;
        assert_eq!(counts.get("http://bad:1"), None);
        assert_eq!(pool.metrics().await.removed_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_eviction_before_minimum_attempts() {
        let pool = pool(&["http://flaky:1"]);
        for _ in 0..4 {
            pool.report_failure("http://flaky:1").await;
        }

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(pool.select().await.as_deref(), Some("http://flaky:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_limited_to_top_three() {
        let pool = pool(&["http://a:1", "http://b:1", "http://c:1", "http://d:1", "http://e:1"]);
        for address in ["http://a:1", "http://b:1", "http://c:1"] {
            pool.report_success(address).await;
        }
        for address in ["http://d:1", "http://e:1"] {
            pool.report_success(address).await;
            pool.report_failure(address).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let counts = selection_counts(&pool, 300).await;
        assert!(!counts.contains_key("http://d:1"));
        assert!(!counts.contains_key("http://e:1"));
        // Spread across the top candidates rather than herding onto one
        assert_eq!(counts.len(), 3);
    }

    #[tokio::test]
    async fn test_add_without_test() {
        let pool = pool(&["http://a:1"]);
        assert!(pool.add("http://b:1", false).await);
        assert!(!pool.add("http://b:1", false).await);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_add_rejects_proxy_failing_check() {
        let pool = pool(&[]);
        // Nothing listens on the discard port
        assert!(!pool.add("http://127.0.0.1:9", true).await);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let pool = pool(&["http://a:1"]);
        pool.report_failure("http://a:1").await;
        pool.reset_stats().await;

        let stats = &pool.metrics().await.per_proxy[0];
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.state, ProxyState::Available);
    }
}
