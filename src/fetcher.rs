use rand::seq::SliceRandom;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::{RetryConfig, ScraperConfig};
use crate::proxy_pool::ProxyPool;
use crate::utils::error::{client_setup_error, AppError, Result};
use crate::utils::retry::JitteredBackoff;

pub const HTML_KEY_PREFIX: &str = "html:";

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const ACCEPT_LANGUAGE_PT_BR: &str = "pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7";

pub fn html_cache_key(url: &str) -> String {
    format!("{}{}", HTML_KEY_PREFIX, url)
}

/// An HTTP client with its own cookie jar, bound to at most one proxy.
struct Session {
    client: reqwest::Client,
    proxy: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub cache_hits: u64,
    pub network_attempts: u64,
    pub failed_attempts: u64,
}

/// Retrieves page HTML for one scrape job.
///
/// Lookup order is shared cache, then the job-local page cache, then the network.
/// Network attempts go through a proxy-bound session that is discarded after any
/// failure so the next attempt picks a fresh proxy.
pub struct Fetcher {
    cache: Option<Arc<Cache>>,
    proxy_pool: Option<Arc<ProxyPool>>,
    page_cache: Mutex<HashMap<String, String>>,
    session: RwLock<Option<Arc<Session>>>,
    retry: RetryConfig,
    request_timeout: Duration,
    user_agents: Vec<String>,
    referer: String,
    cache_hits: AtomicU64,
    network_attempts: AtomicU64,
    failed_attempts: AtomicU64,
}

impl Fetcher {
    pub fn new(
        scraper: &ScraperConfig,
        retry: &RetryConfig,
        cache: Option<Arc<Cache>>,
        proxy_pool: Option<Arc<ProxyPool>>,
    ) -> Self {
        Self {
            cache,
            proxy_pool,
            page_cache: Mutex::new(HashMap::new()),
            session: RwLock::new(None),
            retry: retry.clone(),
            request_timeout: scraper.request_timeout(),
            user_agents: scraper.user_agents.clone(),
            referer: scraper.referer.clone(),
            cache_hits: AtomicU64::new(0),
            network_attempts: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<String> {
        let key = html_cache_key(url);

        if let Some(cache) = &self.cache {
            if let Some(html) = cache.get_text(&key).await {
                debug!("Cache hit for {}", url);
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("adprice_fetch_total", "outcome" => "cache_hit").increment(1);
                return Ok(html);
            }
        }

        if let Some(html) = self.page_cache.lock().await.get(url).cloned() {
            debug!("Page cache hit for {}", url);
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("adprice_fetch_total", "outcome" => "page_cache_hit").increment(1);
            return Ok(html);
        }

        let html = RetryIf::spawn(
            JitteredBackoff::from_config(&self.retry),
            || self.fetch_once(url),
            |e: &AppError| {
                if e.is_retriable() {
                    debug!("Retrying {} after: {}", url, e);
                }
                e.is_retriable()
            },
        )
        .await?;

        self.page_cache.lock().await.insert(url.to_string(), html.clone());
        if let Some(cache) = &self.cache {
            cache.set_text(&key, &html, None).await;
        }

        Ok(html)
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            network_attempts: self.network_attempts.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<String> {
        self.network_attempts.fetch_add(1, Ordering::Relaxed);
        let session = self.session().await?;

        match self.request(&session, url).await {
            Ok(html) => {
                if let (Some(pool), Some(proxy)) = (&self.proxy_pool, &session.proxy) {
                    pool.report_success(proxy).await;
                }
                metrics::counter!("adprice_fetch_total", "outcome" => "success").increment(1);
                Ok(html)
            }
            Err(e) => {
                warn!("Request to {} failed: {}", url, e);
                self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("adprice_fetch_total", "outcome" => "failure").increment(1);
                if let (Some(pool), Some(proxy)) = (&self.proxy_pool, &session.proxy) {
                    pool.report_failure(proxy).await;
                }
                self.discard_session(&session).await;
                Err(e)
            }
        }
    }

    async fn request(&self, session: &Session, url: &str) -> Result<String> {
        let user_agent = self
            .user_agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or_default();

        let response = session
            .client
            .get(url)
            .header(USER_AGENT, user_agent)
            .header(ACCEPT, ACCEPT_HTML)
            .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGE_PT_BR)
            .header(REFERER, &self.referer)
            .header("DNT", "1")
            .header("Upgrade-Insecure-Requests", "1")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }

    async fn session(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }

        let mut slot = self.session.write().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let session = Arc::new(self.build_session().await?);
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn build_session(&self) -> Result<Session> {
        let proxy = match &self.proxy_pool {
            Some(pool) => pool.select().await,
            None => None,
        };

        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.request_timeout);

        if let Some(address) = &proxy {
            let bound = match reqwest::Proxy::all(address.as_str()) {
                Ok(bound) => bound,
                Err(e) => {
                    if let Some(pool) = &self.proxy_pool {
                        pool.report_failure(address).await;
                    }
                    return Err(AppError::Proxy {
                        proxy: address.clone(),
                        message: e.to_string(),
                    });
                }
            };
            builder = builder.proxy(bound);
            debug!("New session through proxy {}", address);
        } else {
            debug!("New direct session");
        }

        Ok(Session {
            client: builder.build().map_err(client_setup_error)?,
            proxy,
        })
    }

    /// Drops the session unless a concurrent task already replaced it.
    async fn discard_session(&self, failed: &Arc<Session>) {
        let mut slot = self.session.write().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, failed)) {
            *slot = None;
        }
    }
}
