use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::Cache;
use crate::config::{AppConfig, RetryConfig, ScraperConfig};
use crate::fetcher::{Fetcher, HTML_KEY_PREFIX};
use crate::models::Listing;
use crate::price_parser::{PriceError, PriceParser};
use crate::proxy_pool::ProxyPool;
use crate::repository::ProductRepository;
use crate::selector_engine::SelectorEngine;
use crate::utils::error::{AppError, Result};
use crate::utils::retry::random_delay;

/// Builds search result URLs: `{base_url}/{region}?q={product}&o={page}`.
#[derive(Debug, Clone)]
pub struct SearchTarget {
    base_url: Url,
    region: String,
}

impl SearchTarget {
    pub fn new(base_url: &str, region: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| AppError::Validation(format!("Invalid base URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Validation(format!("Base URL {} cannot carry a path", base_url)));
        }

        Ok(Self {
            base_url,
            region: region.trim_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &ScraperConfig) -> Result<Self> {
        Self::new(&config.base_url, &config.region)
    }

    pub fn page_url(&self, product: &str, page: u32) -> String {
        let mut url = self.base_url.clone();
        if !self.region.is_empty() {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().extend(self.region.split('/'));
            }
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("q", product)
            .append_pair("o", &page.to_string());
        url.to_string()
    }
}

/// Outcome of one product scrape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeReport {
    pub product: String,
    /// Accepted prices in completion order. With a repository, a price is added once its store
    /// attempt has returned; on a deadline, listings still being stored are left out.
    pub prices: Vec<f64>,
    pub pages_requested: u32,
    pub pages_succeeded: u32,
    /// Includes pages counted in `structure_changed_pages`.
    pub pages_failed: u32,
    pub structure_changed_pages: u32,
    pub listings_found: usize,
    pub duplicates: usize,
    pub unparseable: usize,
    pub out_of_range: usize,
    pub missing_url: usize,
    pub persisted: usize,
    pub persistence_failures: usize,
    pub timed_out: bool,
}

impl ScrapeReport {
    /// Listings were found but none produced an accepted price.
    pub fn all_rejected(&self) -> bool {
        self.listings_found > 0 && self.prices.is_empty()
    }

    pub fn min_price(&self) -> Option<f64> {
        self.prices.iter().copied().reduce(f64::min)
    }

    pub fn max_price(&self) -> Option<f64> {
        self.prices.iter().copied().reduce(f64::max)
    }

    pub fn mean_price(&self) -> Option<f64> {
        if self.prices.is_empty() {
            None
        } else {
            Some(self.prices.iter().sum::<f64>() / self.prices.len() as f64)
        }
    }
}

#[derive(Default)]
struct JobState {
    seen_urls: HashSet<String>,
    report: ScrapeReport,
}

/// Everything scoped to one product: its fetcher (session and page cache) and dedup state.
struct Job {
    product: String,
    fetcher: Fetcher,
    state: Mutex<JobState>,
}

/// Runs product scrapes: concurrent page tasks, URL dedup, price validation and persistence.
#[derive(Clone)]
pub struct ScrapeOrchestrator {
    target: Arc<SearchTarget>,
    selector_engine: Arc<SelectorEngine>,
    price_parser: Arc<PriceParser>,
    cache: Option<Arc<Cache>>,
    proxy_pool: Option<Arc<ProxyPool>>,
    repository: Option<Arc<dyn ProductRepository>>,
    scraper: ScraperConfig,
    retry: RetryConfig,
}

impl ScrapeOrchestrator {
    pub fn new(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            target: Arc::new(SearchTarget::from_config(&config.scraper)?),
            selector_engine: Arc::new(SelectorEngine::from_config(&config.selectors)?),
            price_parser: Arc::new(PriceParser::new(&config.prices)?),
            cache: None,
            proxy_pool: None,
            repository: None,
            scraper: config.scraper.clone(),
            retry: config.retry.clone(),
        })
    }

    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_proxy_pool(mut self, proxy_pool: Arc<ProxyPool>) -> Self {
        self.proxy_pool = Some(proxy_pool);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn ProductRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    pub fn proxy_pool(&self) -> Option<&Arc<ProxyPool>> {
        self.proxy_pool.as_ref()
    }

    pub fn target(&self) -> &SearchTarget {
        &self.target
    }

    pub async fn scrape_product(&self, product: &str, pages: u32) -> Vec<f64> {
        self.scrape_product_report(product, pages).await.prices
    }

    /// Scrapes pages `1..=pages` concurrently. Never fails: page errors are logged and counted.
    pub async fn scrape_product_report(&self, product: &str, pages: u32) -> ScrapeReport {
        let job = Arc::new(Job {
            product: product.to_string(),
            fetcher: Fetcher::new(&self.scraper, &self.retry, self.cache.clone(), self.proxy_pool.clone()),
            state: Mutex::new(JobState {
                seen_urls: HashSet::new(),
                report: ScrapeReport {
                    product: product.to_string(),
                    pages_requested: pages,
                    ..ScrapeReport::default()
                },
            }),
        });

        let run = self.run_pages(job.clone(), pages);
        let timed_out = match self.scraper.job_timeout() {
            // Dropping the run future drops its JoinSet, which aborts unfinished pages
            Some(limit) => tokio::time::timeout(limit, run).await.is_err(),
            None => {
                run.await;
                false
            }
        };

        let mut report = std::mem::take(&mut job.state.lock().await.report);
        report.timed_out = timed_out;

        if timed_out {
            warn!(
                "Scrape of '{}' hit its deadline, returning {} prices collected so far",
                product,
                report.prices.len()
            );
        }
        if report.prices.is_empty() {
            warn!(
                "No valid prices for '{}' ({} listings found, {} pages failed)",
                product, report.listings_found, report.pages_failed
            );
        } else {
            info!("Found {} valid prices for '{}'", report.prices.len(), product);
        }

        report
    }

    /// Runs products one after another, clearing cached pages between them.
    pub async fn scrape_products_reports(&self, products: &[String], pages: u32) -> Vec<ScrapeReport> {
        let mut reports = Vec::with_capacity(products.len());
        for product in products {
            info!("Starting scrape for '{}'", product);
            reports.push(self.scrape_product_report(product, pages).await);
            self.clear_page_cache().await;
        }
        reports
    }

    pub async fn scrape_products(&self, products: &[String], pages: u32) -> HashMap<String, Vec<f64>> {
        self.scrape_products_reports(products, pages)
            .await
            .into_iter()
            .map(|report| (report.product, report.prices))
            .collect()
    }

    /// Drops every cached page from the shared cache.
    pub async fn clear_page_cache(&self) -> usize {
        match &self.cache {
            Some(cache) => cache.clear_matching(&format!("{}*", HTML_KEY_PREFIX)).await,
            None => 0,
        }
    }

    async fn run_pages(&self, job: Arc<Job>, pages: u32) {
        let semaphore = Arc::new(Semaphore::new(self.scraper.max_concurrent_pages.max(1)));
        let mut tasks = JoinSet::new();

        for page in 1..=pages {
            if page > 1 {
                sleep(random_delay(self.scraper.min_delay(), self.scraper.max_delay())).await;
            }

            info!("Scheduling page {} for '{}'", page, job.product);
            let this = self.clone();
            let job = job.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = this.scrape_page(&job, page).await;
                (page, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let mut state = job.state.lock().await;
            match joined {
                Ok((_, Ok(()))) => state.report.pages_succeeded += 1,
                Ok((page, Err(AppError::StructureChanged { attempted }))) => {
                    error!(
                        "Page {} for '{}' matched none of {} selector sets; selectors need updating",
                        page, job.product, attempted
                    );
                    state.report.structure_changed_pages += 1;
                    state.report.pages_failed += 1;
                }
                Ok((page, Err(e))) => {
                    error!("Page {} for '{}' failed: {}", page, job.product, e);
                    state.report.pages_failed += 1;
                }
                Err(e) => {
                    error!("Page task for '{}' did not complete: {}", job.product, e);
                    state.report.pages_failed += 1;
                }
            }
        }
    }

    async fn scrape_page(&self, job: &Job, page: u32) -> Result<()> {
        let url = self.target.page_url(&job.product, page);
        let page_url = Url::parse(&url).map_err(|e| AppError::Internal(format!("Bad page URL {}: {}", url, e)))?;

        let html = job.fetcher.fetch(&url).await?;
        let extraction = self.selector_engine.extract(&html)?;

        let count = extraction.listings.len();
        info!("Found {} listings on page {} for '{}'", count, page, job.product);
        job.state.lock().await.report.listings_found += count;

        let listing_delay = self.scraper.listing_delay();
        for (index, listing) in extraction.listings.into_iter().enumerate() {
            if index > 0 && !listing_delay.is_zero() {
                sleep(listing_delay).await;
            }
            self.process_listing(job, &page_url, listing).await;
        }

        Ok(())
    }

    async fn process_listing(&self, job: &Job, page_url: &Url, listing: Listing) {
        let Some(url) = listing
            .url
            .as_deref()
            .and_then(|href| page_url.join(href).ok())
            .map(|url| url.to_string())
        else {
            debug!("Skipping listing without link: {}", listing.title_or_default());
            job.state.lock().await.report.missing_url += 1;
            metrics::counter!("adprice_prices_total", "outcome" => "missing_url").increment(1);
            return;
        };

        let price = {
            let mut state = job.state.lock().await;

            // Marked before parsing so a repeated invalid listing is not parsed twice
            if !state.seen_urls.insert(url.clone()) {
                debug!("Skipping duplicate listing {}", url);
                state.report.duplicates += 1;
                metrics::counter!("adprice_prices_total", "outcome" => "duplicate").increment(1);
                return;
            }

            let text = listing.price_text.as_deref().unwrap_or_default();
            match self.price_parser.parse_and_validate(text) {
                Ok(price) => {
                    metrics::counter!("adprice_prices_total", "outcome" => "accepted").increment(1);
                    price
                }
                Err(PriceError::Unparseable(_)) => {
                    debug!("Unparseable price {:?} for {}", text, url);
                    state.report.unparseable += 1;
                    metrics::counter!("adprice_prices_total", "outcome" => "unparseable").increment(1);
                    return;
                }
                Err(e @ PriceError::OutOfRange { .. }) => {
                    debug!("{} for {}", e, url);
                    state.report.out_of_range += 1;
                    metrics::counter!("adprice_prices_total", "outcome" => "out_of_range").increment(1);
                    return;
                }
            }
        };

        // Counted after the store returns; an aborted store leaves no price behind
        let stored = match &self.repository {
            Some(repository) => Some(
                repository
                    .insert_product(&job.product, price, &url, listing.title_or_default())
                    .await,
            ),
            None => None,
        };

        let mut state = job.state.lock().await;
        state.report.prices.push(price);
        match stored {
            Some(Ok(_)) => state.report.persisted += 1,
            Some(Err(e)) => {
                error!("Failed to store listing {}: {}", url, e);
                state.report.persistence_failures += 1;
            }
            None => {}
        }
    }
}
