use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::models::SelectorSet;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scraper: ScraperConfig,
    pub prices: PriceConfig,
    pub cache: CacheConfig,
    pub proxy: ProxyConfig,
    pub retry: RetryConfig,
    pub selectors: SelectorConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub base_url: String,
    pub region: String,
    pub default_pages: u32,
    /// Per-request timeout in seconds.
    pub request_timeout: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Pause between processing consecutive listings of one page.
    pub listing_delay_ms: u64,
    pub max_concurrent_pages: usize,
    /// Overall deadline for one product, in seconds. Unset means none.
    pub job_timeout: Option<u64>,
    pub user_agents: Vec<String>,
    pub referer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
    pub min_price: f64,
    pub max_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackendKind,
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
    pub ssl: bool,
    /// Default entry lifetime in seconds.
    pub ttl: u64,
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub proxies: Vec<String>,
    /// Known-good URL used to vet new proxies. Empty means `scraper.base_url`.
    pub test_url: String,
    pub min_success_rate: f64,
    /// Seconds a proxy sits out after a failure.
    pub cooldown: u64,
    pub test_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub primary: SelectorSet,
    pub fallbacks: Vec<SelectorSet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.olx.com.br".to_string(),
            region: "estado-go".to_string(),
            default_pages: 3,
            request_timeout: 20,
            min_delay_ms: 200,
            max_delay_ms: 500,
            listing_delay_ms: 50,
            max_concurrent_pages: 8,
            job_timeout: None,
            user_agents: default_user_agents(),
            referer: "https://www.olx.com.br/".to_string(),
        }
    }
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            min_price: 50.0,
            max_price: 100_000.0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            ssl: false,
            ttl: 86_400,
            prefix: "adprice:".to_string(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxies: Vec::new(),
            test_url: String::new(),
            min_success_rate: 0.5,
            cooldown: 300,
            test_timeout: 10,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            backoff_factor: 2.0,
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            primary: SelectorSet::default_primary(),
            fallbacks: SelectorSet::default_fallbacks(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/adprice.db".to_string(),
            max_connections: 5,
        }
    }
}

fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15".to_string(),
    ]
}

impl ScraperConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn listing_delay(&self) -> Duration {
        Duration::from_millis(self.listing_delay_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout.map(Duration::from_secs)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    /// Connection URL with the password percent-encoded.
    pub fn redis_url(&self) -> Result<String, ConfigError> {
        let scheme = if self.ssl { "rediss" } else { "redis" };
        let mut url = Url::parse(&format!("{}://{}:{}/{}", scheme, self.host, self.port, self.db))
            .map_err(|e| ConfigError::Message(format!("Invalid Redis address: {}", e)))?;
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|_| ConfigError::Message("Redis URL cannot carry a password".into()))?;
        }
        Ok(url.to_string())
    }
}

impl ProxyConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout)
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new("config"))
    }

    /// Layered load: defaults, `default.*`, `{RUN_MODE}.*`, `local.*`, then `ADPRICE__*` variables.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let source = |name: &str| File::with_name(&config_dir.join(name).to_string_lossy()).required(false);

        let s = Config::builder()
            .add_source(source("default"))
            .add_source(source(&run_mode))
            // Local overrides (ignored by git)
            .add_source(source("local"))
            .add_source(
                Environment::with_prefix("ADPRICE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("proxy.proxies")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: AppConfig = s.try_deserialize()?;

        if config.proxy.test_url.is_empty() {
            config.proxy.test_url = config.scraper.base_url.clone();
        }
        if config.scraper.user_agents.is_empty() {
            config.scraper.user_agents = default_user_agents();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Scraper
        if Url::parse(&self.scraper.base_url).is_err() {
            return Err(ConfigError::Message("Invalid base URL format".into()));
        }

        if self.scraper.min_delay_ms > self.scraper.max_delay_ms {
            return Err(ConfigError::Message("Scraper min_delay_ms cannot exceed max_delay_ms".into()));
        }

        if self.scraper.max_concurrent_pages == 0 {
            return Err(ConfigError::Message("Scraper max_concurrent_pages must be greater than 0".into()));
        }

        if self.scraper.request_timeout == 0 {
            return Err(ConfigError::Message("Scraper request_timeout must be greater than 0".into()));
        }

        // Prices
        if self.prices.min_price < 0.0 {
            return Err(ConfigError::Message("Price min_price cannot be negative".into()));
        }

        if self.prices.min_price > self.prices.max_price {
            return Err(ConfigError::Message("Price min_price cannot exceed max_price".into()));
        }

        // Proxy
        if !(0.0..=1.0).contains(&self.proxy.min_success_rate) {
            return Err(ConfigError::Message("Proxy min_success_rate must be between 0 and 1".into()));
        }

        // Retry
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Message("Retry max_attempts must be greater than 0".into()));
        }

        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Message("Retry backoff_factor must be at least 1.0".into()));
        }

        // Selectors
        let all_sets = std::iter::once(&self.selectors.primary).chain(self.selectors.fallbacks.iter());
        for set in all_sets {
            if set.selectors().iter().any(|s| s.trim().is_empty()) {
                return Err(ConfigError::Message("Selector sets cannot contain empty selectors".into()));
            }
        }

        Ok(())
    }
}
