// Integration tests for the adprice scraper
// These tests drive the orchestrator end to end against a local mock site

pub mod resilience_tests;
pub mod scrape_tests;

use adprice::repository::SqliteProductRepository;
use adprice::AppConfig;
use sqlx::sqlite::SqlitePoolOptions;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const REGION_PATH: &str = "/estado-go";

/// Test configuration pointing at a mock server, with all throttling disabled
pub fn get_test_config(base_url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.scraper.base_url = base_url.to_string();
    config.scraper.region = "estado-go".to_string();
    config.scraper.min_delay_ms = 0;
    config.scraper.max_delay_ms = 5;
    config.scraper.listing_delay_ms = 0;
    config.scraper.request_timeout = 5;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 5;
    config.retry.backoff_factor = 2.0;
    config.database.url = "sqlite::memory:".to_string();
    config
}

/// Current-generation ad card
pub fn ad_card(href: &str, title: &str, price: &str) -> String {
    format!(
        r#"<section data-ds-component="DS-AdCard">
            <a data-ds-component="DS-NewAdCard-Link" href="{href}">
                <h2 data-ds-component="DS-Text">{title}</h2>
            </a>
            <h3 data-ds-component="DS-Text">{price}</h3>
        </section>"#
    )
}

/// Older list-item markup only the last default fallback set understands
pub fn legacy_card(href: &str, title: &str, price: &str) -> String {
    format!(
        r#"<li class="ej84nb0">
            <a class="ej84nb8" href="{href}">
                <div class="ej84nb3">{title}</div>
                <div class="ej84nb5">{price}</div>
            </a>
        </li>"#
    )
}

pub fn listing_page(cards: &[String]) -> String {
    format!(
        "<!DOCTYPE html><html lang=\"pt-BR\"><head><title>Resultados</title></head><body><main>{}</main></body></html>",
        cards.join("\n")
    )
}

pub async fn mount_search_page(server: &MockServer, page: u32, body: String) {
    Mock::given(method("GET"))
        .and(path(REGION_PATH))
        .and(query_param("o", page.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

pub async fn create_test_repository() -> anyhow::Result<SqliteProductRepository> {
    // A single connection keeps the in-memory database alive and shared
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let repository = SqliteProductRepository::from_pool(pool);
    repository.initialize().await?;
    Ok(repository)
}

pub fn sorted(mut prices: Vec<f64>) -> Vec<f64> {
    prices.sort_by(f64::total_cmp);
    prices
}
