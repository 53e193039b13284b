use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use adprice::cache::Cache;
use adprice::proxy_pool::ProxyPool;
use adprice::repository::SqliteProductRepository;
use adprice::{AppConfig, ScrapeOrchestrator, ScrapeReport};

/// Collects classified-ad prices for one or more products.
#[derive(Debug, Parser)]
#[command(name = "adprice", version, about)]
struct Cli {
    /// Products to search for
    #[arg(required = true)]
    products: Vec<String>,

    /// Result pages per product (defaults to scraper.default_pages)
    #[arg(short, long)]
    pages: Option<u32>,

    /// Skip the shared page cache
    #[arg(long)]
    no_cache: bool,

    /// Do not store prices in the database
    #[arg(long)]
    no_db: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let default_directive = if cli.verbose { "adprice=debug" } else { "adprice=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_directive.parse()?),
        )
        .init();

    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let pages = cli.pages.unwrap_or(config.scraper.default_pages);

    let mut orchestrator = ScrapeOrchestrator::new(&config).context("Failed to set up scraper")?;

    if !cli.no_cache {
        if let Some(cache) = Cache::from_config(&config.cache).await {
            orchestrator = orchestrator.with_cache(Arc::new(cache));
        }
    }

    if let Some(pool) = ProxyPool::from_config(&config.proxy) {
        info!("Proxy rotation enabled with {} proxies", pool.len().await);
        orchestrator = orchestrator.with_proxy_pool(Arc::new(pool));
    }

    if !cli.no_db {
        let repository = SqliteProductRepository::connect(&config.database)
            .await
            .context("Failed to open database")?;
        orchestrator = orchestrator.with_repository(Arc::new(repository));
    }

    info!("Scraping {} products, {} pages each", cli.products.len(), pages);
    let reports = orchestrator.scrape_products_reports(&cli.products, pages).await;

    for report in &reports {
        print_report(report);
    }

    if let Some(pool) = orchestrator.proxy_pool() {
        let metrics = pool.metrics().await;
        info!(
            "Proxy pool: {}/{} available, {:.0}% success over {} requests",
            metrics.available_count,
            metrics.total_proxies,
            metrics.aggregate_success_rate * 100.0,
            metrics.total_requests
        );
    }

    if reports.iter().all(|r| r.prices.is_empty()) {
        warn!("No prices collected");
    }

    Ok(())
}

fn print_report(report: &ScrapeReport) {
    println!("{}", report.product);
    match (report.min_price(), report.max_price(), report.mean_price()) {
        (Some(min), Some(max), Some(mean)) => {
            println!("  prices: {}", report.prices.len());
            println!("  min:    R$ {:.2}", min);
            println!("  max:    R$ {:.2}", max);
            println!("  mean:   R$ {:.2}", mean);
        }
        _ if report.all_rejected() => {
            println!("  {} listings found, none with a valid price", report.listings_found);
        }
        _ => println!("  no listings found"),
    }
    if report.timed_out {
        println!("  (stopped at deadline, results partial)");
    }
}
