use super::*;
use adprice::cache::Cache;
use adprice::config::CacheConfig;
use adprice::models::SelectorSet;
use adprice::ScrapeOrchestrator;
use std::sync::Arc;

#[tokio::test]
async fn test_duplicate_listing_across_pages_counted_once() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_search_page(
        &server,
        1,
        listing_page(&[
            ad_card("/ad/100", "Sofá retrátil", "R$ 1.200,00"),
            ad_card("/ad/101", "Sofá 3 lugares", "R$ 950,00"),
        ]),
    )
    .await;
    // Pagination overlap: /ad/101 shows up again on page 2
    mount_search_page(
        &server,
        2,
        listing_page(&[
            ad_card("/ad/101", "Sofá 3 lugares", "R$ 950,00"),
            ad_card("/ad/102", "Sofá de canto", "R$ 2.300,00"),
        ]),
    )
    .await;

    let repository = Arc::new(create_test_repository().await?);
    let orchestrator = ScrapeOrchestrator::new(&get_test_config(&server.uri()))?.with_repository(repository.clone());

    let report = orchestrator.scrape_product_report("sofa", 2).await;
    assert_eq!(sorted(report.prices.clone()), vec![950.0, 1200.0, 2300.0]);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.listings_found, 4);
    assert_eq!(report.pages_succeeded, 2);
    assert_eq!(report.persisted, 3);
    assert_eq!(repository.products_by_name("sofa").await?.len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_only_range_valid_prices_retained() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_search_page(
        &server,
        1,
        listing_page(&[
            ad_card("/ad/1", "Película", "R$ 15,00"),
            ad_card("/ad/2", "Notebook", "R$ 4.250,00"),
            ad_card("/ad/3", "Casa", "R$ 350.000,00"),
            ad_card("/ad/4", "Notebook parcelado", "10x de R$ 399,90"),
            ad_card("/ad/5", "Notebook usado", "R$ 50,00"),
        ]),
    )
    .await;

    let orchestrator = ScrapeOrchestrator::new(&get_test_config(&server.uri()))?;
    let report = orchestrator.scrape_product_report("notebook", 1).await;

    assert_eq!(sorted(report.prices), vec![50.0, 3999.0, 4250.0]);
    assert_eq!(report.out_of_range, 2);

    Ok(())
}

#[tokio::test]
async fn test_legacy_markup_uses_fallback_selectors() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_search_page(
        &server,
        1,
        listing_page(&[
            legacy_card("/ad/7", "Bicicleta aro 29", "R$ 1.350,00"),
            legacy_card("/ad/8", "Bicicleta infantil", "R$ 280,00"),
        ]),
    )
    .await;

    let orchestrator = ScrapeOrchestrator::new(&get_test_config(&server.uri()))?;
    let report = orchestrator.scrape_product_report("bicicleta", 1).await;

    assert_eq!(sorted(report.prices), vec![280.0, 1350.0]);
    assert_eq!(report.structure_changed_pages, 0);

    Ok(())
}

#[tokio::test]
async fn test_unknown_markup_reports_structure_change() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let body = listing_page(&[r#"<div class="card-v9"><p>Console</p><p>R$ 2.000,00</p></div>"#.to_string()]);
    mount_search_page(&server, 1, body.clone()).await;
    mount_search_page(&server, 2, body).await;

    let orchestrator = ScrapeOrchestrator::new(&get_test_config(&server.uri()))?;
    let report = orchestrator.scrape_product_report("console", 2).await;

    assert!(report.prices.is_empty());
    assert_eq!(report.structure_changed_pages, 2);
    assert_eq!(report.pages_failed, 2);
    // Structure changes are not retried
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_custom_selector_sets_from_config() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let body = listing_page(&[
        r#"<div class="card-v9"><a href="/ad/9"><p class="t">Console</p></a><p class="v">R$ 2.000,00</p></div>"#
            .to_string(),
    ]);
    mount_search_page(&server, 1, body).await;

    let mut config = get_test_config(&server.uri());
    config
        .selectors
        .fallbacks
        .push(SelectorSet::new("div.card-v9", "p.t", "p.v", "a"));

    let orchestrator = ScrapeOrchestrator::new(&config)?;
    assert_eq!(orchestrator.scrape_product("console", 1).await, vec![2000.0]);

    Ok(())
}

#[tokio::test]
async fn test_cached_page_served_without_request() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let config = get_test_config(&server.uri());

    let cache = Arc::new(Cache::in_memory(&CacheConfig::default()));
    let orchestrator = ScrapeOrchestrator::new(&config)?.with_cache(cache.clone());

    let page_url = orchestrator.target().page_url("ventilador", 1);
    cache
        .set_text(
            &format!("html:{}", page_url),
            &listing_page(&[ad_card("/ad/1", "Ventilador", "R$ 180,00")]),
            None,
        )
        .await;

    assert_eq!(orchestrator.scrape_product("ventilador", 1).await, vec![180.0]);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_products_scraped_independently() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    // The same ad shows up for both searches
    mount_search_page(&server, 1, listing_page(&[ad_card("/ad/55", "Cadeira gamer", "R$ 899,00")])).await;

    let cache = Arc::new(Cache::in_memory(&CacheConfig::default()));
    let orchestrator = ScrapeOrchestrator::new(&get_test_config(&server.uri()))?.with_cache(cache.clone());

    let results = orchestrator
        .scrape_products(&["cadeira".to_string(), "cadeira gamer".to_string()], 1)
        .await;

    // Dedup state does not carry over between products
    assert_eq!(results["cadeira"], vec![899.0]);
    assert_eq!(results["cadeira gamer"], vec![899.0]);
    assert_eq!(cache.stats().await.keys, 0);

    Ok(())
}
