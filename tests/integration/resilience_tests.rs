use super::*;
use adprice::config::ProxyConfig;
use adprice::proxy_pool::ProxyPool;
use adprice::ScrapeOrchestrator;
use std::sync::Arc;

#[tokio::test]
async fn test_transient_failures_retried_within_budget() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(REGION_PATH))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_search_page(&server, 1, listing_page(&[ad_card("/ad/1", "Micro-ondas", "R$ 420,00")])).await;

    let orchestrator = ScrapeOrchestrator::new(&get_test_config(&server.uri()))?;
    let report = orchestrator.scrape_product_report("micro-ondas", 1).await;

    assert_eq!(report.prices, vec![420.0]);
    assert_eq!(report.pages_succeeded, 1);
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_fail_only_that_page() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_search_page(&server, 1, listing_page(&[ad_card("/ad/1", "Tablet", "R$ 1.300,00")])).await;
    Mock::given(method("GET"))
        .and(query_param("o", "2"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let orchestrator = ScrapeOrchestrator::new(&get_test_config(&server.uri()))?;
    let report = orchestrator.scrape_product_report("tablet", 2).await;

    assert_eq!(report.prices, vec![1300.0]);
    assert_eq!(report.pages_failed, 1);
    assert_eq!(report.structure_changed_pages, 0);

    let page_two_requests = server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.query().is_some_and(|q| q.ends_with("o=2")))
        .count();
    assert_eq!(page_two_requests, 3);

    Ok(())
}

#[tokio::test]
async fn test_unreachable_proxy_recorded_and_job_survives() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_search_page(&server, 1, listing_page(&[ad_card("/ad/1", "Impressora", "R$ 600,00")])).await;

    let proxy_config = ProxyConfig {
        enabled: true,
        proxies: vec!["http://127.0.0.1:9".to_string()],
        test_url: server.uri(),
        ..ProxyConfig::default()
    };
    let pool = Arc::new(ProxyPool::from_config(&proxy_config).expect("proxy pool"));

    let orchestrator = ScrapeOrchestrator::new(&get_test_config(&server.uri()))?.with_proxy_pool(pool.clone());
    let report = orchestrator.scrape_product_report("impressora", 1).await;

    assert!(report.prices.is_empty());
    assert_eq!(report.pages_failed, 1);

    let metrics = pool.metrics().await;
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.per_proxy[0].failure_count, 3);
    assert_eq!(metrics.aggregate_success_rate, 0.0);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_evicted_proxy_not_used_again() -> anyhow::Result<()> {
    let proxy_config = ProxyConfig {
        enabled: true,
        proxies: vec!["http://127.0.0.1:9".to_string()],
        cooldown: 0,
        ..ProxyConfig::default()
    };
    let pool = ProxyPool::from_config(&proxy_config).expect("proxy pool");

    for _ in 0..5 {
        pool.report_failure("http://127.0.0.1:9").await;
    }

    assert_eq!(pool.select().await, None);
    assert!(pool.is_empty().await);
    assert!(!pool.add("http://127.0.0.1:9", false).await);

    Ok(())
}
