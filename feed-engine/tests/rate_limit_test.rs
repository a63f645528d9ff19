mod common;

use chrono::Utc;
use feed_engine::{FeedKind, FeedSubscription, FetchConfig, Fetcher, RateLimiter};
use std::time::{Duration, Instant};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const SPACING: Duration = Duration::from_millis(400);

fn rss_subscription(id: i64, url: String) -> FeedSubscription {
    let now = Utc::now();
    FeedSubscription {
        id,
        kind: FeedKind::Rss,
        url,
        channel: "alerts".into(),
        name: None,
        check_interval_seconds: 300,
        output_format: None,
        send_interval_seconds: None,
        filter: None,
        sort: None,
        api_config: None,
        enabled: true,
        last_checked: None,
        error_count: 0,
        last_error: None,
        last_item_id: None,
        created_at: now,
        updated_at: now,
    }
}

async fn feed_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(common::rss_body(&[("r1", "Ready")])),
        )
        .mount(&server)
        .await;
    server
}

fn fetcher() -> Fetcher {
    common::init_tracing();
    let config = FetchConfig {
        rate_limit: SPACING,
        max_retries: 0,
        ..FetchConfig::default()
    };
    Fetcher::new(config).unwrap()
}

#[tokio::test]
async fn same_origin_requests_are_spaced() {
    let server = feed_server().await;
    let fetcher = fetcher();
    let a = rss_subscription(1, format!("{}/one", server.uri()));
    let b = rss_subscription(2, format!("{}/two", server.uri()));

    let start = Instant::now();
    fetcher.fetch(&a).await.unwrap();
    fetcher.fetch(&b).await.unwrap();
    fetcher.fetch(&a).await.unwrap();
    assert!(start.elapsed() >= SPACING * 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn different_origins_do_not_wait_on_each_other() {
    let first = feed_server().await;
    let second = feed_server().await;
    let fetcher = fetcher();

    let start = Instant::now();
    fetcher
        .fetch(&rss_subscription(1, format!("{}/rss", first.uri())))
        .await
        .unwrap();
    fetcher
        .fetch(&rss_subscription(2, format!("{}/rss", second.uri())))
        .await
        .unwrap();
    assert!(start.elapsed() < SPACING);
}

#[tokio::test]
async fn shared_limiter_spaces_concurrent_fetchers() {
    let server = feed_server().await;
    let limiter = RateLimiter::new(SPACING);
    let config = FetchConfig {
        max_retries: 0,
        ..FetchConfig::default()
    };
    let one = Fetcher::with_rate_limiter(config.clone(), limiter.clone()).unwrap();
    let two = Fetcher::with_rate_limiter(config, limiter).unwrap();
    let sub = rss_subscription(1, format!("{}/rss", server.uri()));

    let start = Instant::now();
    let (a, b) = tokio::join!(one.fetch(&sub), two.fetch(&sub));
    a.unwrap();
    b.unwrap();
    assert!(start.elapsed() >= SPACING);
}
