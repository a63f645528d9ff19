mod common;

use common::{fast_config, harness, rss_body, subscription};
use feed_engine::{ApiConfig, EngineError, FeedKind, FilterSpec, ResponseParser, SortSpec};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn alerts_api() -> ApiConfig {
    ApiConfig {
        response_parser: ResponseParser {
            items_path: "alerts".into(),
            id_field: "AlertId".into(),
            title_field: "Title".into(),
            description_field: "Description".into(),
            timestamp_field: "Issued".into(),
            link_field: "Url".into(),
        },
        ..ApiConfig::default()
    }
}

#[tokio::test]
async fn same_feed_twice_dispatches_only_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_body(&[
            ("a1", "Road closed"),
            ("a2", "Power outage"),
            ("a3", "Boil water notice"),
        ])))
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let sub = h
        .store
        .insert_subscription(subscription(FeedKind::Rss, format!("{}/rss", server.uri())))
        .await
        .unwrap();

    let first = h.engine.run_pass(&sub).await.unwrap();
    assert_eq!(first.fetched, 3);
    assert_eq!(first.queued, 3);

    let second = h.engine.run_pass(&sub).await.unwrap();
    assert_eq!(second.fetched, 3);
    assert_eq!(second.queued, 0);

    h.recorder.wait_for(3).await;
    let third = h.engine.run_pass(&sub).await.unwrap();
    assert_eq!(third.queued, 0);
    assert_eq!(h.recorder.texts().await.len(), 3);
    assert_eq!(h.store.seen_ids(sub.id).await.unwrap().len(), 3);
    assert_eq!(h.store.activity(sub.id, 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn guidless_feed_is_not_resent() {
    let server = MockServer::start().await;
    let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Roads</title><link>https://example.com</link>
<description>Closures</description>
<item><title>Road closed</title><link>https://example.com/a</link></item>
<item><title>No link here</title></item>
</channel></rss>"#;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let sub = h
        .store
        .insert_subscription(subscription(FeedKind::Rss, format!("{}/rss", server.uri())))
        .await
        .unwrap();

    assert_eq!(h.engine.run_pass(&sub).await.unwrap().queued, 2);
    h.recorder.wait_for(2).await;
    assert_eq!(h.engine.run_pass(&sub).await.unwrap().queued, 0);

    let seen = h.store.seen_ids(sub.id).await.unwrap();
    assert!(seen.contains("https://example.com/a"));
}

#[tokio::test]
async fn reordered_api_payload_sends_nothing_new() {
    let server = MockServer::start().await;
    let items = vec![
        json!({"AlertId": "1", "Title": "Flood watch", "Description": "River rising"}),
        json!({"AlertId": "2", "Title": "Wind advisory", "Description": "Gusts to 50"}),
    ];
    Mock::given(method("GET"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "alerts": items })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    let reversed: Vec<_> = items.iter().rev().cloned().collect();
    Mock::given(method("GET"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "alerts": reversed })))
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let mut new = subscription(FeedKind::Api, format!("{}/alerts", server.uri()));
    new.api_config = Some(alerts_api());
    let sub = h.store.insert_subscription(new).await.unwrap();

    assert_eq!(h.engine.run_pass(&sub).await.unwrap().queued, 2);
    h.recorder.wait_for(2).await;
    assert_eq!(h.engine.run_pass(&sub).await.unwrap().queued, 0);
}

#[tokio::test]
async fn priority_filter_keeps_only_high_alerts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/alerts"))
        .and(query_param("county", "king"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "alerts": [
                {"AlertId": "1", "Title": "Tornado", "Priority": "Highest"},
                {"AlertId": "2", "Title": "Fog", "Priority": "Low"},
                {"AlertId": "3", "Title": "Flood", "Priority": "High"},
                {"AlertId": "4", "Title": "Frost"}
            ]
        })))
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let mut api = alerts_api();
    api.params.insert("county".into(), "king".into());
    let mut new = subscription(FeedKind::Api, format!("{}/alerts", server.uri()));
    new.api_config = Some(api);
    new.output_format = Some("{title}".into());
    new.filter = Some(
        serde_json::from_value::<FilterSpec>(json!({
            "conditions": [
                {"field": "raw.Priority", "operator": "in", "values": ["highest", "high"]}
            ],
            "logic": "OR"
        }))
        .unwrap(),
    );
    let sub = h.store.insert_subscription(new).await.unwrap();

    let report = h.engine.run_pass(&sub).await.unwrap();
    assert_eq!(report.fetched, 4);
    assert_eq!(report.matched, 2);
    h.recorder.wait_for(2).await;
    assert_eq!(h.recorder.texts().await, vec!["Tornado", "Flood"]);
}

#[tokio::test]
async fn sorted_descending_by_issue_time() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "alerts": [
                {"AlertId": "1", "Title": "old", "Issued": "/Date(1700000000000)/"},
                {"AlertId": "2", "Title": "newest", "Issued": "2024-06-01T00:00:00Z"},
                {"AlertId": "3", "Title": "middle", "Issued": 1710000000}
            ]
        })))
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let mut new = subscription(FeedKind::Api, format!("{}/alerts", server.uri()));
    new.api_config = Some(alerts_api());
    new.output_format = Some("{title}".into());
    new.sort = Some(serde_json::from_value::<SortSpec>(json!({"field": "raw.Issued", "order": "desc"})).unwrap());
    let sub = h.store.insert_subscription(new).await.unwrap();

    h.engine.run_pass(&sub).await.unwrap();
    h.recorder.wait_for(3).await;
    assert_eq!(h.recorder.texts().await, vec!["newest", "middle", "old"]);
}

#[tokio::test]
async fn truncate_template_cuts_title() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(rss_body(&[("w1", "Severe Thunderstorm Warning")])),
        )
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let mut new = subscription(FeedKind::Rss, format!("{}/rss", server.uri()));
    new.output_format = Some("{emoji} {title|truncate:10}".into());
    let sub = h.store.insert_subscription(new).await.unwrap();

    h.engine.run_pass(&sub).await.unwrap();
    h.recorder.wait_for(1).await;
    assert_eq!(h.recorder.texts().await, vec!["🚨 Severe Thu"]);
}

#[tokio::test]
async fn items_per_check_are_capped() {
    let server = MockServer::start().await;
    let titles: Vec<(String, String)> = (0..5)
        .map(|n| (format!("id{n}"), format!("Item {n}")))
        .collect();
    let refs: Vec<(&str, &str)> = titles
        .iter()
        .map(|(g, t)| (g.as_str(), t.as_str()))
        .collect();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_body(&refs)))
        .mount(&server)
        .await;

    let config = feed_engine::EngineConfig {
        max_items_per_check: 2,
        ..fast_config()
    };
    let h = harness(config);
    let sub = h
        .store
        .insert_subscription(subscription(FeedKind::Rss, format!("{}/rss", server.uri())))
        .await
        .unwrap();

    let report = h.engine.run_pass(&sub).await.unwrap();
    assert_eq!(report.fetched, 5);
    assert_eq!(report.queued, 2);
}

#[tokio::test]
async fn fetch_failure_is_recorded_and_leaves_dedup_alone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let sub = h
        .store
        .insert_subscription(subscription(FeedKind::Rss, format!("{}/rss", server.uri())))
        .await
        .unwrap();

    for _ in 0..2 {
        let err = h.engine.run_pass(&sub).await.unwrap_err();
        assert!(
            matches!(err, EngineError::Fetch { status: Some(503), .. }),
            "got {err:?}"
        );
    }

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.error_count, 2);
    assert!(stored.enabled);
    assert!(stored.last_error.unwrap().contains("503"));
    let errors = h.store.errors(sub.id, 10).await.unwrap();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.error_type == "fetch"));
    assert!(h.store.seen_ids(sub.id).await.unwrap().is_empty());
    assert!(h.recorder.texts().await.is_empty());
}

#[tokio::test]
async fn malformed_json_is_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let sub = h
        .store
        .insert_subscription(subscription(FeedKind::Api, format!("{}/api", server.uri())))
        .await
        .unwrap();

    let err = h.engine.run_pass(&sub).await.unwrap_err();
    assert_eq!(err.kind(), "fetch");
    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.error_count, 1);
}

#[tokio::test]
async fn success_resets_error_count() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_body(&[("x", "Back")])))
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let sub = h
        .store
        .insert_subscription(subscription(FeedKind::Rss, format!("{}/rss", server.uri())))
        .await
        .unwrap();

    assert!(h.engine.run_pass(&sub).await.is_err());
    assert!(h.engine.run_pass(&sub).await.is_ok());
    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.error_count, 0);
    assert!(stored.last_checked.is_some());
}

#[tokio::test]
async fn preview_does_not_mark_items_seen() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_body(&[
            ("p1", "One"),
            ("p2", "Two"),
            ("p3", "Three"),
            ("p4", "Four"),
        ])))
        .mount(&server)
        .await;

    let h = harness(fast_config());
    let sub = h
        .store
        .insert_subscription(subscription(FeedKind::Rss, format!("{}/rss", server.uri())))
        .await
        .unwrap();

    let preview = h.engine.preview(&sub, 3).await.unwrap();
    assert_eq!(preview.len(), 3);
    assert_eq!(preview[0].title, "One");
    assert!(h.store.seen_ids(sub.id).await.unwrap().is_empty());
    assert_eq!(h.engine.run_pass(&sub).await.unwrap().queued, 4);
}

#[tokio::test]
async fn server_errors_are_retried_but_client_errors_are_not() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_body(&[("f1", "Recovered")])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let config = feed_engine::EngineConfig {
        max_fetch_retries: 1,
        ..fast_config()
    };
    let h = harness(config);
    let flaky = h
        .store
        .insert_subscription(subscription(FeedKind::Rss, format!("{}/flaky", server.uri())))
        .await
        .unwrap();
    let gone = h
        .store
        .insert_subscription(subscription(FeedKind::Rss, format!("{}/gone", server.uri())))
        .await
        .unwrap();

    assert_eq!(h.engine.run_pass(&flaky).await.unwrap().queued, 1);
    let err = h.engine.run_pass(&gone).await.unwrap_err();
    assert!(matches!(err, EngineError::Fetch { status: Some(404), .. }));

    let requests = server.received_requests().await.unwrap();
    let count = |p: &str| requests.iter().filter(|r| r.url.path() == p).count();
    assert_eq!(count("/flaky"), 2);
    assert_eq!(count("/gone"), 1);
}
