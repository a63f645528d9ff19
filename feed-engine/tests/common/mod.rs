#![allow(dead_code)]

use async_trait::async_trait;
use feed_engine::{
    ChannelSender, EngineConfig, FeedEngine, FeedKind, FeedStore, NewSubscription, SendError,
};
use interfaces::MemoryFeedStore;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Mutex;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}

/// Channel sender that keeps every message in memory.
#[derive(Default)]
pub struct Recorder {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChannelSender for Recorder {
    async fn send(&self, channel: &str, text: &str) -> Result<(), SendError> {
        self.sent
            .lock()
            .await
            .push((channel.to_string(), text.to_string()));
        Ok(())
    }
}

impl Recorder {
    pub async fn texts(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|(_, t)| t.clone()).collect()
    }

    pub async fn wait_for(&self, count: usize) {
        for _ in 0..200 {
            if self.sent.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} sent messages");
    }
}

/// Config without pacing so tests against a live mock server stay fast.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        feed_rate_limit_seconds: 0.0,
        default_send_interval_seconds: 0.0,
        max_fetch_retries: 0,
        feed_request_timeout: 5,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: Arc<FeedEngine>,
    pub store: Arc<dyn FeedStore>,
    pub recorder: Arc<Recorder>,
}

pub fn harness(config: EngineConfig) -> Harness {
    init_tracing();
    let store: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let recorder = Arc::new(Recorder::default());
    let engine = Arc::new(
        FeedEngine::new(config, store.clone(), recorder.clone()).expect("engine builds"),
    );
    Harness {
        engine,
        store,
        recorder,
    }
}

pub fn subscription(kind: FeedKind, url: String) -> NewSubscription {
    NewSubscription {
        kind,
        url,
        channel: "alerts".into(),
        name: Some("County Emergency Alerts".into()),
        check_interval_seconds: 300,
        output_format: None,
        send_interval_seconds: None,
        filter: None,
        sort: None,
        api_config: None,
    }
}

pub fn rss_body(items: &[(&str, &str)]) -> String {
    let entries: String = items
        .iter()
        .map(|(guid, title)| {
            format!(
                "<item><guid>{guid}</guid><title>{title}</title>\
                 <link>https://example.com/{guid}</link>\
                 <description>{title} details</description>\
                 <pubDate>Mon, 06 Jan 2025 10:00:00 GMT</pubDate></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Alerts</title><link>https://example.com</link>
<description>Test feed</description>{entries}</channel></rss>"#
    )
}
