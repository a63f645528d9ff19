use crate::feed_utils;
use crate::parser::FeedParser;
use crate::rate_limiter::RateLimiter;
use crate::types::{
    ApiConfig, EngineError, FeedKind, FeedSubscription, FetchConfig, RawPayload, Result,
};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::{Client, Method, Response};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: RateLimiter,
    parser: FeedParser,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let rate_limiter = RateLimiter::new(config.rate_limit);
        Self::with_rate_limiter(config, rate_limiter)
    }

    /// Builds a fetcher that shares an existing per-origin limiter.
    pub fn with_rate_limiter(config: FetchConfig, rate_limiter: RateLimiter) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            rate_limiter,
            parser: FeedParser::new(),
        })
    }

    /// Fetches and decodes one subscription's source. Every attempt waits for
    /// its origin's rate-limit slot first.
    pub async fn fetch(&self, subscription: &FeedSubscription) -> Result<RawPayload> {
        let url = subscription.url.as_str();
        if !feed_utils::url::is_valid_feed_url(url) {
            return Err(EngineError::InvalidUrl(url.to_string()));
        }

        let start_time = Instant::now();
        let delay = Duration::from_millis(self.config.retry_delay_ms.max(1));
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: delay,
            initial_interval: delay,
            max_interval: delay * 32,
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.timeout_seconds * 4)),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            self.rate_limiter.wait_for_url(url).await;

            match self.fetch_once(subscription).await {
                Ok(payload) => {
                    debug!(
                        subscription_id = subscription.id,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "fetched {}",
                        url
                    );
                    return Ok(payload);
                }
                Err(e) if attempt < self.config.max_retries && is_transient(&e) => {
                    attempt += 1;
                    let Some(wait) = backoff.next_backoff() else {
                        return Err(e);
                    };
                    warn!(
                        subscription_id = subscription.id,
                        attempt,
                        "fetch of {} failed ({}), retrying in {:?}",
                        url,
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, subscription: &FeedSubscription) -> Result<RawPayload> {
        match subscription.kind {
            FeedKind::Rss => {
                let response = self.client.get(&subscription.url).send().await?;
                let content = success_body(&subscription.url, response).await?;
                let feed = self.parser.parse_feed(&content).map_err(|e| EngineError::Fetch {
                    url: subscription.url.clone(),
                    status: None,
                    reason: format!("malformed feed body: {}", e),
                })?;
                info!(
                    subscription_id = subscription.id,
                    entries = feed.entries.len(),
                    "fetched RSS feed {}",
                    subscription.url
                );
                Ok(RawPayload::Feed(feed))
            }
            FeedKind::Api => {
                let defaults = ApiConfig::default();
                let api = subscription.api_config.as_ref().unwrap_or(&defaults);
                let response = self.build_api_request(&subscription.url, api)?.send().await?;
                let content = success_body(&subscription.url, response).await?;
                let body: Value =
                    serde_json::from_str(&content).map_err(|e| EngineError::Fetch {
                        url: subscription.url.clone(),
                        status: None,
                        reason: format!("malformed JSON body: {}", e),
                    })?;
                info!(
                    subscription_id = subscription.id,
                    bytes = content.len(),
                    "fetched API feed {}",
                    subscription.url
                );
                Ok(RawPayload::Json(body))
            }
        }
    }

    fn build_api_request(&self, url: &str, api: &ApiConfig) -> Result<reqwest::RequestBuilder> {
        let method = Method::from_bytes(api.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| EngineError::Config(format!("unsupported HTTP method '{}'", api.method)))?;

        let mut request = self
            .client
            .request(method.clone(), url)
            .header(reqwest::header::ACCEPT, "application/json");
        for (name, value) in &api.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !api.params.is_empty() {
            request = request.query(&api.params);
        }
        if method == Method::POST {
            if let Some(body) = &api.body {
                request = request.json(body);
            }
        }
        Ok(request)
    }
}

async fn success_body(url: &str, response: Response) -> Result<String> {
    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Fetch {
            url: url.to_string(),
            status: Some(status.as_u16()),
            reason: format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ),
        });
    }
    Ok(response.text().await?)
}

/// Network failures and server-side statuses are worth another attempt;
/// client errors and bad bodies are not.
fn is_transient(error: &EngineError) -> bool {
    match error {
        EngineError::Http(_) => true,
        EngineError::Fetch {
            status: Some(code),
            ..
        } => *code == 429 || (500..600).contains(code),
        _ => false,
    }
}
