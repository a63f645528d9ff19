use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::dispatch::DispatchQueue;
use crate::fetcher::Fetcher;
use crate::template::{RenderContext, Template};
use crate::types::{
    ChannelSender, CheckOutcome, FeedStore, FeedSubscription, Item, Outgoing, Result,
    SubscriptionId,
};
use crate::{filter, normalizer, sort};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Counts from one pipeline pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub fetched: usize,
    pub matched: usize,
    pub queued: usize,
}

/// A rendered item returned by a dry run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewItem {
    pub id: String,
    pub title: String,
    pub message: String,
}

/// Runs the fetch → normalize → sort → filter → dedup → render → enqueue
/// pipeline for one subscription at a time.
pub struct FeedEngine {
    config: EngineConfig,
    store: Arc<dyn FeedStore>,
    fetcher: Fetcher,
    dedup: Arc<Deduplicator>,
    dispatch: DispatchQueue,
}

impl FeedEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn FeedStore>,
        sender: Arc<dyn ChannelSender>,
    ) -> Result<Self> {
        let fetcher = Fetcher::new(config.fetch_config())?;
        Ok(Self::with_fetcher(config, store, sender, fetcher))
    }

    pub fn with_fetcher(
        config: EngineConfig,
        store: Arc<dyn FeedStore>,
        sender: Arc<dyn ChannelSender>,
        fetcher: Fetcher,
    ) -> Self {
        let dedup = Arc::new(Deduplicator::new(store.clone(), config.seen_capacity));
        let dispatch = DispatchQueue::new(
            sender,
            store.clone(),
            dedup.clone(),
            config.default_send_interval(),
        );
        Self {
            config,
            store,
            fetcher,
            dedup,
            dispatch,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn FeedStore> {
        &self.store
    }

    pub fn dispatch(&self) -> &DispatchQueue {
        &self.dispatch
    }

    fn template_for(&self, subscription: &FeedSubscription) -> Result<Template> {
        let source = subscription
            .output_format
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(&self.config.default_output_format);
        Template::parse(source)
    }

    /// One full pass. The outcome is persisted with the subscription's error
    /// bookkeeping; failures never disable the subscription.
    pub async fn run_pass(&self, subscription: &FeedSubscription) -> Result<PassReport> {
        let result = self.process(subscription).await;
        let now = Utc::now();

        match result {
            Ok(report) => {
                self.store
                    .record_check(subscription.id, now, CheckOutcome::Success)
                    .await?;
                info!(
                    subscription_id = subscription.id,
                    channel = %subscription.channel,
                    fetched = report.fetched,
                    matched = report.matched,
                    queued = report.queued,
                    "feed check complete"
                );
                Ok(report)
            }
            Err(e) => {
                let outcome = CheckOutcome::Failure {
                    error_type: e.kind().to_string(),
                    message: e.to_string(),
                };
                let failures = self
                    .store
                    .record_check(subscription.id, now, outcome)
                    .await?;
                if failures >= self.config.error_alert_threshold {
                    error!(
                        subscription_id = subscription.id,
                        url = %subscription.url,
                        consecutive_errors = failures,
                        "feed keeps failing: {}",
                        e
                    );
                } else {
                    warn!(
                        subscription_id = subscription.id,
                        url = %subscription.url,
                        consecutive_errors = failures,
                        "feed check failed: {}",
                        e
                    );
                }
                Err(e)
            }
        }
    }

    async fn process(&self, subscription: &FeedSubscription) -> Result<PassReport> {
        let template = self.template_for(subscription)?;
        let (items, fetched) = self.collect(subscription).await?;
        let matched = items.len();

        let fresh = self.dedup.filter_new(subscription.id, items).await?;
        self.dedup
            .mark_pending(subscription.id, fresh.iter().map(|i| i.id.clone()))
            .await;

        let ctx = RenderContext {
            feed_name: subscription.display_name(),
            now: Utc::now(),
        };
        let queued = fresh.len();
        for item in fresh {
            let text = template.render_message(&item, &ctx, self.config.max_message_length);
            self.dispatch
                .enqueue(
                    subscription,
                    Outgoing {
                        subscription_id: subscription.id,
                        channel: subscription.channel.clone(),
                        item_id: item.id,
                        item_title: item.title,
                        text,
                    },
                )
                .await;
        }

        Ok(PassReport {
            fetched,
            matched,
            queued,
        })
    }

    /// Fetched items after sorting, filtering and the per-check cap, with
    /// the raw fetched count.
    async fn collect(&self, subscription: &FeedSubscription) -> Result<(Vec<Item>, usize)> {
        let payload = self.fetcher.fetch(subscription).await?;
        let items = normalizer::normalize(&payload, subscription);
        let fetched = items.len();
        let items = sort::sort(items, subscription.sort.as_ref());
        let items = filter::apply(items, subscription.filter.as_ref());
        let items: Vec<Item> = items
            .into_iter()
            .take(self.config.max_items_per_check)
            .collect();
        debug!(
            subscription_id = subscription.id,
            fetched,
            kept = items.len(),
            "items sorted and filtered"
        );
        Ok((items, fetched))
    }

    /// Dry run for administrative testing: renders up to `limit` items and
    /// leaves dedup state and the dispatch queue alone.
    pub async fn preview(
        &self,
        subscription: &FeedSubscription,
        limit: usize,
    ) -> Result<Vec<PreviewItem>> {
        let template = self.template_for(subscription)?;
        let (items, _) = self.collect(subscription).await?;
        let ctx = RenderContext {
            feed_name: subscription.display_name(),
            now: Utc::now(),
        };
        Ok(items
            .into_iter()
            .take(limit)
            .map(|item| PreviewItem {
                message: template.render_message(&item, &ctx, self.config.max_message_length),
                id: item.id,
                title: item.title,
            })
            .collect())
    }

    /// Releases per-subscription runtime state after an unsubscribe.
    pub async fn forget(&self, id: SubscriptionId) {
        self.dispatch.close(id).await;
        self.dedup.forget(id).await;
    }

    pub async fn shutdown(&self) {
        self.dispatch.shutdown().await;
    }
}
