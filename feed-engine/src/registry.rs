use crate::engine::{FeedEngine, PreviewItem};
use crate::feed_utils;
use crate::filter;
use crate::template;
use crate::types::{
    ActivityRecord, ApiConfig, EngineError, ErrorRecord, FeedKind, FeedStats, FeedStore,
    FeedSubscription, FilterSpec, NewSubscription, Result, SortSpec, SubscriptionId,
    SubscriptionUpdate,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Items rendered by the administrative `test` command.
pub const PREVIEW_LIMIT: usize = 3;

/// A subscribe request before defaults are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub kind: FeedKind,
    pub url: String,
    pub channel: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub check_interval_seconds: Option<u64>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub send_interval_seconds: Option<f64>,
    #[serde(default)]
    pub filter: Option<FilterSpec>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub api_config: Option<ApiConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsubscribeTarget {
    Id(SubscriptionId),
    Url { url: String, channel: String },
}

/// One subscription with its recent history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStatus {
    pub subscription: FeedSubscription,
    pub recent_activity: Vec<ActivityRecord>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// The administrative surface over the subscription catalog. Every change is
/// validated before it reaches the store.
pub struct FeedRegistry {
    store: Arc<dyn FeedStore>,
    engine: Arc<FeedEngine>,
}

impl FeedRegistry {
    pub fn new(engine: Arc<FeedEngine>) -> Self {
        Self {
            store: engine.store().clone(),
            engine,
        }
    }

    pub async fn subscribe(&self, request: SubscriptionRequest) -> Result<FeedSubscription> {
        let new = self.resolve(request)?;
        let created = self.store.insert_subscription(new).await?;
        info!(
            subscription_id = created.id,
            channel = %created.channel,
            kind = %created.kind,
            "subscribed to {}",
            created.url
        );
        Ok(created)
    }

    /// Removes matching subscriptions; removing nothing is not an error.
    pub async fn unsubscribe(&self, target: UnsubscribeTarget) -> Result<usize> {
        let ids: Vec<SubscriptionId> = match &target {
            UnsubscribeTarget::Id(id) => vec![*id],
            UnsubscribeTarget::Url { url, channel } => self
                .store
                .list_subscriptions(Some(channel))
                .await?
                .into_iter()
                .filter(|s| s.url == *url)
                .map(|s| s.id)
                .collect(),
        };

        let removed = match &target {
            UnsubscribeTarget::Id(id) => self.store.delete_subscription(*id).await?,
            UnsubscribeTarget::Url { url, channel } => {
                self.store.delete_subscription_by_url(url, channel).await?
            }
        };
        for id in ids {
            self.engine.forget(id).await;
        }
        info!(removed, "unsubscribe {:?}", target);
        Ok(removed)
    }

    pub async fn list(&self, channel: Option<&str>) -> Result<Vec<FeedSubscription>> {
        Ok(self.store.list_subscriptions(channel).await?)
    }

    pub async fn get(&self, id: SubscriptionId) -> Result<FeedSubscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or(EngineError::SubscriptionNotFound { id })
    }

    pub async fn status(&self, id: SubscriptionId) -> Result<SubscriptionStatus> {
        let subscription = self.get(id).await?;
        Ok(SubscriptionStatus {
            subscription,
            recent_activity: self.store.activity(id, 5).await?,
            recent_errors: self.store.errors(id, 5).await?,
        })
    }

    pub async fn enable(&self, id: SubscriptionId) -> Result<FeedSubscription> {
        self.set_enabled(id, true).await
    }

    /// Soft delete: the subscription stays in the catalog but is no longer
    /// scheduled.
    pub async fn disable(&self, id: SubscriptionId) -> Result<FeedSubscription> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: SubscriptionId, enabled: bool) -> Result<FeedSubscription> {
        let update = SubscriptionUpdate {
            enabled: Some(enabled),
            ..Default::default()
        };
        let updated = self
            .store
            .update_subscription(id, update)
            .await?
            .ok_or(EngineError::SubscriptionNotFound { id })?;
        info!(subscription_id = id, enabled, "subscription toggled");
        Ok(updated)
    }

    pub async fn update(
        &self,
        id: SubscriptionId,
        update: SubscriptionUpdate,
    ) -> Result<FeedSubscription> {
        if update.is_empty() {
            return Err(EngineError::Config("update contains no changes".into()));
        }

        // Validate the merged result so partial updates cannot produce an
        // invalid subscription.
        let mut merged = self.get(id).await?;
        update.clone().apply_to(&mut merged, Utc::now());
        validate(&NewSubscription {
            kind: merged.kind,
            url: merged.url,
            channel: merged.channel,
            name: merged.name,
            check_interval_seconds: merged.check_interval_seconds,
            output_format: merged.output_format,
            send_interval_seconds: merged.send_interval_seconds,
            filter: merged.filter,
            sort: merged.sort,
            api_config: merged.api_config,
        })?;

        let updated = self
            .store
            .update_subscription(id, update)
            .await?
            .ok_or(EngineError::SubscriptionNotFound { id })?;
        info!(subscription_id = id, "subscription updated");
        Ok(updated)
    }

    /// Dry run of a stored subscription.
    pub async fn test(&self, id: SubscriptionId) -> Result<Vec<PreviewItem>> {
        let subscription = self.get(id).await?;
        self.engine.preview(&subscription, PREVIEW_LIMIT).await
    }

    /// Dry run of a subscription that has not been saved yet.
    pub async fn test_request(&self, request: SubscriptionRequest) -> Result<Vec<PreviewItem>> {
        let new = self.resolve(request)?;
        let now = Utc::now();
        let transient = FeedSubscription {
            id: 0,
            kind: new.kind,
            url: new.url,
            channel: new.channel,
            name: new.name,
            check_interval_seconds: new.check_interval_seconds,
            output_format: new.output_format,
            send_interval_seconds: new.send_interval_seconds,
            filter: new.filter,
            sort: new.sort,
            api_config: new.api_config,
            enabled: true,
            last_checked: None,
            error_count: 0,
            last_error: None,
            last_item_id: None,
            created_at: now,
            updated_at: now,
        };
        self.engine.preview(&transient, PREVIEW_LIMIT).await
    }

    pub async fn activity(&self, id: SubscriptionId, limit: usize) -> Result<Vec<ActivityRecord>> {
        Ok(self.store.activity(id, limit).await?)
    }

    pub async fn errors(&self, id: SubscriptionId, limit: usize) -> Result<Vec<ErrorRecord>> {
        Ok(self.store.errors(id, limit).await?)
    }

    pub async fn stats(&self) -> Result<FeedStats> {
        Ok(self.store.stats(Utc::now()).await?)
    }

    fn resolve(&self, request: SubscriptionRequest) -> Result<NewSubscription> {
        let config = self.engine.config();
        let check_interval_seconds = request
            .check_interval_seconds
            .unwrap_or(config.default_check_interval_seconds);
        let api_config = match request.kind {
            FeedKind::Api => Some(request.api_config.unwrap_or_default()),
            FeedKind::Rss => request.api_config,
        };

        let new = NewSubscription {
            kind: request.kind,
            url: request.url.trim().to_string(),
            channel: request.channel.trim().to_string(),
            name: request.name.filter(|n| !n.trim().is_empty()),
            check_interval_seconds,
            output_format: request.output_format.filter(|f| !f.trim().is_empty()),
            send_interval_seconds: request.send_interval_seconds,
            filter: request.filter,
            sort: request.sort,
            api_config,
        };
        validate(&new)?;
        Ok(new)
    }
}

fn validate(sub: &NewSubscription) -> Result<()> {
    if !feed_utils::url::is_valid_feed_url(&sub.url) {
        return Err(EngineError::InvalidUrl(sub.url.clone()));
    }
    if sub.channel.trim().is_empty() {
        return Err(EngineError::Config("channel must not be empty".into()));
    }
    if sub.check_interval_seconds == 0 {
        return Err(EngineError::Config("check interval must be positive".into()));
    }
    if let Some(seconds) = sub.send_interval_seconds {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(EngineError::Config(
                "send interval must be a non-negative number".into(),
            ));
        }
    }
    if let Some(format) = &sub.output_format {
        template::validate(format)?;
    }
    if let Some(spec) = &sub.filter {
        filter::validate(spec).map_err(EngineError::Config)?;
    }
    if let (FeedKind::Api, Some(api)) = (sub.kind, &sub.api_config) {
        let method = api.method.trim().to_ascii_uppercase();
        if method != "GET" && method != "POST" {
            return Err(EngineError::Config(format!(
                "unsupported HTTP method '{}'",
                api.method
            )));
        }
    }
    Ok(())
}
