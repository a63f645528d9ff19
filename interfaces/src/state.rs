use crate::defs::{
    ActivityRecord, CheckOutcome, ErrorRecord, FeedStats, FeedSubscription, NewSubscription,
    SubscriptionId, SubscriptionUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable storage for subscriptions, their cursor/error fields, and the
/// per-subscription seen-sets used for deduplication.
///
/// Implementations serialize writes per subscription id: `record_check`
/// and `add_seen` must be atomic with respect to each other.
#[async_trait]
pub trait FeedStore: Send + Sync {
    async fn insert_subscription(&self, new: NewSubscription) -> StoreResult<FeedSubscription>;

    async fn get_subscription(&self, id: SubscriptionId) -> StoreResult<Option<FeedSubscription>>;

    /// All subscriptions ordered by id, optionally restricted to one channel.
    async fn list_subscriptions(&self, channel: Option<&str>)
        -> StoreResult<Vec<FeedSubscription>>;

    async fn update_subscription(
        &self,
        id: SubscriptionId,
        update: SubscriptionUpdate,
    ) -> StoreResult<Option<FeedSubscription>>;

    /// Returns the number of rows removed (0 when already absent).
    async fn delete_subscription(&self, id: SubscriptionId) -> StoreResult<usize>;

    async fn delete_subscription_by_url(&self, url: &str, channel: &str) -> StoreResult<usize>;

    /// Atomically stamps `last_checked` and adjusts the consecutive error
    /// count. Returns the new error count.
    async fn record_check(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
        outcome: CheckOutcome,
    ) -> StoreResult<u32>;

    async fn seen_ids(&self, id: SubscriptionId) -> StoreResult<HashSet<String>>;

    /// Adds ids as the newest entries and evicts the oldest beyond `capacity`.
    async fn add_seen(
        &self,
        id: SubscriptionId,
        item_ids: &[String],
        capacity: usize,
    ) -> StoreResult<()>;

    async fn record_activity(&self, record: ActivityRecord) -> StoreResult<()>;

    /// Newest first.
    async fn activity(&self, id: SubscriptionId, limit: usize) -> StoreResult<Vec<ActivityRecord>>;

    /// Newest first.
    async fn errors(&self, id: SubscriptionId, limit: usize) -> StoreResult<Vec<ErrorRecord>>;

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<FeedStats>;
}

#[derive(Default)]
struct MemoryState {
    next_id: SubscriptionId,
    next_error_id: i64,
    subscriptions: Vec<FeedSubscription>,
    seen: HashMap<SubscriptionId, VecDeque<String>>,
    activity: Vec<ActivityRecord>,
    errors: Vec<ErrorRecord>,
}

/// In-process store. Everything lives behind one lock, which trivially
/// serializes writes per subscription.
#[derive(Default)]
pub struct MemoryFeedStore {
    state: Mutex<MemoryState>,
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn insert_subscription(&self, new: NewSubscription) -> StoreResult<FeedSubscription> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let now = Utc::now();
        let sub = FeedSubscription {
            id: state.next_id,
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
        state.subscriptions.push(sub.clone());
        Ok(sub)
    }

    async fn get_subscription(&self, id: SubscriptionId) -> StoreResult<Option<FeedSubscription>> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn list_subscriptions(
        &self,
        channel: Option<&str>,
    ) -> StoreResult<Vec<FeedSubscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| channel.map_or(true, |c| s.channel == c))
            .cloned()
            .collect())
    }

    async fn update_subscription(
        &self,
        id: SubscriptionId,
        update: SubscriptionUpdate,
    ) -> StoreResult<Option<FeedSubscription>> {
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };
        update.apply_to(sub, Utc::now());
        Ok(Some(sub.clone()))
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != id);
        let removed = before - state.subscriptions.len();
        if removed > 0 {
            state.seen.remove(&id);
            state.errors.retain(|e| e.subscription_id != id);
        }
        Ok(removed)
    }

    async fn delete_subscription_by_url(&self, url: &str, channel: &str) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        let doomed: Vec<SubscriptionId> = state
            .subscriptions
            .iter()
            .filter(|s| s.url == url && s.channel == channel)
            .map(|s| s.id)
            .collect();
        state.subscriptions.retain(|s| !doomed.contains(&s.id));
        for id in &doomed {
            state.seen.remove(id);
        }
        state.errors.retain(|e| !doomed.contains(&e.subscription_id));
        Ok(doomed.len())
    }

    async fn record_check(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
        outcome: CheckOutcome,
    ) -> StoreResult<u32> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let error_id = state.next_error_id + 1;
        let Some(sub) = state.subscriptions.iter_mut().find(|s| s.id == id) else {
            return Ok(0);
        };
        sub.last_checked = Some(at);
        match outcome {
            CheckOutcome::Success => {
                sub.error_count = 0;
                sub.last_error = None;
                for err in state.errors.iter_mut().filter(|e| e.subscription_id == id) {
                    err.resolved_at.get_or_insert(at);
                }
                Ok(0)
            }
            CheckOutcome::Failure {
                error_type,
                message,
            } => {
                sub.error_count += 1;
                sub.last_error = Some(message.clone());
                let count = sub.error_count;
                state.next_error_id = error_id;
                state.errors.push(ErrorRecord {
                    id: error_id,
                    subscription_id: id,
                    error_type,
                    message,
                    occurred_at: at,
                    resolved_at: None,
                });
                Ok(count)
            }
        }
    }

    async fn seen_ids(&self, id: SubscriptionId) -> StoreResult<HashSet<String>> {
        let state = self.state.lock().await;
        Ok(state
            .seen
            .get(&id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_seen(
        &self,
        id: SubscriptionId,
        item_ids: &[String],
        capacity: usize,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let ids = state.seen.entry(id).or_default();
        for item_id in item_ids {
            // Re-seeing an id refreshes its recency.
            ids.retain(|existing| existing != item_id);
            ids.push_back(item_id.clone());
        }
        while ids.len() > capacity {
            ids.pop_front();
        }
        Ok(())
    }

    async fn record_activity(&self, record: ActivityRecord) -> StoreResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(sub) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == record.subscription_id)
        {
            sub.last_item_id = Some(record.item_id.clone());
        }
        state.activity.push(record);
        Ok(())
    }

    async fn activity(&self, id: SubscriptionId, limit: usize) -> StoreResult<Vec<ActivityRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .activity
            .iter()
            .rev()
            .filter(|a| a.subscription_id == id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn errors(&self, id: SubscriptionId, limit: usize) -> StoreResult<Vec<ErrorRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .errors
            .iter()
            .rev()
            .filter(|e| e.subscription_id == id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<FeedStats> {
        let state = self.state.lock().await;
        let day_ago = now - Duration::hours(24);
        let week_ago = now - Duration::days(7);

        let mut per_channel: HashMap<&str, usize> = HashMap::new();
        for sub in state.subscriptions.iter().filter(|s| s.enabled) {
            *per_channel.entry(sub.channel.as_str()).or_default() += 1;
        }
        let mut top_channels: Vec<(String, usize)> = per_channel
            .into_iter()
            .map(|(channel, count)| (channel.to_string(), count))
            .collect();
        top_channels.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_channels.truncate(10);

        Ok(FeedStats {
            total_subscriptions: state.subscriptions.len(),
            enabled_subscriptions: state.subscriptions.iter().filter(|s| s.enabled).count(),
            items_24h: state.activity.iter().filter(|a| a.processed_at > day_ago).count(),
            items_7d: state.activity.iter().filter(|a| a.processed_at > week_ago).count(),
            active_errors: state.errors.iter().filter(|e| e.resolved_at.is_none()).count(),
            top_channels,
        })
    }
}
