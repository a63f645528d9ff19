use crate::types::{FeedStore, Item, Result, SubscriptionId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Decides which items are new for a subscription.
///
/// Membership in the durable seen-set is the only criterion; ordering and id
/// monotonicity are never consulted. Items that are queued but not yet sent
/// are held in an in-memory pending set so the next pass does not enqueue
/// them a second time.
pub struct Deduplicator {
    store: Arc<dyn FeedStore>,
    capacity: usize,
    pending: Mutex<HashMap<SubscriptionId, HashSet<String>>>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn FeedStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Items whose ids are neither delivered, queued, nor repeated earlier in
    /// the same batch. Order is preserved.
    pub async fn filter_new(&self, id: SubscriptionId, items: Vec<Item>) -> Result<Vec<Item>> {
        let seen = self.store.seen_ids(id).await?;
        let pending = self.pending.lock().await;
        let queued = pending.get(&id);

        let total = items.len();
        let mut batch = HashSet::new();
        let fresh: Vec<Item> = items
            .into_iter()
            .filter(|item| {
                !seen.contains(&item.id)
                    && !queued.is_some_and(|q| q.contains(&item.id))
                    && batch.insert(item.id.clone())
            })
            .collect();

        debug!(subscription_id = id, total, new = fresh.len(), "dedup filtered batch");
        Ok(fresh)
    }

    pub async fn mark_pending<I>(&self, id: SubscriptionId, item_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut pending = self.pending.lock().await;
        pending.entry(id).or_default().extend(item_ids);
    }

    /// Durably records delivered ids; called only after a successful send.
    pub async fn record(&self, id: SubscriptionId, item_ids: &[String]) -> Result<()> {
        if item_ids.is_empty() {
            return Ok(());
        }
        self.store.add_seen(id, item_ids, self.capacity).await?;
        let mut pending = self.pending.lock().await;
        if let Some(set) = pending.get_mut(&id) {
            for item_id in item_ids {
                set.remove(item_id);
            }
        }
        Ok(())
    }

    /// Drops a pending id after its message was abandoned, so a later pass
    /// may try it again.
    pub async fn release(&self, id: SubscriptionId, item_id: &str) {
        let mut pending = self.pending.lock().await;
        if let Some(set) = pending.get_mut(&id) {
            set.remove(item_id);
        }
    }

    pub async fn forget(&self, id: SubscriptionId) {
        self.pending.lock().await.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::{FeedKind, MemoryFeedStore, NewSubscription};
    use serde_json::json;

    fn item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            title: format!("title {id}"),
            body: String::new(),
            link: String::new(),
            timestamp: None,
            raw: json!({}),
        }
    }

    async fn setup() -> (Arc<dyn FeedStore>, SubscriptionId) {
        let store: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
        let sub = store
            .insert_subscription(NewSubscription {
                kind: FeedKind::Rss,
                url: "https://example.com/rss".into(),
                channel: "alerts".into(),
                name: None,
                check_interval_seconds: 300,
                output_format: None,
                send_interval_seconds: None,
                filter: None,
                sort: None,
                api_config: None,
            })
            .await
            .unwrap();
        (store, sub.id)
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[tokio::test]
    async fn recorded_ids_are_filtered_regardless_of_order() {
        let (store, id) = setup().await;
        let dedup = Deduplicator::new(store, 100);

        let first = dedup
            .filter_new(id, vec![item("a"), item("b"), item("c")])
            .await
            .unwrap();
        assert_eq!(ids(&first), vec!["a", "b", "c"]);
        dedup
            .record(id, &["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();

        let reordered = dedup
            .filter_new(id, vec![item("c"), item("d"), item("a"), item("b")])
            .await
            .unwrap();
        assert_eq!(ids(&reordered), vec!["d"]);
    }

    #[tokio::test]
    async fn pending_items_are_not_offered_twice_until_released() {
        let (store, id) = setup().await;
        let dedup = Deduplicator::new(store, 100);

        dedup.mark_pending(id, vec!["a".to_string()]).await;
        let again = dedup.filter_new(id, vec![item("a"), item("b")]).await.unwrap();
        assert_eq!(ids(&again), vec!["b"]);

        dedup.release(id, "a").await;
        let retry = dedup.filter_new(id, vec![item("a")]).await.unwrap();
        assert_eq!(ids(&retry), vec!["a"]);
    }

    #[tokio::test]
    async fn duplicates_within_a_batch_collapse() {
        let (store, id) = setup().await;
        let dedup = Deduplicator::new(store, 100);
        let fresh = dedup
            .filter_new(id, vec![item("x"), item("y"), item("x")])
            .await
            .unwrap();
        assert_eq!(ids(&fresh), vec!["x", "y"]);
    }
}
