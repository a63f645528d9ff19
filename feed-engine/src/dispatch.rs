use crate::dedup::Deduplicator;
use crate::types::{
    ActivityRecord, ChannelSender, FeedStore, FeedSubscription, Outgoing, SubscriptionId,
};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Pending {
    message: Outgoing,
    retried: bool,
}

#[derive(Default)]
struct LaneState {
    queue: VecDeque<Pending>,
    interval: Duration,
}

/// One subscription's FIFO plus the wakeup for its pump.
struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
    closed: AtomicBool,
}

struct Collaborators {
    sender: Arc<dyn ChannelSender>,
    store: Arc<dyn FeedStore>,
    dedup: Arc<Deduplicator>,
}

/// Paces rendered messages to the channel sender, one pump task per
/// subscription so a slow channel never holds up the others.
pub struct DispatchQueue {
    collaborators: Arc<Collaborators>,
    default_interval: Duration,
    lanes: Mutex<HashMap<SubscriptionId, (Arc<Lane>, JoinHandle<()>)>>,
}

impl DispatchQueue {
    pub fn new(
        sender: Arc<dyn ChannelSender>,
        store: Arc<dyn FeedStore>,
        dedup: Arc<Deduplicator>,
        default_interval: Duration,
    ) -> Self {
        Self {
            collaborators: Arc::new(Collaborators {
                sender,
                store,
                dedup,
            }),
            default_interval,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn interval_for(&self, subscription: &FeedSubscription) -> Duration {
        subscription
            .send_interval_seconds
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.default_interval)
    }

    /// Appends a message to the subscription's queue, starting its pump on
    /// first use.
    pub async fn enqueue(&self, subscription: &FeedSubscription, message: Outgoing) {
        let interval = self.interval_for(subscription);
        let lane = {
            let mut lanes = self.lanes.lock().await;
            let (lane, _) = lanes.entry(subscription.id).or_insert_with(|| {
                let lane = Arc::new(Lane {
                    state: Mutex::new(LaneState::default()),
                    notify: Notify::new(),
                    closed: AtomicBool::new(false),
                });
                let task = tokio::spawn(pump(
                    subscription.id,
                    lane.clone(),
                    self.collaborators.clone(),
                ));
                (lane, task)
            });
            lane.clone()
        };

        {
            let mut state = lane.state.lock().await;
            state.interval = interval;
            state.queue.push_back(Pending {
                message,
                retried: false,
            });
            debug!(
                subscription_id = subscription.id,
                pending = state.queue.len(),
                "message enqueued"
            );
        }
        lane.notify.notify_one();
    }

    pub async fn pending(&self, id: SubscriptionId) -> usize {
        let lane = self.lanes.lock().await.get(&id).map(|(lane, _)| lane.clone());
        match lane {
            Some(lane) => lane.state.lock().await.queue.len(),
            None => 0,
        }
    }

    /// Stops a subscription's pump and discards whatever it still holds.
    pub async fn close(&self, id: SubscriptionId) {
        let Some((lane, task)) = self.lanes.lock().await.remove(&id) else {
            return;
        };
        lane.closed.store(true, Ordering::SeqCst);
        lane.notify.notify_one();
        let dropped: Vec<String> = lane
            .state
            .lock()
            .await
            .queue
            .drain(..)
            .map(|p| p.message.item_id)
            .collect();
        if let Err(e) = task.await {
            warn!(subscription_id = id, "dispatch pump ended abnormally: {}", e);
        }
        for item_id in &dropped {
            self.collaborators.dedup.release(id, item_id).await;
        }
        if !dropped.is_empty() {
            info!(subscription_id = id, dropped = dropped.len(), "discarded queued messages");
        }
    }

    pub async fn shutdown(&self) {
        let ids: Vec<SubscriptionId> = self.lanes.lock().await.keys().copied().collect();
        for id in ids {
            self.close(id).await;
        }
    }
}

async fn pump(id: SubscriptionId, lane: Arc<Lane>, collab: Arc<Collaborators>) {
    let mut last_pop: Option<Instant> = None;

    loop {
        // Wait for work.
        let interval = loop {
            if lane.closed.load(Ordering::SeqCst) {
                return;
            }
            {
                let state = lane.state.lock().await;
                if !state.queue.is_empty() {
                    break state.interval;
                }
            }
            lane.notify.notified().await;
        };

        if let Some(last) = last_pop {
            tokio::time::sleep_until(last + interval).await;
        }
        if lane.closed.load(Ordering::SeqCst) {
            return;
        }

        let Some(pending) = lane.state.lock().await.queue.pop_front() else {
            continue;
        };
        last_pop = Some(Instant::now());

        let message = &pending.message;
        match collab.sender.send(&message.channel, &message.text).await {
            Ok(()) => {
                debug!(subscription_id = id, channel = %message.channel, item_id = %message.item_id, "message sent");
                delivered(id, message, &collab).await;
            }
            Err(e) if !pending.retried => {
                warn!(subscription_id = id, channel = %message.channel, "send failed, requeueing once: {}", e);
                lane.state.lock().await.queue.push_front(Pending {
                    message: pending.message,
                    retried: true,
                });
            }
            Err(e) => {
                warn!(subscription_id = id, channel = %message.channel, item_id = %message.item_id, "send failed again, dropping message: {}", e);
                collab.dedup.release(id, &message.item_id).await;
            }
        }
    }
}

async fn delivered(id: SubscriptionId, message: &Outgoing, collab: &Collaborators) {
    if let Err(e) = collab
        .dedup
        .record(id, std::slice::from_ref(&message.item_id))
        .await
    {
        warn!(subscription_id = id, item_id = %message.item_id, "failed to record delivered item: {}", e);
    }
    let activity = ActivityRecord {
        subscription_id: id,
        item_id: message.item_id.clone(),
        item_title: message.item_title.clone(),
        message: message.text.clone(),
        processed_at: Utc::now(),
    };
    if let Err(e) = collab.store.record_activity(activity).await {
        warn!(subscription_id = id, "failed to record activity: {}", e);
    }
}
