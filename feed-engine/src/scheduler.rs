//! Per-subscription timers driving the feed pipeline.

use crate::engine::{FeedEngine, PassReport};
use crate::types::{EngineError, Result, SubscriptionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct Timer {
    period: Duration,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns one periodic task per enabled subscription.
///
/// Each pass re-reads its subscription, so a disable or delete takes effect
/// before the next tick even between two `sync` calls. A per-subscription
/// guard keeps at most one pass in flight; a tick that finds the previous
/// pass still running is skipped.
pub struct Scheduler {
    engine: Arc<FeedEngine>,
    timers: Mutex<HashMap<SubscriptionId, Timer>>,
    in_flight: Mutex<HashMap<SubscriptionId, Arc<Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(engine: Arc<FeedEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            timers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn engine(&self) -> &Arc<FeedEngine> {
        &self.engine
    }

    async fn guard_for(&self, id: SubscriptionId) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs one pass unless another is already in flight or the
    /// subscription is gone or disabled.
    async fn run_guarded(&self, id: SubscriptionId) -> Result<Option<PassReport>> {
        let guard = self.guard_for(id).await;
        let Ok(_running) = guard.try_lock() else {
            debug!(subscription_id = id, "previous pass still running, skipping tick");
            return Ok(None);
        };

        let Some(subscription) = self.engine.store().get_subscription(id).await? else {
            debug!(subscription_id = id, "subscription no longer exists");
            return Ok(None);
        };
        if !subscription.enabled {
            debug!(subscription_id = id, "subscription disabled, skipping");
            return Ok(None);
        }
        self.engine.run_pass(&subscription).await.map(Some)
    }

    /// Manual refresh. `Ok(None)` means a pass was already running or the
    /// subscription is disabled.
    pub async fn trigger(&self, id: SubscriptionId) -> Result<Option<PassReport>> {
        if self.engine.store().get_subscription(id).await?.is_none() {
            return Err(EngineError::SubscriptionNotFound { id });
        }
        self.run_guarded(id).await
    }

    /// Reconciles timers with the store: starts timers for newly enabled
    /// subscriptions, restarts those whose interval changed and stops the
    /// rest. Stopping never interrupts a pass that is already running.
    pub async fn sync(self: &Arc<Self>) -> Result<()> {
        let subscriptions = self.engine.store().list_subscriptions(None).await?;
        let wanted: HashMap<SubscriptionId, Duration> = subscriptions
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.id, s.check_interval()))
            .collect();

        let mut timers = self.timers.lock().await;

        let stale: Vec<SubscriptionId> = timers
            .iter()
            .filter(|(id, timer)| wanted.get(id) != Some(&timer.period))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(timer) = timers.remove(&id) {
                let _ = timer.stop.send(true);
                debug!(subscription_id = id, "timer stopped");
            }
        }

        for (id, period) in wanted {
            if timers.contains_key(&id) {
                continue;
            }
            let (stop, stop_rx) = watch::channel(false);
            let task = tokio::spawn(self.clone().run_timer(id, period, stop_rx));
            timers.insert(id, Timer { period, stop, task });
            info!(
                subscription_id = id,
                interval_seconds = period.as_secs(),
                "timer started"
            );
        }
        Ok(())
    }

    async fn run_timer(
        self: Arc<Self>,
        id: SubscriptionId,
        period: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // Pass failures are recorded and logged by the engine.
                    if let Err(e) = self.run_guarded(id).await {
                        debug!(subscription_id = id, "scheduled pass failed: {}", e);
                    }
                }
            }
        }
        debug!(subscription_id = id, "timer task exited");
    }

    pub async fn active_timers(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Syncs every `sync_interval` until `shutdown` flips to true, then
    /// stops all timers and waits for in-flight passes to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.engine.config().sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!("scheduler sync failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop_all().await;
        self.engine.shutdown().await;
        info!("scheduler stopped");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let timers: Vec<(SubscriptionId, Timer)> = self.timers.lock().await.drain().collect();
        for (id, timer) in timers {
            let _ = timer.stop.send(true);
            if let Err(e) = timer.task.await {
                warn!(subscription_id = id, "timer task ended abnormally: {}", e);
            }
        }
    }
}
