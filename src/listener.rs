//! The Listener / Poller: subscribes to the two publish-notify channels
//! and fires a periodic poll as a safety net, waking the Email Worker
//! and Webhook Dispatcher through their `Notify`
//! handles. Notifications are pure latency — losing one never stalls a
//! message, because the poll tick covers the same ground unconditionally.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::store::{MESSAGE_QUEUED_CHANNEL, Store, WEBHOOK_PENDING_CHANNEL};

pub struct Listener {
    store: Store,
    config: Arc<Config>,
    message_wake: Arc<Notify>,
    webhook_wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl Listener {
    pub fn new(
        store: Store,
        config: Arc<Config>,
        message_wake: Arc<Notify>,
        webhook_wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            message_wake,
            webhook_wake,
            shutdown,
        }
    }

    /// Spawns the two notification subscriptions and the poll timer, and
    /// fires both wake-ups once immediately to drain any backlog that
    /// accumulated while the process was down.
    pub fn spawn(self) -> JoinHandle<()> {
        self.message_wake.notify_one();
        self.webhook_wake.notify_one();

        let message_sub = spawn_subscription(
            self.store.clone(),
            MESSAGE_QUEUED_CHANNEL,
            self.message_wake.clone(),
            self.shutdown.clone(),
        );
        let webhook_sub = spawn_subscription(
            self.store.clone(),
            WEBHOOK_PENDING_CHANNEL,
            self.webhook_wake.clone(),
            self.shutdown.clone(),
        );

        tokio::spawn(async move {
            let poll_interval = StdDuration::from_millis(self.config.poll_interval_ms);
            // Default equal to the poll interval, per the "Crash recovery of
            // claimed rows" design note: a message can't be re-picked up any
            // sooner than the next tick anyway.
            let visibility_timeout = Duration::milliseconds(self.config.poll_interval_ms as i64);

            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // immediate tick; the initial sweep above already covered it

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("shutting down listener");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.store.reset_stale_processing(visibility_timeout).await {
                            Ok(0) => {}
                            Ok(reset) => warn!(reset, "visibility timeout reclaimed stalled messages"),
                            Err(error) => error!(%error, "visibility-timeout sweep failed"),
                        }
                        self.message_wake.notify_one();
                        self.webhook_wake.notify_one();
                    }
                }
            }

            message_sub.abort();
            webhook_sub.abort();
        })
    }
}

/// One long-lived subscription to `channel`. Reconnects with a short
/// back-off if the connection drops; a dropped connection only costs
/// latency, since the poll tick keeps draining the queue regardless.
fn spawn_subscription(
    store: Store,
    channel: &'static str,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let mut listener = match subscribe(&store, channel).await {
                Ok(listener) => listener,
                Err(error) => {
                    warn!(%error, channel, "failed to subscribe, retrying in 1s");
                    tokio::time::sleep(StdDuration::from_secs(1)).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    notification = listener.recv() => {
                        match notification {
                            Ok(_) => wake.notify_one(),
                            Err(error) => {
                                warn!(%error, channel, "notification connection lost, resubscribing");
                                break;
                            }
                        }
                    }
                }
            }
        }
    })
}

async fn subscribe(store: &Store, channel: &'static str) -> Result<sqlx::postgres::PgListener, crate::models::Error> {
    if channel == MESSAGE_QUEUED_CHANNEL {
        store.listen_messages().await
    } else {
        store.listen_webhooks().await
    }
}
