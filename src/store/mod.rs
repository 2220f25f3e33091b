//! The Store: the one piece of shared state. Bundles a repository per
//! entity plus the two publish-notify subscriptions the Listener drives.

use sqlx::PgPool;
use sqlx::postgres::PgListener;

use crate::models::{
    DomainStore, Error, MessageStore, SuppressionStore, WebhookDeliveryStore, WebhookStore,
};

pub const MESSAGE_QUEUED_CHANNEL: &str = "message_queued";
pub const WEBHOOK_PENDING_CHANNEL: &str = "webhook_pending";

#[derive(Clone)]
pub struct Store {
    pub messages: MessageStore,
    pub domains: DomainStore,
    pub suppressions: SuppressionStore,
    pub webhooks: WebhookStore,
    pub webhook_deliveries: WebhookDeliveryStore,
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self {
            messages: MessageStore::new(pool.clone()),
            domains: DomainStore::new(pool.clone()),
            suppressions: SuppressionStore::new(pool.clone()),
            webhooks: WebhookStore::new(pool.clone()),
            webhook_deliveries: WebhookDeliveryStore::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Subscribes to the `message_queued` channel. The notification payload
    /// is advisory only (it may be lost); callers must not depend on it for
    /// correctness, only for latency — the poller is the safety net.
    pub async fn listen_messages(&self) -> Result<PgListener, Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(MESSAGE_QUEUED_CHANNEL).await?;
        Ok(listener)
    }

    pub async fn listen_webhooks(&self) -> Result<PgListener, Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(WEBHOOK_PENDING_CHANNEL).await?;
        Ok(listener)
    }

    /// Crash recovery: resets `messages` rows stuck in `processing` past
    /// the visibility timeout back to `queued`. Without this a worker that
    /// dies mid-send leaves the message stalled forever (see the
    /// "Crash recovery of claimed rows" design note).
    pub async fn reset_stale_processing(
        &self,
        visibility_timeout: chrono::Duration,
    ) -> Result<u64, Error> {
        self.messages.reset_stale_processing(visibility_timeout).await
    }
}
