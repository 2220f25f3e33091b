//! The Webhook Dispatcher: claims pending `webhook_deliveries` rows, signs
//! them, and POSTs them to the subscribing endpoint with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::ids::WebhookId;
use crate::models::{WebhookDelivery, WebhookDeliveryStatus};
use crate::store::Store;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Store,
    client: Client,
    config: Arc<Config>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl WebhookDispatcher {
    pub fn new(store: Store, config: Arc<Config>, wake: Arc<Notify>, shutdown: CancellationToken) -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client configuration is static and always valid");

        Self {
            store,
            client,
            config,
            wake,
            shutdown,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("shutting down webhook dispatcher");
                        return;
                    }
                    _ = self.wake.notified() => {}
                }
                self.drain_queue().await;
            }
        })
    }

    async fn drain_queue(&self) {
        let permits = Arc::new(Semaphore::new(self.config.worker_concurrency));
        let mut tasks = JoinSet::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            let claimed = match self.store.webhook_deliveries.claim_next().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    break;
                }
                Err(error) => {
                    error!(%error, "failed to claim next webhook delivery");
                    drop(permit);
                    break;
                }
            };

            let dispatcher = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                dispatcher.process_delivery(claimed).await;
            });
        }

        while tasks.join_next().await.is_some() {}
    }

    #[tracing::instrument(skip(self, delivery), fields(delivery_id = %delivery.id))]
    async fn process_delivery(&self, delivery: WebhookDelivery) {
        let webhook = match self.store.webhooks.find_by_id(delivery.webhook_id).await {
            Ok(Some(webhook)) if webhook.active => webhook,
            Ok(_) => {
                warn!("webhook deleted or inactive, terminating delivery");
                self.finish(&delivery, WebhookDeliveryStatus::Failed).await;
                return;
            }
            Err(error) => {
                error!(%error, "failed to look up webhook for delivery");
                return;
            }
        };

        let body = delivery.payload.to_string();
        let timestamp = Utc::now().timestamp_millis();
        let signature = sign(&webhook.secret, timestamp, &body);

        let result = self
            .client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("X-Sendlane-Event", &delivery.event)
            .header("X-Sendlane-Timestamp", timestamp.to_string())
            .header("X-Sendlane-Signature", format!("v1={signature}"))
            .timeout(REQUEST_TIMEOUT)
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                self.finish(&delivery, WebhookDeliveryStatus::Delivered).await;
            }
            Ok(response) => {
                warn!(status = %response.status(), webhook_id = %webhook.id, "webhook delivery rejected");
                self.retry_or_fail(&delivery, webhook.id).await;
            }
            Err(error) => {
                warn!(%error, webhook_id = %webhook.id, "webhook delivery request failed");
                self.retry_or_fail(&delivery, webhook.id).await;
            }
        }
    }

    /// `claim_next` already bumped `attempts`; if that count has reached the
    /// ceiling this attempt is the last one. Otherwise the row is left in
    /// `pending` — the 30-second claim guard is the retry delay, no
    /// separate back-off timer is kept.
    async fn retry_or_fail(&self, delivery: &WebhookDelivery, webhook_id: WebhookId) {
        if delivery.attempts >= self.config.max_webhook_retries {
            warn!(%webhook_id, attempts = delivery.attempts, "webhook delivery exhausted retries");
            self.finish(delivery, WebhookDeliveryStatus::Failed).await;
        }
    }

    async fn finish(&self, delivery: &WebhookDelivery, status: WebhookDeliveryStatus) {
        let result = match status {
            WebhookDeliveryStatus::Delivered => self.store.webhook_deliveries.mark_delivered(delivery.id).await,
            _ => self.store.webhook_deliveries.mark_failed(delivery.id).await,
        };
        if let Err(error) = result {
            error!(%error, "failed to record webhook delivery outcome");
        }
    }
}

fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(format!("{timestamp}.{body}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, NewWebhook, NewWebhookDelivery, TenantStore, WebhookStore};
    use sqlx::PgPool;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher_for(store: Store, config: Config) -> WebhookDispatcher {
        WebhookDispatcher::new(store, Arc::new(config), Arc::new(Notify::new()), CancellationToken::new())
    }

    #[test]
    fn signature_is_reproducible() {
        let a = sign("shh", 1700000000000, r#"{"a":1}"#);
        let b = sign("shh", 1700000000000, r#"{"a":1}"#);
        assert_eq!(a, b);
        assert_ne!(a, sign("different", 1700000000000, r#"{"a":1}"#));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn successful_delivery_marks_delivered(pool: PgPool) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Sendlane-Event", "message.sent"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Store::new(pool.clone());
        let tenant = TenantStore::new(pool.clone())
            .create(&NewTenant {
                key_hash: "hash".to_string(),
                name: "T".to_string(),
                rate_limit_per_second: 10,
            })
            .await
            .unwrap();
        let webhook = WebhookStore::new(pool.clone())
            .create(&NewWebhook {
                tenant_id: tenant.id,
                url: format!("{}/hook", server.uri()),
                events: vec!["message.sent".to_string()],
                secret: "shh".to_string(),
            })
            .await
            .unwrap();
        store
            .webhook_deliveries
            .create(&NewWebhookDelivery {
                webhook_id: webhook.id,
                message_id: None,
                event: "message.sent".to_string(),
                payload: serde_json::json!({"event": "message.sent"}),
            })
            .await
            .unwrap();

        let dispatcher = dispatcher_for(store.clone(), Config::for_test());
        let claimed = store.webhook_deliveries.claim_next().await.unwrap().unwrap();
        dispatcher.process_delivery(claimed.clone()).await;

        let updated = store.webhook_deliveries.find_by_id(claimed.id).await.unwrap().unwrap();
        assert_eq!(updated.status, WebhookDeliveryStatus::Delivered);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn failure_leaves_row_pending_until_retries_exhausted(pool: PgPool) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Store::new(pool.clone());
        let tenant = TenantStore::new(pool.clone())
            .create(&NewTenant {
                key_hash: "hash".to_string(),
                name: "T".to_string(),
                rate_limit_per_second: 10,
            })
            .await
            .unwrap();
        let webhook = WebhookStore::new(pool.clone())
            .create(&NewWebhook {
                tenant_id: tenant.id,
                url: format!("{}/hook", server.uri()),
                events: vec!["message.sent".to_string()],
                secret: "shh".to_string(),
            })
            .await
            .unwrap();
        let created = store
            .webhook_deliveries
            .create(&NewWebhookDelivery {
                webhook_id: webhook.id,
                message_id: None,
                event: "message.sent".to_string(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();

        let mut config = Config::for_test();
        config.max_webhook_retries = 2;
        let dispatcher = dispatcher_for(store.clone(), config);

        for i in 0..2 {
            if i > 0 {
                // `claim_next`'s 30s guard would otherwise block this
                // iteration's claim right after the previous one stamped
                // `last_attempt_at`; back-date it past the guard instead of
                // claiming twice back-to-back.
                sqlx::query(
                    "UPDATE webhook_deliveries SET last_attempt_at = now() - interval '31 seconds' WHERE id = $1",
                )
                .bind(created.id)
                .execute(&pool)
                .await
                .unwrap();
            }
            let claimed = store.webhook_deliveries.claim_next().await.unwrap().unwrap();
            dispatcher.process_delivery(claimed).await;
        }

        let updated = store.webhook_deliveries.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(updated.status, WebhookDeliveryStatus::Failed);
        assert_eq!(updated.attempts, 2);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn inactive_webhook_terminates_delivery_immediately(pool: PgPool) {
        let store = Store::new(pool.clone());
        let tenant = TenantStore::new(pool.clone())
            .create(&NewTenant {
                key_hash: "hash".to_string(),
                name: "T".to_string(),
                rate_limit_per_second: 10,
            })
            .await
            .unwrap();
        let webhook_store = WebhookStore::new(pool.clone());
        let webhook = webhook_store
            .create(&NewWebhook {
                tenant_id: tenant.id,
                url: "https://example.com/hook".to_string(),
                events: vec!["message.sent".to_string()],
                secret: "shh".to_string(),
            })
            .await
            .unwrap();
        webhook_store.set_active(webhook.id, false).await.unwrap();

        store
            .webhook_deliveries
            .create(&NewWebhookDelivery {
                webhook_id: webhook.id,
                message_id: None,
                event: "message.sent".to_string(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();

        let dispatcher = dispatcher_for(store.clone(), Config::for_test());
        let claimed = store.webhook_deliveries.claim_next().await.unwrap().unwrap();
        dispatcher.process_delivery(claimed.clone()).await;

        let updated = store.webhook_deliveries.find_by_id(claimed.id).await.unwrap().unwrap();
        assert_eq!(updated.status, WebhookDeliveryStatus::Failed);
    }
}
