use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::ids::{MessageId, WebhookDeliveryId, WebhookId};
use crate::models::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "webhook_delivery_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WebhookDeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookDelivery {
    pub id: WebhookDeliveryId,
    pub webhook_id: WebhookId,
    pub message_id: Option<MessageId>,
    pub event: String,
    pub payload: serde_json::Value,
    pub status: WebhookDeliveryStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookDelivery {
    pub webhook_id: WebhookId,
    pub message_id: Option<MessageId>,
    pub event: String,
    pub payload: serde_json::Value,
}

const DELIVERY_COLUMNS: &str = r#"
    id, webhook_id, message_id, event, payload, status, attempts, last_attempt_at, created_at
"#;

/// The 30-second guard both the claim query and the retry back-off rely on:
/// a just-claimed row can't be re-claimed until this much time has passed,
/// which is also what turns "write back to pending" into a retry delay
/// without a dedicated `next_attempt_at` column.
pub const CLAIM_GUARD_SECONDS: i64 = 30;

#[derive(Clone)]
pub struct WebhookDeliveryStore {
    pool: PgPool,
}

impl WebhookDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewWebhookDelivery) -> Result<WebhookDelivery, Error> {
        sqlx::query_as::<_, WebhookDelivery>(&format!(
            r#"
            INSERT INTO webhook_deliveries (id, webhook_id, message_id, event, payload, status, attempts)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, 'pending', 0)
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(new.webhook_id)
        .bind(new.message_id)
        .bind(&new.event)
        .bind(&new.payload)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// Claims the oldest eligible pending delivery: `status = pending` and
    /// either never attempted or last attempted more than
    /// [`CLAIM_GUARD_SECONDS`] ago. Bumps `attempts` and stamps
    /// `last_attempt_at` as part of the same atomic update, which both
    /// records progress against a crash and re-arms the guard so a second
    /// dispatcher can't pick up the same row mid-flight.
    pub async fn claim_next(&self) -> Result<Option<WebhookDelivery>, Error> {
        sqlx::query_as::<_, WebhookDelivery>(&format!(
            r#"
            UPDATE webhook_deliveries
            SET attempts = attempts + 1, last_attempt_at = now()
            WHERE id = (
                SELECT id FROM webhook_deliveries
                WHERE status = 'pending'
                  AND (last_attempt_at IS NULL OR last_attempt_at < now() - ($1::text || ' seconds')::interval)
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(CLAIM_GUARD_SECONDS)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn mark_delivered(&self, id: WebhookDeliveryId) -> Result<(), Error> {
        sqlx::query("UPDATE webhook_deliveries SET status = 'delivered' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: WebhookDeliveryId) -> Result<(), Error> {
        sqlx::query("UPDATE webhook_deliveries SET status = 'failed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_by_id(&self, id: WebhookDeliveryId) -> Result<Option<WebhookDelivery>, Error> {
        sqlx::query_as::<_, WebhookDelivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, NewWebhook, TenantStore, WebhookStore};

    async fn test_webhook(pool: &PgPool) -> WebhookId {
        let tenant = TenantStore::new(pool.clone())
            .create(&NewTenant {
                key_hash: "hash".to_string(),
                name: "T".to_string(),
                rate_limit_per_second: 10,
            })
            .await
            .unwrap();
        WebhookStore::new(pool.clone())
            .create(&NewWebhook {
                tenant_id: tenant.id,
                url: "https://example.com/hook".to_string(),
                events: vec!["message.sent".to_string()],
                secret: "shh".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn claim_guard_blocks_reclaim(pool: PgPool) {
        let webhook_id = test_webhook(&pool).await;
        let store = WebhookDeliveryStore::new(pool);

        let created = store
            .create(&NewWebhookDelivery {
                webhook_id,
                message_id: None,
                event: "message.sent".to_string(),
                payload: serde_json::json!({"event": "message.sent"}),
            })
            .await
            .unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, created.id);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.last_attempt_at.is_some());

        // reclaim is blocked by the 30s guard
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn terminal_states_stop_claims(pool: PgPool) {
        let webhook_id = test_webhook(&pool).await;
        let store = WebhookDeliveryStore::new(pool);

        let created = store
            .create(&NewWebhookDelivery {
                webhook_id,
                message_id: None,
                event: "message.sent".to_string(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();

        store.claim_next().await.unwrap();
        store.mark_delivered(created.id).await.unwrap();

        assert!(store.claim_next().await.unwrap().is_none());
        let delivery = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(delivery.status, WebhookDeliveryStatus::Delivered);
    }
}
