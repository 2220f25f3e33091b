use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::ids::{TenantId, WebhookId};
use crate::models::Error;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    pub id: WebhookId,
    pub tenant_id: TenantId,
    pub url: String,
    pub events: Vec<String>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.active && self.events.iter().any(|e| e == event)
    }
}

#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub tenant_id: TenantId,
    pub url: String,
    pub events: Vec<String>,
    pub secret: String,
}

#[derive(Clone)]
pub struct WebhookStore {
    pool: PgPool,
}

impl WebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewWebhook) -> Result<Webhook, Error> {
        sqlx::query_as::<_, Webhook>(
            r#"
            INSERT INTO webhooks (id, api_key_id, url, events, secret, active)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, true)
            RETURNING id, api_key_id AS tenant_id, url, events, secret, active, created_at
            "#,
        )
        .bind(new.tenant_id)
        .bind(&new.url)
        .bind(&new.events)
        .bind(&new.secret)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn find_by_id(&self, id: WebhookId) -> Result<Option<Webhook>, Error> {
        sqlx::query_as::<_, Webhook>(
            r#"
            SELECT id, api_key_id AS tenant_id, url, events, secret, active, created_at
            FROM webhooks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// Active webhooks owned by `tenant_id` that subscribe to `event`.
    pub async fn active_subscribers(
        &self,
        tenant_id: TenantId,
        event: &str,
    ) -> Result<Vec<Webhook>, Error> {
        sqlx::query_as::<_, Webhook>(
            r#"
            SELECT id, api_key_id AS tenant_id, url, events, secret, active, created_at
            FROM webhooks
            WHERE api_key_id = $1 AND active = true AND $2 = ANY(events)
            "#,
        )
        .bind(tenant_id)
        .bind(event)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn remove(&self, tenant_id: TenantId, id: WebhookId) -> Result<(), Error> {
        sqlx::query("DELETE FROM webhooks WHERE id = $1 AND api_key_id = $2")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_active(&self, id: WebhookId, active: bool) -> Result<(), Error> {
        sqlx::query("UPDATE webhooks SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
