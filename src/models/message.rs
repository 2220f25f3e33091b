use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::ids::{MessageId, TenantId};
use crate::models::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Processing,
    Sent,
    /// Reserved: the core never writes this directly. A hard bounce still
    /// lands in `Failed` (see the worker's processing algorithm and the
    /// `message.bounced` event it emits alongside it); `Delivered` and
    /// `Bounced` are kept in the type for schema completeness with callers
    /// (e.g. a future MTA-side delivery confirmation) that aren't part of
    /// this core.
    Delivered,
    Bounced,
    Failed,
    Rejected,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Sent
                | MessageStatus::Delivered
                | MessageStatus::Bounced
                | MessageStatus::Failed
                | MessageStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Email,
    Sms,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Email
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub idempotency_key: Option<String>,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub from_address: String,
    pub to_address: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html_body: Option<String>,
    pub metadata: serde_json::Value,
    pub message_id_header: Option<String>,
    pub attempts: i32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub tenant_id: TenantId,
    pub idempotency_key: Option<String>,
    pub from_address: String,
    /// Lowercased and trimmed before this is ever constructed; see
    /// `normalize_address`.
    pub to_address: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html_body: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewMessage {
    fn default_metadata() -> serde_json::Value {
        serde_json::Value::Object(Default::default())
    }
}

#[derive(Clone)]
pub struct MessageStore {
    pool: PgPool,
}

const MESSAGE_COLUMNS: &str = r#"
    id, api_key_id AS tenant_id, idempotency_key, message_type, status,
    from_address, to_address, subject, body, html_body, metadata,
    message_id_header, attempts, failure_reason, created_at, claimed_at,
    sent_at, delivered_at, failed_at
"#;

impl MessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a new message in `queued`. If an idempotency key is present
    /// and a message with the same `(tenant, idempotency_key)` already
    /// exists, returns that existing message unchanged instead of creating
    /// a second one (I1).
    pub async fn create(&self, new: &NewMessage) -> Result<Message, Error> {
        crate::address::validate(&new.from_address)?;
        crate::address::validate(&new.to_address)?;

        let metadata = if new.metadata.is_null() {
            NewMessage::default_metadata()
        } else {
            new.metadata.clone()
        };

        let inserted = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages
                (id, api_key_id, idempotency_key, message_type, status,
                 from_address, to_address, subject, body, html_body, metadata)
            VALUES (gen_random_uuid(), $1, $2, 'email', 'queued', $3, $4, $5, $6, $7, $8)
            ON CONFLICT (api_key_id, idempotency_key) WHERE idempotency_key IS NOT NULL
            DO NOTHING
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(new.tenant_id)
        .bind(&new.idempotency_key)
        .bind(&new.from_address)
        .bind(&new.to_address)
        .bind(&new.subject)
        .bind(&new.body)
        .bind(&new.html_body)
        .bind(&metadata)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(message) = inserted {
            return Ok(message);
        }

        // Conflict: the same (tenant, idempotency_key) already exists.
        let Some(key) = &new.idempotency_key else {
            // Unreachable in practice: a conflict without a key means some
            // other uniqueness constraint fired, which `fetch_optional`
            // would have reported as an error already.
            return Err(Error::Internal(
                "insert conflicted without an idempotency key".to_string(),
            ));
        };

        self.find_by_tenant_and_idempotency_key(new.tenant_id, key)
            .await?
            .ok_or_else(|| Error::Internal("idempotent message vanished after conflict".into()))
    }

    pub async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, Error> {
        sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn find_by_tenant_and_idempotency_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Message>, Error> {
        sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE api_key_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// Atomically selects the oldest `queued` message, marks it
    /// `processing`, bumps `attempts` and stamps `claimed_at`, all under a
    /// `FOR UPDATE SKIP LOCKED` lock so concurrent claimants never collide.
    pub async fn claim_next(&self) -> Result<Option<Message>, Error> {
        sqlx::query_as::<_, Message>(&format!(
            r#"
            UPDATE messages
            SET status = 'processing', attempts = attempts + 1, claimed_at = now()
            WHERE id = (
                SELECT id FROM messages
                WHERE status = 'queued'
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn mark_sent(&self, id: MessageId, message_id_header: Option<&str>) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'sent', sent_at = now(), message_id_header = COALESCE($2, message_id_header)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message_id_header)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_requeued(&self, id: MessageId, failure_reason: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'queued', failure_reason = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(failure_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: MessageId, failure_reason: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'failed', failed_at = now(), failure_reason = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(failure_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_rejected(&self, id: MessageId, reason: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'rejected', failed_at = now(), failure_reason = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resets `processing` rows whose claim is older than `visibility_timeout`
    /// back to `queued`, recovering messages left behind by a worker that
    /// crashed mid-send. Returns the number of rows reset.
    pub async fn reset_stale_processing(
        &self,
        visibility_timeout: chrono::Duration,
    ) -> Result<u64, Error> {
        let interval = sqlx::postgres::types::PgInterval::try_from(visibility_timeout)
            .map_err(Error::Internal)?;
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'queued'
            WHERE status = 'processing'
              AND claimed_at IS NOT NULL
              AND claimed_at < now() - $1
            "#,
        )
        .bind(interval)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, TenantStore};

    async fn test_tenant(pool: &PgPool) -> TenantId {
        TenantStore::new(pool.clone())
            .create(&NewTenant {
                key_hash: "hash".to_string(),
                name: "T".to_string(),
                rate_limit_per_second: 10,
            })
            .await
            .unwrap()
            .id
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn create_rejects_malformed_addresses(pool: PgPool) {
        let tenant_id = test_tenant(&pool).await;
        let store = MessageStore::new(pool);

        let err = store
            .create(&NewMessage {
                tenant_id,
                from_address: "not-an-email".to_string(),
                to_address: "b@example.com".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Email(_)));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn idempotent_create_returns_same_message(pool: PgPool) {
        let tenant_id = test_tenant(&pool).await;
        let store = MessageStore::new(pool);

        let new = NewMessage {
            tenant_id,
            idempotency_key: Some("k1".to_string()),
            from_address: "a@example.com".to_string(),
            to_address: "b@example.com".to_string(),
            subject: Some("hi".to_string()),
            body: Some("hi".to_string()),
            html_body: None,
            metadata: serde_json::json!({}),
        };

        let first = store.create(&new).await.unwrap();
        let second = store.create(&new).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, MessageStatus::Queued);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn claim_marks_processing_and_bumps_attempts(pool: PgPool) {
        let tenant_id = test_tenant(&pool).await;
        let store = MessageStore::new(pool);

        store
            .create(&NewMessage {
                tenant_id,
                idempotency_key: None,
                from_address: "a@example.com".to_string(),
                to_address: "b@example.com".to_string(),
                subject: None,
                body: None,
                html_body: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.status, MessageStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.claimed_at.is_some());

        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn stale_processing_rows_are_reset(pool: PgPool) {
        let tenant_id = test_tenant(&pool).await;
        let store = MessageStore::new(pool);

        store
            .create(&NewMessage {
                tenant_id,
                idempotency_key: None,
                from_address: "a@example.com".to_string(),
                to_address: "b@example.com".to_string(),
                subject: None,
                body: None,
                html_body: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        store.claim_next().await.unwrap();

        let reset = store
            .reset_stale_processing(chrono::Duration::zero())
            .await
            .unwrap();
        assert_eq!(reset, 1);
    }
}
