use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::ids::{SuppressionId, TenantId};
use crate::models::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "suppression_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    HardBounce,
    SoftBounce,
    Complaint,
    Unsubscribe,
    Manual,
}

impl SuppressionReason {
    /// The `snake_case` wire form, matching the Postgres enum labels and
    /// this type's `#[serde(rename_all = "snake_case")]`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionReason::HardBounce => "hard_bounce",
            SuppressionReason::SoftBounce => "soft_bounce",
            SuppressionReason::Complaint => "complaint",
            SuppressionReason::Unsubscribe => "unsubscribe",
            SuppressionReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Suppression {
    pub id: SuppressionId,
    pub tenant_id: TenantId,
    pub email: String,
    pub reason: SuppressionReason,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SuppressionStore {
    pool: PgPool,
}

impl SuppressionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `email` must already be normalized (lowercased, trimmed) by the
    /// caller — this is the one place the worker and the API both funnel
    /// through (see `crate::address::normalize_address`).
    pub async fn is_suppressed(&self, tenant_id: TenantId, email: &str) -> Result<Option<Suppression>, Error> {
        sqlx::query_as::<_, Suppression>(
            r#"
            SELECT id, api_key_id AS tenant_id, email, reason, created_at
            FROM suppressions
            WHERE api_key_id = $1 AND email = $2
            "#,
        )
        .bind(tenant_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// Inserts a suppression, or does nothing if one already exists for
    /// this `(tenant, email)` — upserting a hard bounce onto an existing
    /// manual suppression leaves the original reason in place.
    pub async fn upsert(
        &self,
        tenant_id: TenantId,
        email: &str,
        reason: SuppressionReason,
    ) -> Result<Suppression, Error> {
        sqlx::query_as::<_, Suppression>(
            r#"
            INSERT INTO suppressions (id, api_key_id, email, reason)
            VALUES (gen_random_uuid(), $1, $2, $3)
            ON CONFLICT (api_key_id, email) DO UPDATE SET email = suppressions.email
            RETURNING id, api_key_id AS tenant_id, email, reason, created_at
            "#,
        )
        .bind(tenant_id)
        .bind(email)
        .bind(reason)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn remove(&self, tenant_id: TenantId, email: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM suppressions WHERE api_key_id = $1 AND email = $2")
            .bind(tenant_id)
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Suppression>, Error> {
        sqlx::query_as::<_, Suppression>(
            r#"
            SELECT id, api_key_id AS tenant_id, email, reason, created_at
            FROM suppressions
            WHERE api_key_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }
}
