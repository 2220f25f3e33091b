use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::ids::TenantId;
use crate::models::Error;

/// An API key: the tenant principal that owns domains, messages,
/// suppressions and webhooks. Identity is immutable once created; only
/// the display name and rate limit can change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: TenantId,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub name: String,
    pub rate_limit_per_second: i32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTenant {
    pub key_hash: String,
    pub name: String,
    pub rate_limit_per_second: i32,
}

#[derive(Debug, Clone, Default)]
pub struct TenantUpdate {
    pub name: Option<String>,
    pub rate_limit_per_second: Option<i32>,
}

#[derive(Clone)]
pub struct TenantStore {
    pool: PgPool,
}

impl TenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewTenant) -> Result<Tenant, Error> {
        sqlx::query_as::<_, Tenant>(
            r#"
            INSERT INTO api_keys (id, key_hash, name, rate_limit_per_second)
            VALUES (gen_random_uuid(), $1, $2, $3)
            RETURNING id, key_hash, name, rate_limit_per_second, created_at, last_used_at
            "#,
        )
        .bind(&new.key_hash)
        .bind(&new.name)
        .bind(new.rate_limit_per_second)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn find_by_key_hash(&self, key_hash: &str) -> Result<Option<Tenant>, Error> {
        sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, key_hash, name, rate_limit_per_second, created_at, last_used_at
            FROM api_keys
            WHERE key_hash = $1
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn find_by_id(&self, id: TenantId) -> Result<Option<Tenant>, Error> {
        sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, key_hash, name, rate_limit_per_second, created_at, last_used_at
            FROM api_keys
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn touch_last_used(&self, id: TenantId) -> Result<(), Error> {
        sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update(&self, id: TenantId, changes: &TenantUpdate) -> Result<Tenant, Error> {
        sqlx::query_as::<_, Tenant>(
            r#"
            UPDATE api_keys
            SET name = COALESCE($2, name),
                rate_limit_per_second = COALESCE($3, rate_limit_per_second)
            WHERE id = $1
            RETURNING id, key_hash, name, rate_limit_per_second, created_at, last_used_at
            "#,
        )
        .bind(id)
        .bind(&changes.name)
        .bind(changes.rate_limit_per_second)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn remove(&self, id: TenantId) -> Result<(), Error> {
        sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[sqlx::test(migrations = "./migrations")]
    async fn tenant_lifecycle(pool: PgPool) {
        let store = TenantStore::new(pool);

        let tenant = store
            .create(&NewTenant {
                key_hash: "hash-1".to_string(),
                name: "Acme".to_string(),
                rate_limit_per_second: 50,
            })
            .await
            .unwrap();
        assert_eq!(tenant.name, "Acme");
        assert_eq!(tenant.rate_limit_per_second, 50);
        assert!(tenant.last_used_at.is_none());

        let found = store.find_by_key_hash("hash-1").await.unwrap().unwrap();
        assert_eq!(found.id, tenant.id);

        store.touch_last_used(tenant.id).await.unwrap();
        let found = store.find_by_id(tenant.id).await.unwrap().unwrap();
        assert!(found.last_used_at.is_some());

        let updated = store
            .update(
                tenant.id,
                &TenantUpdate {
                    name: Some("Acme Corp".to_string()),
                    rate_limit_per_second: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Acme Corp");
        assert_eq!(updated.rate_limit_per_second, 50);

        store.remove(tenant.id).await.unwrap();
        assert!(store.find_by_id(tenant.id).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn duplicate_key_hash_conflicts(pool: PgPool) {
        let store = TenantStore::new(pool);
        let new = NewTenant {
            key_hash: "dup".to_string(),
            name: "A".to_string(),
            rate_limit_per_second: 10,
        };
        store.create(&new).await.unwrap();
        let err = store.create(&new).await.unwrap_err();
        assert!(matches!(err, Error::Conflict));
    }
}
