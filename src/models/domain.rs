use aws_lc_rs::encoding::AsDer;
use aws_lc_rs::signature::KeyPair as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::ids::{DomainId, TenantId};
use crate::models::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dkim_key_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DkimKeyType {
    RsaSha256,
    Ed25519,
}

impl Default for DkimKeyType {
    fn default() -> Self {
        DkimKeyType::RsaSha256
    }
}

/// A sending domain owned by one tenant. Only `verified` domains may sign
/// and send; the private key lives here but the public key is never
/// stored — it's derived algebraically from the private key whenever
/// something (a DNS record, a test) needs to see it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Domain {
    pub id: DomainId,
    pub tenant_id: TenantId,
    pub domain: String,
    pub verified: bool,
    pub dkim_selector: String,
    #[serde(skip_serializing)]
    pub dkim_key_type: DkimKeyType,
    #[serde(skip_serializing)]
    pub dkim_private_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Domain {
    /// A domain is usable as a DKIM signing source only once verified.
    pub fn signable(&self) -> bool {
        self.verified && !self.dkim_private_key.is_empty()
    }

    /// Derives the public key DER from the stored private key. The public
    /// key is never generated fresh and never stored separately — doing so
    /// would risk the DNS-published key drifting from the key actually used
    /// to sign.
    pub fn dkim_public_key_der(&self) -> Result<Vec<u8>, Error> {
        let der = match self.dkim_key_type {
            DkimKeyType::RsaSha256 => aws_lc_rs::rsa::KeyPair::from_pkcs8(&self.dkim_private_key)?
                .public_key()
                .as_der()?
                .as_ref()
                .to_vec(),
            DkimKeyType::Ed25519 => {
                aws_lc_rs::signature::Ed25519KeyPair::from_pkcs8(&self.dkim_private_key)?
                    .public_key()
                    .as_der()?
                    .as_ref()
                    .to_vec()
            }
        };
        Ok(der)
    }
}

#[derive(Debug, Clone)]
pub struct NewDomain {
    pub tenant_id: TenantId,
    pub domain: String,
    pub dkim_selector: String,
    pub dkim_key_type: DkimKeyType,
}

#[derive(Clone)]
pub struct DomainStore {
    pool: PgPool,
}

impl DomainStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Generates a fresh DKIM key pair for the domain and persists only the
    /// PKCS8 DER-encoded private key.
    pub async fn create(&self, new: &NewDomain) -> Result<Domain, Error> {
        let pkcs8_der = match new.dkim_key_type {
            DkimKeyType::RsaSha256 => {
                aws_lc_rs::rsa::KeyPair::generate(aws_lc_rs::rsa::KeySize::Rsa2048)?
                    .as_der()?
                    .as_ref()
                    .to_vec()
            }
            DkimKeyType::Ed25519 => aws_lc_rs::signature::Ed25519KeyPair::generate()?
                .as_der()?
                .as_ref()
                .to_vec(),
        };

        sqlx::query_as::<_, Domain>(
            r#"
            INSERT INTO domains
                (id, api_key_id, domain, verified, dkim_selector, dkim_key_type, dkim_private_key)
            VALUES (gen_random_uuid(), $1, $2, false, $3, $4, $5)
            RETURNING id, api_key_id AS tenant_id, domain, verified, dkim_selector,
                      dkim_key_type, dkim_private_key, created_at, verified_at
            "#,
        )
        .bind(new.tenant_id)
        .bind(&new.domain)
        .bind(&new.dkim_selector)
        .bind(new.dkim_key_type)
        .bind(&pkcs8_der)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn find_by_id(&self, id: DomainId) -> Result<Option<Domain>, Error> {
        sqlx::query_as::<_, Domain>(
            r#"
            SELECT id, api_key_id AS tenant_id, domain, verified, dkim_selector,
                   dkim_key_type, dkim_private_key, created_at, verified_at
            FROM domains
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// Looks up the domain owned by `tenant_id` whose name matches the
    /// sender address's domain part exactly.
    pub async fn find_by_tenant_and_name(
        &self,
        tenant_id: TenantId,
        domain_name: &str,
    ) -> Result<Option<Domain>, Error> {
        sqlx::query_as::<_, Domain>(
            r#"
            SELECT id, api_key_id AS tenant_id, domain, verified, dkim_selector,
                   dkim_key_type, dkim_private_key, created_at, verified_at
            FROM domains
            WHERE api_key_id = $1 AND domain = $2
            "#,
        )
        .bind(tenant_id)
        .bind(domain_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn list_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Domain>, Error> {
        sqlx::query_as::<_, Domain>(
            r#"
            SELECT id, api_key_id AS tenant_id, domain, verified, dkim_selector,
                   dkim_key_type, dkim_private_key, created_at, verified_at
            FROM domains
            WHERE api_key_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn mark_verified(&self, id: DomainId) -> Result<Domain, Error> {
        sqlx::query_as::<_, Domain>(
            r#"
            UPDATE domains
            SET verified = true, verified_at = now()
            WHERE id = $1
            RETURNING id, api_key_id AS tenant_id, domain, verified, dkim_selector,
                      dkim_key_type, dkim_private_key, created_at, verified_at
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn remove(&self, tenant_id: TenantId, id: DomainId) -> Result<(), Error> {
        sqlx::query("DELETE FROM domains WHERE id = $1 AND api_key_id = $2")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
