use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::store::{RegistryStore, SchemaBackend, TenantDataBackend};
use crate::db::tenant::{SchemaName, TenantMigration};
use crate::error::{TenancyError, TenancyResult};
use crate::models::setting::{AuditEntry, NewAuditEntry, TenantSetting};
use crate::models::tenant::{NewTenant, Tenant, TenantDomain, TenantStatus};
use crate::services::scope::Scope;

const TENANT_COLUMNS: &str = "id, slug, name, schema_name, status, plan, trial_expires_at, \
     settings, provisioning_attempts, last_error, deletion_due_at, created_at, updated_at";

/// PostgreSQL implementation of every storage seam. The registry lives in the
/// `public` schema, tenant data in one schema per tenant.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a transaction whose `search_path` is only the tenant schema.
    /// `set_config(..., true)` is transaction-local, so nothing survives on the
    /// pooled connection after commit or rollback.
    async fn scoped_tx(&self, schema: &SchemaName) -> TenancyResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('search_path', $1, true)")
            .bind(schema.quoted())
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn status_names(statuses: &[TenantStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl RegistryStore for PgBackend {
    async fn ping(&self) -> TenancyResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_tenant(&self, new: &NewTenant) -> TenancyResult<Tenant> {
        sqlx::query_as::<_, Tenant>(&format!(
            "INSERT INTO public.tenants (id, slug, name, plan, trial_expires_at, settings)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {TENANT_COLUMNS}"
        ))
        .bind(new.id)
        .bind(&new.slug)
        .bind(&new.name)
        .bind(new.plan)
        .bind(new.trial_expires_at)
        .bind(&new.settings)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TenancyError::SlugTaken(new.slug.clone())
            } else {
                e.into()
            }
        })
    }

    async fn delete_pending_tenant(&self, id: Uuid) -> TenancyResult<bool> {
        // tenant_domains rows go with it (ON DELETE CASCADE).
        let done = sqlx::query("DELETE FROM public.tenants WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn get_tenant(&self, id: Uuid) -> TenancyResult<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM public.tenants WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> TenancyResult<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM public.tenants WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn list_tenants(&self, statuses: &[TenantStatus]) -> TenancyResult<Vec<Tenant>> {
        let tenants = if statuses.is_empty() {
            sqlx::query_as::<_, Tenant>(&format!(
                "SELECT {TENANT_COLUMNS} FROM public.tenants ORDER BY created_at"
            ))
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, Tenant>(&format!(
                "SELECT {TENANT_COLUMNS} FROM public.tenants
                 WHERE status::TEXT = ANY($1)
                 ORDER BY created_at"
            ))
            .bind(status_names(statuses))
            .fetch_all(&self.pool)
            .await?
        };
        Ok(tenants)
    }

    async fn set_schema(&self, id: Uuid, schema: Option<&SchemaName>) -> TenancyResult<()> {
        let result = sqlx::query(
            "UPDATE public.tenants SET schema_name = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(schema.map(SchemaName::as_str))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(TenancyError::TenantNotFound(id.to_string()))
            }
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                // Only possible with Some(schema): the name belongs to someone else.
                let schema = schema.map(SchemaName::to_string).unwrap_or_default();
                let owner: Option<Uuid> =
                    sqlx::query_scalar("SELECT id FROM public.tenants WHERE schema_name = $1")
                        .bind(&schema)
                        .fetch_optional(&self.pool)
                        .await?;
                Err(TenancyError::SchemaConflict {
                    schema,
                    owner: owner.unwrap_or_default(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn schema_owner(&self, schema: &SchemaName) -> TenancyResult<Option<Uuid>> {
        let owner = sqlx::query_scalar("SELECT id FROM public.tenants WHERE schema_name = $1")
            .bind(schema.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[TenantStatus],
        to: TenantStatus,
        deletion_due_at: Option<DateTime<Utc>>,
    ) -> TenancyResult<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>(&format!(
            "UPDATE public.tenants SET
               status          = $3::tenant_status,
               deletion_due_at = COALESCE($4, deletion_due_at),
               updated_at      = NOW()
             WHERE id = $1 AND status::TEXT = ANY($2)
             RETURNING {TENANT_COLUMNS}"
        ))
        .bind(id)
        .bind(status_names(from))
        .bind(to.as_str())
        .bind(deletion_due_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn record_attempt(&self, id: Uuid, error: Option<&str>) -> TenancyResult<Tenant> {
        sqlx::query_as::<_, Tenant>(&format!(
            "UPDATE public.tenants SET
               provisioning_attempts = provisioning_attempts + 1,
               last_error = $2,
               updated_at = NOW()
             WHERE id = $1
             RETURNING {TENANT_COLUMNS}"
        ))
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TenancyError::TenantNotFound(id.to_string()))
    }

    async fn reset_attempts(&self, id: Uuid) -> TenancyResult<()> {
        let done = sqlx::query(
            "UPDATE public.tenants
             SET provisioning_attempts = 0, last_error = NULL, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(TenancyError::TenantNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_settings(&self, id: Uuid, settings: &Value) -> TenancyResult<Tenant> {
        sqlx::query_as::<_, Tenant>(&format!(
            "UPDATE public.tenants SET settings = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING {TENANT_COLUMNS}"
        ))
        .bind(id)
        .bind(settings)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TenancyError::TenantNotFound(id.to_string()))
    }

    async fn insert_domain(&self, hostname: &str, tenant_id: Uuid) -> TenancyResult<()> {
        sqlx::query(
            "INSERT INTO public.tenant_domains (hostname, tenant_id)
             VALUES ($1, $2)
             ON CONFLICT (hostname) DO NOTHING",
        )
        .bind(hostname)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        let owner: Option<Uuid> =
            sqlx::query_scalar("SELECT tenant_id FROM public.tenant_domains WHERE hostname = $1")
                .bind(hostname)
                .fetch_optional(&self.pool)
                .await?;
        match owner {
            Some(owner) if owner == tenant_id => Ok(()),
            _ => Err(TenancyError::DomainConflict {
                hostname: hostname.to_string(),
            }),
        }
    }

    async fn delete_domain(&self, hostname: &str, tenant_id: Uuid) -> TenancyResult<bool> {
        let done =
            sqlx::query("DELETE FROM public.tenant_domains WHERE hostname = $1 AND tenant_id = $2")
                .bind(hostname)
                .bind(tenant_id)
                .execute(&self.pool)
                .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn delete_domains(&self, tenant_id: Uuid) -> TenancyResult<u64> {
        let done = sqlx::query("DELETE FROM public.tenant_domains WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn find_domain(&self, hostname: &str) -> TenancyResult<Option<Uuid>> {
        let owner =
            sqlx::query_scalar("SELECT tenant_id FROM public.tenant_domains WHERE hostname = $1")
                .bind(hostname)
                .fetch_optional(&self.pool)
                .await?;
        Ok(owner)
    }

    async fn list_domains(&self, tenant_id: Uuid) -> TenancyResult<Vec<TenantDomain>> {
        let domains = sqlx::query_as::<_, TenantDomain>(
            "SELECT hostname, tenant_id, created_at
             FROM public.tenant_domains
             WHERE tenant_id = $1
             ORDER BY hostname",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(domains)
    }
}

#[async_trait]
impl SchemaBackend for PgBackend {
    async fn schema_exists(&self, schema: &SchemaName) -> TenancyResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
                .bind(schema.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn create_schema(&self, schema: &SchemaName) -> TenancyResult<()> {
        let quoted = schema.quoted();
        sqlx::raw_sql(&format!(
            "CREATE SCHEMA IF NOT EXISTS {quoted};
             CREATE TABLE IF NOT EXISTS {quoted}._schema_migrations (
                 version    BIGINT PRIMARY KEY,
                 name       TEXT NOT NULL,
                 applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
             )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn applied_versions(&self, schema: &SchemaName) -> TenancyResult<Vec<i64>> {
        let versions = sqlx::query_scalar(&format!(
            "SELECT version FROM {}._schema_migrations ORDER BY version",
            schema.quoted()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(versions)
    }

    async fn apply_migration(
        &self,
        schema: &SchemaName,
        migration: &TenantMigration,
    ) -> TenancyResult<()> {
        let sql = migration.render(schema);
        let mut tx = self.scoped_tx(schema).await?;
        (&mut *tx).execute(sqlx::raw_sql(&sql)).await?;
        sqlx::query(&format!(
            "INSERT INTO {}._schema_migrations (version, name) VALUES ($1, $2)",
            schema.quoted()
        ))
        .bind(migration.version)
        .bind(&migration.name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn drop_schema(&self, schema: &SchemaName) -> TenancyResult<bool> {
        let existed = self.schema_exists(schema).await?;
        // Cascades to all tables, types and functions in it.
        sqlx::raw_sql(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema.quoted()))
            .execute(&self.pool)
            .await?;
        Ok(existed)
    }
}

#[async_trait]
impl TenantDataBackend for PgBackend {
    async fn put_setting(
        &self,
        scope: &Scope,
        key: &str,
        value: &Value,
    ) -> TenancyResult<TenantSetting> {
        let mut tx = self.scoped_tx(scope.schema()).await?;
        let setting = sqlx::query_as::<_, TenantSetting>(
            "INSERT INTO settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
             RETURNING key, value, created_at, updated_at",
        )
        .bind(key)
        .bind(value)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(setting)
    }

    async fn get_setting(&self, scope: &Scope, key: &str) -> TenancyResult<Option<TenantSetting>> {
        let mut tx = self.scoped_tx(scope.schema()).await?;
        let setting = sqlx::query_as::<_, TenantSetting>(
            "SELECT key, value, created_at, updated_at FROM settings WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(setting)
    }

    async fn list_settings(&self, scope: &Scope) -> TenancyResult<Vec<TenantSetting>> {
        let mut tx = self.scoped_tx(scope.schema()).await?;
        let settings = sqlx::query_as::<_, TenantSetting>(
            "SELECT key, value, created_at, updated_at FROM settings ORDER BY key",
        )
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(settings)
    }

    async fn delete_setting(&self, scope: &Scope, key: &str) -> TenancyResult<bool> {
        let mut tx = self.scoped_tx(scope.schema()).await?;
        let done = sqlx::query("DELETE FROM settings WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(done.rows_affected() > 0)
    }

    async fn record_audit(
        &self,
        scope: &Scope,
        entry: &NewAuditEntry,
    ) -> TenancyResult<AuditEntry> {
        let mut tx = self.scoped_tx(scope.schema()).await?;
        let row = sqlx::query_as::<_, AuditEntry>(
            "INSERT INTO audit_log (actor, action, resource_type, resource_id, detail)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, actor, action, resource_type, resource_id, detail, created_at",
        )
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.detail)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn list_audit(&self, scope: &Scope, limit: i64) -> TenancyResult<Vec<AuditEntry>> {
        let mut tx = self.scoped_tx(scope.schema()).await?;
        let rows = sqlx::query_as::<_, AuditEntry>(
            "SELECT id, actor, action, resource_type, resource_id, detail, created_at
             FROM audit_log
             ORDER BY created_at DESC, id DESC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }
}
