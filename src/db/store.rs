//! Storage seams for the tenancy core.
//!
//! Implementations live in [`crate::db::postgres`] and [`crate::db::memory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::tenant::{SchemaName, TenantMigration};
use crate::error::TenancyResult;
use crate::models::setting::{AuditEntry, NewAuditEntry, TenantSetting};
use crate::models::tenant::{NewTenant, Tenant, TenantDomain, TenantStatus};
use crate::services::scope::Scope;

/// Durable registry of tenants, their schema mapping and their domains.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn ping(&self) -> TenancyResult<()>;

    /// Inserts a tenant in `pending`. Fails with `SlugTaken` on a duplicate slug.
    async fn insert_tenant(&self, new: &NewTenant) -> TenancyResult<Tenant>;

    /// Removes a tenant that never left `pending`, domains included. Returns
    /// false when the tenant is gone or has already moved on.
    async fn delete_pending_tenant(&self, id: Uuid) -> TenancyResult<bool>;

    async fn get_tenant(&self, id: Uuid) -> TenancyResult<Option<Tenant>>;

    async fn get_tenant_by_slug(&self, slug: &str) -> TenancyResult<Option<Tenant>>;

    /// Tenants in any of `statuses`, or all tenants when empty. Oldest first.
    async fn list_tenants(&self, statuses: &[TenantStatus]) -> TenancyResult<Vec<Tenant>>;

    /// Sets or clears the schema mapping. A name owned by another tenant fails
    /// with `SchemaConflict`.
    async fn set_schema(&self, id: Uuid, schema: Option<&SchemaName>) -> TenancyResult<()>;

    async fn schema_owner(&self, schema: &SchemaName) -> TenancyResult<Option<Uuid>>;

    /// Compare-and-set on status. Returns `None` when the current status is not
    /// in `from`. `deletion_due_at` is only written when `Some`.
    async fn transition(
        &self,
        id: Uuid,
        from: &[TenantStatus],
        to: TenantStatus,
        deletion_due_at: Option<DateTime<Utc>>,
    ) -> TenancyResult<Option<Tenant>>;

    /// Bumps the provisioning attempt counter and stores the last error.
    async fn record_attempt(&self, id: Uuid, error: Option<&str>) -> TenancyResult<Tenant>;

    async fn reset_attempts(&self, id: Uuid) -> TenancyResult<()>;

    async fn update_settings(&self, id: Uuid, settings: &Value) -> TenancyResult<Tenant>;

    /// Claims `hostname` (already normalized). No-op when the same tenant owns
    /// it, `DomainConflict` when another one does.
    async fn insert_domain(&self, hostname: &str, tenant_id: Uuid) -> TenancyResult<()>;

    async fn delete_domain(&self, hostname: &str, tenant_id: Uuid) -> TenancyResult<bool>;

    async fn delete_domains(&self, tenant_id: Uuid) -> TenancyResult<u64>;

    async fn find_domain(&self, hostname: &str) -> TenancyResult<Option<Uuid>>;

    async fn list_domains(&self, tenant_id: Uuid) -> TenancyResult<Vec<TenantDomain>>;
}

/// Physical schema operations used by the provisioner.
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    async fn schema_exists(&self, schema: &SchemaName) -> TenancyResult<bool>;

    /// Creates the schema (if absent) and its migration bookkeeping table.
    async fn create_schema(&self, schema: &SchemaName) -> TenancyResult<()>;

    async fn applied_versions(&self, schema: &SchemaName) -> TenancyResult<Vec<i64>>;

    /// Applies one migration and records its version atomically.
    async fn apply_migration(
        &self,
        schema: &SchemaName,
        migration: &TenantMigration,
    ) -> TenancyResult<()>;

    /// Drops the schema and everything in it. Returns whether it existed.
    async fn drop_schema(&self, schema: &SchemaName) -> TenancyResult<bool>;
}

/// Tenant-scoped application data. Every call requires a [`Scope`], which
/// only the query scoping interceptor can hand out.
#[async_trait]
pub trait TenantDataBackend: Send + Sync {
    async fn put_setting(
        &self,
        scope: &Scope,
        key: &str,
        value: &Value,
    ) -> TenancyResult<TenantSetting>;

    async fn get_setting(&self, scope: &Scope, key: &str) -> TenancyResult<Option<TenantSetting>>;

    async fn list_settings(&self, scope: &Scope) -> TenancyResult<Vec<TenantSetting>>;

    async fn delete_setting(&self, scope: &Scope, key: &str) -> TenancyResult<bool>;

    async fn record_audit(&self, scope: &Scope, entry: &NewAuditEntry)
        -> TenancyResult<AuditEntry>;

    async fn list_audit(&self, scope: &Scope, limit: i64) -> TenancyResult<Vec<AuditEntry>>;
}
