//! In-process implementation of the storage seams.
//!
//! Mirrors the PostgreSQL semantics the tenancy core relies on (unique slugs,
//! unique schema names, unique hostnames, compare-and-set transitions, one
//! namespace per tenant schema) so the services can run without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use uuid::Uuid;

use crate::db::store::{RegistryStore, SchemaBackend, TenantDataBackend};
use crate::db::tenant::{SchemaName, TenantMigration};
use crate::error::{TenancyError, TenancyResult};
use crate::models::setting::{AuditEntry, NewAuditEntry, TenantSetting};
use crate::models::tenant::{NewTenant, Tenant, TenantDomain, TenantStatus};
use crate::services::scope::Scope;

#[derive(Default)]
struct SchemaState {
    versions: BTreeMap<i64, String>,
    settings: BTreeMap<String, TenantSetting>,
    audit: Vec<AuditEntry>,
    next_audit_id: i64,
}

#[derive(Default)]
struct State {
    tenants: HashMap<Uuid, Tenant>,
    domains: HashMap<String, TenantDomain>,
    schemas: HashMap<String, SchemaState>,
}

#[derive(Default)]
struct Faults {
    failing_migrations: u32,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `apply_migration` fail, as if the
    /// process died or the database rejected the DDL mid-provisioning.
    pub fn fail_next_migrations(&self, count: u32) {
        self.faults.lock().failing_migrations = count;
    }

    pub fn schema_count(&self) -> usize {
        self.state.read().schemas.len()
    }

    pub fn has_schema(&self, schema: &SchemaName) -> bool {
        self.state.read().schemas.contains_key(schema.as_str())
    }

    /// Rewinds a tenant's `updated_at`, standing in for the passage of time
    /// in backoff and grace-period checks.
    pub fn backdate(&self, id: Uuid, by: chrono::Duration) {
        if let Some(tenant) = self.state.write().tenants.get_mut(&id) {
            tenant.updated_at -= by;
            if let Some(due) = tenant.deletion_due_at.as_mut() {
                *due -= by;
            }
        }
    }
}

fn missing_relation(schema: &SchemaName, relation: &str) -> TenancyError {
    TenancyError::Storage(format!(
        "relation \"{relation}\" does not exist in schema {schema}"
    ))
}

fn not_found(id: Uuid) -> TenancyError {
    TenancyError::TenantNotFound(id.to_string())
}

#[async_trait]
impl RegistryStore for MemoryBackend {
    async fn ping(&self) -> TenancyResult<()> {
        Ok(())
    }

    async fn insert_tenant(&self, new: &NewTenant) -> TenancyResult<Tenant> {
        let mut state = self.state.write();
        if state.tenants.values().any(|t| t.slug == new.slug) {
            return Err(TenancyError::SlugTaken(new.slug.clone()));
        }
        let now = Utc::now();
        let tenant = Tenant {
            id: new.id,
            slug: new.slug.clone(),
            name: new.name.clone(),
            schema_name: None,
            status: TenantStatus::Pending,
            plan: new.plan,
            trial_expires_at: new.trial_expires_at,
            settings: new.settings.clone(),
            provisioning_attempts: 0,
            last_error: None,
            deletion_due_at: None,
            created_at: now,
            updated_at: now,
        };
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn delete_pending_tenant(&self, id: Uuid) -> TenancyResult<bool> {
        let mut state = self.state.write();
        if !state
            .tenants
            .get(&id)
            .is_some_and(|t| t.status == TenantStatus::Pending)
        {
            return Ok(false);
        }
        state.tenants.remove(&id);
        state.domains.retain(|_, d| d.tenant_id != id);
        Ok(true)
    }

    async fn get_tenant(&self, id: Uuid) -> TenancyResult<Option<Tenant>> {
        Ok(self.state.read().tenants.get(&id).cloned())
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> TenancyResult<Option<Tenant>> {
        Ok(self
            .state
            .read()
            .tenants
            .values()
            .find(|t| t.slug == slug)
            .cloned())
    }

    async fn list_tenants(&self, statuses: &[TenantStatus]) -> TenancyResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self
            .state
            .read()
            .tenants
            .values()
            .filter(|t| statuses.is_empty() || statuses.contains(&t.status))
            .cloned()
            .collect();
        tenants.sort_by_key(|t| t.created_at);
        Ok(tenants)
    }

    async fn set_schema(&self, id: Uuid, schema: Option<&SchemaName>) -> TenancyResult<()> {
        let mut state = self.state.write();
        if let Some(schema) = schema {
            let owner = state
                .tenants
                .values()
                .find(|t| t.id != id && t.schema_name.as_deref() == Some(schema.as_str()));
            if let Some(owner) = owner {
                return Err(TenancyError::SchemaConflict {
                    schema: schema.to_string(),
                    owner: owner.id,
                });
            }
        }
        let tenant = state.tenants.get_mut(&id).ok_or_else(|| not_found(id))?;
        tenant.schema_name = schema.map(SchemaName::to_string);
        tenant.updated_at = Utc::now();
        Ok(())
    }

    async fn schema_owner(&self, schema: &SchemaName) -> TenancyResult<Option<Uuid>> {
        Ok(self
            .state
            .read()
            .tenants
            .values()
            .find(|t| t.schema_name.as_deref() == Some(schema.as_str()))
            .map(|t| t.id))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[TenantStatus],
        to: TenantStatus,
        deletion_due_at: Option<DateTime<Utc>>,
    ) -> TenancyResult<Option<Tenant>> {
        let mut state = self.state.write();
        let Some(tenant) = state.tenants.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&tenant.status) {
            return Ok(None);
        }
        tenant.status = to;
        if deletion_due_at.is_some() {
            tenant.deletion_due_at = deletion_due_at;
        }
        tenant.updated_at = Utc::now();
        Ok(Some(tenant.clone()))
    }

    async fn record_attempt(&self, id: Uuid, error: Option<&str>) -> TenancyResult<Tenant> {
        let mut state = self.state.write();
        let tenant = state.tenants.get_mut(&id).ok_or_else(|| not_found(id))?;
        tenant.provisioning_attempts += 1;
        tenant.last_error = error.map(str::to_string);
        tenant.updated_at = Utc::now();
        Ok(tenant.clone())
    }

    async fn reset_attempts(&self, id: Uuid) -> TenancyResult<()> {
        let mut state = self.state.write();
        let tenant = state.tenants.get_mut(&id).ok_or_else(|| not_found(id))?;
        tenant.provisioning_attempts = 0;
        tenant.last_error = None;
        tenant.updated_at = Utc::now();
        Ok(())
    }

    async fn update_settings(&self, id: Uuid, settings: &Value) -> TenancyResult<Tenant> {
        let mut state = self.state.write();
        let tenant = state.tenants.get_mut(&id).ok_or_else(|| not_found(id))?;
        tenant.settings = settings.clone();
        tenant.updated_at = Utc::now();
        Ok(tenant.clone())
    }

    async fn insert_domain(&self, hostname: &str, tenant_id: Uuid) -> TenancyResult<()> {
        let mut state = self.state.write();
        if !state.tenants.contains_key(&tenant_id) {
            return Err(not_found(tenant_id));
        }
        match state.domains.get(hostname) {
            Some(existing) if existing.tenant_id == tenant_id => Ok(()),
            Some(_) => Err(TenancyError::DomainConflict {
                hostname: hostname.to_string(),
            }),
            None => {
                state.domains.insert(
                    hostname.to_string(),
                    TenantDomain {
                        hostname: hostname.to_string(),
                        tenant_id,
                        created_at: Utc::now(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn delete_domain(&self, hostname: &str, tenant_id: Uuid) -> TenancyResult<bool> {
        let mut state = self.state.write();
        match state.domains.get(hostname) {
            Some(existing) if existing.tenant_id == tenant_id => {
                state.domains.remove(hostname);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_domains(&self, tenant_id: Uuid) -> TenancyResult<u64> {
        let mut state = self.state.write();
        let before = state.domains.len();
        state.domains.retain(|_, d| d.tenant_id != tenant_id);
        Ok((before - state.domains.len()) as u64)
    }

    async fn find_domain(&self, hostname: &str) -> TenancyResult<Option<Uuid>> {
        Ok(self.state.read().domains.get(hostname).map(|d| d.tenant_id))
    }

    async fn list_domains(&self, tenant_id: Uuid) -> TenancyResult<Vec<TenantDomain>> {
        let mut domains: Vec<TenantDomain> = self
            .state
            .read()
            .domains
            .values()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect();
        domains.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(domains)
    }
}

#[async_trait]
impl SchemaBackend for MemoryBackend {
    async fn schema_exists(&self, schema: &SchemaName) -> TenancyResult<bool> {
        Ok(self.has_schema(schema))
    }

    async fn create_schema(&self, schema: &SchemaName) -> TenancyResult<()> {
        self.state
            .write()
            .schemas
            .entry(schema.to_string())
            .or_default();
        Ok(())
    }

    async fn applied_versions(&self, schema: &SchemaName) -> TenancyResult<Vec<i64>> {
        self.state
            .read()
            .schemas
            .get(schema.as_str())
            .map(|s| s.versions.keys().copied().collect())
            .ok_or_else(|| missing_relation(schema, "_schema_migrations"))
    }

    async fn apply_migration(
        &self,
        schema: &SchemaName,
        migration: &TenantMigration,
    ) -> TenancyResult<()> {
        {
            let mut faults = self.faults.lock();
            if faults.failing_migrations > 0 {
                faults.failing_migrations -= 1;
                return Err(TenancyError::Storage(format!(
                    "migration {} ({}) aborted",
                    migration.version, migration.name
                )));
            }
        }
        let mut state = self.state.write();
        let target = state
            .schemas
            .get_mut(schema.as_str())
            .ok_or_else(|| missing_relation(schema, "_schema_migrations"))?;
        if target.versions.contains_key(&migration.version) {
            return Err(TenancyError::Storage(format!(
                "duplicate key value violates unique constraint on version {}",
                migration.version
            )));
        }
        target
            .versions
            .insert(migration.version, migration.name.clone());
        Ok(())
    }

    async fn drop_schema(&self, schema: &SchemaName) -> TenancyResult<bool> {
        Ok(self.state.write().schemas.remove(schema.as_str()).is_some())
    }
}

impl MemoryBackend {
    fn with_schema<R>(
        &self,
        scope: &Scope,
        relation: &str,
        f: impl FnOnce(&mut SchemaState) -> R,
    ) -> TenancyResult<R> {
        let mut state = self.state.write();
        let target = state
            .schemas
            .get_mut(scope.schema().as_str())
            .ok_or_else(|| missing_relation(scope.schema(), relation))?;
        Ok(f(target))
    }
}

#[async_trait]
impl TenantDataBackend for MemoryBackend {
    async fn put_setting(
        &self,
        scope: &Scope,
        key: &str,
        value: &Value,
    ) -> TenancyResult<TenantSetting> {
        self.with_schema(scope, "settings", |s| {
            let now = Utc::now();
            let setting = s
                .settings
                .entry(key.to_string())
                .and_modify(|existing| {
                    existing.value = value.clone();
                    existing.updated_at = now;
                })
                .or_insert_with(|| TenantSetting {
                    key: key.to_string(),
                    value: value.clone(),
                    created_at: now,
                    updated_at: now,
                });
            setting.clone()
        })
    }

    async fn get_setting(&self, scope: &Scope, key: &str) -> TenancyResult<Option<TenantSetting>> {
        self.with_schema(scope, "settings", |s| s.settings.get(key).cloned())
    }

    async fn list_settings(&self, scope: &Scope) -> TenancyResult<Vec<TenantSetting>> {
        self.with_schema(scope, "settings", |s| s.settings.values().cloned().collect())
    }

    async fn delete_setting(&self, scope: &Scope, key: &str) -> TenancyResult<bool> {
        self.with_schema(scope, "settings", |s| s.settings.remove(key).is_some())
    }

    async fn record_audit(
        &self,
        scope: &Scope,
        entry: &NewAuditEntry,
    ) -> TenancyResult<AuditEntry> {
        self.with_schema(scope, "audit_log", |s| {
            s.next_audit_id += 1;
            let row = AuditEntry {
                id: s.next_audit_id,
                actor: entry.actor.clone(),
                action: entry.action.clone(),
                resource_type: entry.resource_type.clone(),
                resource_id: entry.resource_id.clone(),
                detail: entry.detail.clone(),
                created_at: Utc::now(),
            };
            s.audit.push(row.clone());
            row
        })
    }

    async fn list_audit(&self, scope: &Scope, limit: i64) -> TenancyResult<Vec<AuditEntry>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        self.with_schema(scope, "audit_log", |s| {
            s.audit.iter().rev().take(limit).cloned().collect()
        })
    }
}
