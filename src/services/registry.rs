use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::store::RegistryStore;
use crate::db::tenant::SchemaName;
use crate::error::{TenancyError, TenancyResult};
use crate::models::tenant::{normalize_hostname, NewTenant, Tenant, TenantDomain, TenantStatus};

/// Source of truth for tenant → schema and hostname → tenant mappings.
#[derive(Clone)]
pub struct SchemaRegistry {
    store: Arc<dyn RegistryStore>,
    base_domain: Option<String>,
}

impl SchemaRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            base_domain: None,
        }
    }

    /// Hostnames under `base_domain` are routed by slug and can never be
    /// claimed as custom domains.
    pub fn with_base_domain(mut self, base_domain: Option<String>) -> Self {
        self.base_domain = base_domain
            .map(|d| d.trim_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty());
        self
    }

    pub fn base_domain(&self) -> Option<&str> {
        self.base_domain.as_deref()
    }

    /// Rejects hostnames that belong to the platform's own domain, where
    /// `<slug>.<base domain>` already names a tenant.
    pub fn ensure_claimable(&self, hostname: &str) -> TenancyResult<()> {
        if let Some(base) = self.base_domain.as_deref() {
            let under_base = hostname
                .strip_suffix(base)
                .is_some_and(|rest| rest.is_empty() || rest.ends_with('.'));
            if under_base {
                return Err(TenancyError::DomainConflict {
                    hostname: hostname.to_string(),
                });
            }
        }
        Ok(())
    }

    pub async fn ping(&self) -> TenancyResult<()> {
        self.store.ping().await
    }

    pub(crate) async fn insert(&self, new: &NewTenant) -> TenancyResult<Tenant> {
        self.store.insert_tenant(new).await
    }

    /// Undoes a `pending` registration that could not be completed.
    pub(crate) async fn discard_pending(&self, tenant_id: Uuid) -> TenancyResult<bool> {
        self.store.delete_pending_tenant(tenant_id).await
    }

    pub async fn find(&self, tenant_id: Uuid) -> TenancyResult<Tenant> {
        self.store
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| TenancyError::TenantNotFound(tenant_id.to_string()))
    }

    pub async fn find_by_slug(&self, slug: &str) -> TenancyResult<Tenant> {
        self.store
            .get_tenant_by_slug(slug)
            .await?
            .ok_or_else(|| TenancyError::TenantNotFound(slug.to_string()))
    }

    pub async fn list(&self, statuses: &[TenantStatus]) -> TenancyResult<Vec<Tenant>> {
        self.store.list_tenants(statuses).await
    }

    /// Maps `tenant_id` to `schema`. Idempotent for the owner; a schema owned by
    /// another tenant, or a second name for the same tenant, is a conflict.
    pub async fn register(&self, tenant_id: Uuid, schema: &SchemaName) -> TenancyResult<()> {
        if let Some(owner) = self.store.schema_owner(schema).await? {
            if owner == tenant_id {
                return Ok(());
            }
            return Err(TenancyError::SchemaConflict {
                schema: schema.to_string(),
                owner,
            });
        }

        let tenant = self.find(tenant_id).await?;
        if matches!(
            tenant.status,
            TenantStatus::PendingDeletion | TenantStatus::Deleted
        ) {
            return Err(TenancyError::TenantUnavailable {
                slug: tenant.slug,
                status: tenant.status,
            });
        }
        if let Some(existing) = tenant.schema_name.as_deref() {
            // Once provisioned a schema name is never silently renamed.
            return Err(TenancyError::SchemaConflict {
                schema: existing.to_string(),
                owner: tenant_id,
            });
        }

        self.store.set_schema(tenant_id, Some(schema)).await?;
        info!("Registered schema {schema} for tenant {tenant_id}");
        Ok(())
    }

    pub async fn resolve(&self, tenant_id: Uuid) -> TenancyResult<SchemaName> {
        self.find(tenant_id)
            .await?
            .schema()?
            .ok_or_else(|| TenancyError::TenantNotFound(tenant_id.to_string()))
    }

    /// Case-insensitive hostname lookup.
    pub async fn resolve_by_domain(&self, hostname: &str) -> TenancyResult<Uuid> {
        let hostname = normalize_hostname(hostname)?;
        self.store
            .find_domain(&hostname)
            .await?
            .ok_or(TenancyError::TenantNotFound(hostname))
    }

    /// Removes the schema mapping and the tenant's domains. Only allowed once
    /// the tenant is on its way out, i.e. after the schema drop.
    pub async fn deregister(&self, tenant_id: Uuid) -> TenancyResult<()> {
        let tenant = self.find(tenant_id).await?;
        if !matches!(
            tenant.status,
            TenantStatus::PendingDeletion | TenantStatus::Deleted
        ) {
            return Err(TenancyError::UnsafeDeletion {
                tenant_id,
                status: tenant.status,
            });
        }
        let domains = self.store.delete_domains(tenant_id).await?;
        self.store.set_schema(tenant_id, None).await?;
        info!("Deregistered tenant {tenant_id} ({domains} domain(s) released)");
        Ok(())
    }

    /// Returns the normalized hostname now owned by the tenant.
    pub async fn claim_domain(&self, tenant_id: Uuid, hostname: &str) -> TenancyResult<String> {
        let hostname = normalize_hostname(hostname)?;
        self.ensure_claimable(&hostname)?;
        let tenant = self.find(tenant_id).await?;
        if matches!(
            tenant.status,
            TenantStatus::PendingDeletion | TenantStatus::Deleted
        ) {
            return Err(TenancyError::TenantUnavailable {
                slug: tenant.slug,
                status: tenant.status,
            });
        }
        self.store.insert_domain(&hostname, tenant_id).await?;
        info!("Domain {hostname} claimed by tenant {}", tenant.slug);
        Ok(hostname)
    }

    pub async fn release_domain(&self, tenant_id: Uuid, hostname: &str) -> TenancyResult<bool> {
        let hostname = normalize_hostname(hostname)?;
        self.store.delete_domain(&hostname, tenant_id).await
    }

    pub async fn domains(&self, tenant_id: Uuid) -> TenancyResult<Vec<TenantDomain>> {
        self.store.list_domains(tenant_id).await
    }

    /// Moves the tenant from one of `from` to `to`, atomically.
    pub async fn transition(
        &self,
        tenant_id: Uuid,
        from: &[TenantStatus],
        to: TenantStatus,
        deletion_due_at: Option<DateTime<Utc>>,
    ) -> TenancyResult<Tenant> {
        debug_assert!(from.iter().all(|f| f.can_transition_to(to)));
        match self
            .store
            .transition(tenant_id, from, to, deletion_due_at)
            .await?
        {
            Some(tenant) => {
                info!("Tenant {} is now {to}", tenant.slug);
                Ok(tenant)
            }
            None => {
                let current = self.find(tenant_id).await?;
                Err(TenancyError::InvalidTransition {
                    tenant_id,
                    from: current.status,
                    to,
                })
            }
        }
    }

    pub(crate) async fn record_attempt(
        &self,
        tenant_id: Uuid,
        error: Option<&str>,
    ) -> TenancyResult<Tenant> {
        self.store.record_attempt(tenant_id, error).await
    }

    pub(crate) async fn reset_attempts(&self, tenant_id: Uuid) -> TenancyResult<()> {
        self.store.reset_attempts(tenant_id).await
    }

    pub async fn update_settings(&self, tenant_id: Uuid, settings: &Value) -> TenancyResult<Tenant> {
        self.store.update_settings(tenant_id, settings).await
    }
}
