//! Request/job-scoped carrier of the active tenant.
//!
//! The context lives in tokio task-local storage and is only ever installed
//! for the duration of a future (or closure). When that future finishes,
//! errors or panics the previous value is restored, so there is no manual
//! set/unset pair that an early return could skip. Tasks spawned with plain
//! `tokio::spawn` start without a tenant; use [`TenantContext::spawn`] to
//! carry it over.

use std::future::Future;

use chrono::Utc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::tenant::SchemaName;
use crate::error::{TenancyError, TenancyResult};
use crate::models::tenant::Tenant;
use crate::services::registry::SchemaRegistry;

tokio::task_local! {
    static CURRENT_TENANT: Option<TenantContext>;
}

/// Snapshot of the tenant a request or job runs for, captured at entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: Uuid,
    slug: String,
    schema: SchemaName,
}

impl TenantContext {
    /// Admits `tenant` into a new context. Suspended, non-active and
    /// trial-expired tenants are refused here, before any scoped query.
    pub fn admit(tenant: &Tenant) -> TenancyResult<Self> {
        tenant.admit(Utc::now())?;
        let schema = tenant
            .schema()?
            .ok_or_else(|| TenancyError::TenantUnavailable {
                slug: tenant.slug.clone(),
                status: tenant.status,
            })?;
        Ok(Self {
            tenant_id: tenant.id,
            slug: tenant.slug.clone(),
            schema,
        })
    }

    /// Loads the tenant from the registry and admits it.
    pub async fn enter(registry: &SchemaRegistry, tenant_id: Uuid) -> TenancyResult<Self> {
        let tenant = registry.find(tenant_id).await?;
        Self::admit(&tenant)
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    /// Runs `fut` with this context active.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_TENANT.scope(Some(self), fut).await
    }

    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_TENANT.sync_scope(Some(self), f)
    }

    /// Runs `fut` with no tenant at all, shadowing any outer context.
    /// Used by registry-level jobs that must never touch tenant data by accident.
    pub async fn detached<F: Future>(fut: F) -> F::Output {
        CURRENT_TENANT.scope(None, fut).await
    }

    pub fn current() -> Option<Self> {
        CURRENT_TENANT.try_with(Clone::clone).ok().flatten()
    }

    pub fn require() -> TenancyResult<Self> {
        Self::current().ok_or(TenancyError::MissingTenantContext)
    }

    /// Spawns `fut` on the runtime with the caller's context (or lack of it).
    pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let ctx = Self::current();
        tokio::spawn(CURRENT_TENANT.scope(ctx, fut))
    }
}
