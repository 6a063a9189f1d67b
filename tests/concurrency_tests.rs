mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use alumni_tenancy::{
    db::{
        memory::MemoryBackend,
        store::{RegistryStore, SchemaBackend},
        tenant::{schema_name, tenant_migrations, SchemaName, TenantMigration},
    },
    error::{TenancyError, TenancyResult},
    models::tenant::{NewTenant, PlanType, Tenant, TenantDomain, TenantStatus},
    services::{
        lifecycle::{Job, LifecycleManager, LifecycleSettings, SweepReport},
        provisioner::Provisioner,
        registry::SchemaRegistry,
    },
};

use common::{request, request_with_domains, Harness};

/// Schema backend that lets another operator delete and purge the tenant
/// while a provisioning attempt is between its checks and `CREATE SCHEMA`.
struct DeletedMidProvisioning {
    inner: MemoryBackend,
    operator: LifecycleManager,
    target: Mutex<Option<Uuid>>,
    force_purge: bool,
}

#[async_trait]
impl SchemaBackend for DeletedMidProvisioning {
    async fn schema_exists(&self, schema: &SchemaName) -> TenancyResult<bool> {
        let target = self.target.lock().take();
        if let Some(id) = target {
            self.operator.delete_tenant(id).await?;
            if self.force_purge {
                self.operator.purge(id, true).await?;
            }
        }
        self.inner.schema_exists(schema).await
    }

    async fn create_schema(&self, schema: &SchemaName) -> TenancyResult<()> {
        self.inner.create_schema(schema).await
    }

    async fn applied_versions(&self, schema: &SchemaName) -> TenancyResult<Vec<i64>> {
        self.inner.applied_versions(schema).await
    }

    async fn apply_migration(
        &self,
        schema: &SchemaName,
        migration: &TenantMigration,
    ) -> TenancyResult<()> {
        self.inner.apply_migration(schema, migration).await
    }

    async fn drop_schema(&self, schema: &SchemaName) -> TenancyResult<bool> {
        self.inner.drop_schema(schema).await
    }
}

/// Wires a lifecycle whose provisioning races a deletion, plus the plain
/// lifecycle the deleting operator uses.
fn racing_lifecycle(
    force_purge: bool,
) -> (MemoryBackend, Arc<DeletedMidProvisioning>, LifecycleManager, LifecycleManager) {
    let backend = MemoryBackend::new();
    let registry = SchemaRegistry::new(Arc::new(backend.clone()));
    let operator = LifecycleManager::new(
        registry.clone(),
        Provisioner::new(registry.clone(), Arc::new(backend.clone()), tenant_migrations()),
        LifecycleSettings::default(),
    );
    let racing = Arc::new(DeletedMidProvisioning {
        inner: backend.clone(),
        operator: operator.clone(),
        target: Mutex::new(None),
        force_purge,
    });
    let lifecycle = LifecycleManager::new(
        registry.clone(),
        Provisioner::new(registry, racing.clone(), tenant_migrations()),
        LifecycleSettings::default(),
    );
    (backend, racing, lifecycle, operator)
}

#[tokio::test]
async fn purge_during_provisioning_leaves_no_schema() {
    let (backend, racing, lifecycle, _) = racing_lifecycle(true);
    let tenant = lifecycle.create_tenant(request("acme")).await.unwrap();
    *racing.target.lock() = Some(tenant.id);

    let err = lifecycle.provision(tenant.id).await.unwrap_err();
    assert!(matches!(
        err,
        TenancyError::TenantUnavailable { status: TenantStatus::Deleted, .. }
    ));

    let tenant = lifecycle.registry().find(tenant.id).await.unwrap();
    assert_eq!(tenant.status, TenantStatus::Deleted);
    assert_eq!(tenant.schema_name, None);
    assert!(!backend.has_schema(&schema_name(tenant.id)));
    assert_eq!(backend.schema_count(), 0);
}

#[tokio::test]
async fn deletion_during_provisioning_discards_the_new_schema() {
    let (backend, racing, lifecycle, operator) = racing_lifecycle(false);
    let tenant = lifecycle.create_tenant(request("acme")).await.unwrap();
    *racing.target.lock() = Some(tenant.id);

    assert!(matches!(
        lifecycle.provision(tenant.id).await,
        Err(TenancyError::TenantUnavailable { status: TenantStatus::PendingDeletion, .. })
    ));
    assert!(!backend.has_schema(&schema_name(tenant.id)));

    // The scheduled purge still completes on the already-empty tenant.
    operator.purge(tenant.id, true).await.unwrap();
    let tenant = operator.registry().find(tenant.id).await.unwrap();
    assert_eq!(tenant.status, TenantStatus::Deleted);
}

/// Registry store on which another tenant claims `hostname` right after the
/// named slug is inserted, as a concurrent writer would.
struct SquattedDomain {
    inner: MemoryBackend,
    slug: String,
    hostname: String,
    squatter: Uuid,
}

#[async_trait]
impl RegistryStore for SquattedDomain {
    async fn ping(&self) -> TenancyResult<()> {
        self.inner.ping().await
    }

    async fn insert_tenant(&self, new: &NewTenant) -> TenancyResult<Tenant> {
        let tenant = self.inner.insert_tenant(new).await?;
        if new.slug == self.slug {
            self.inner.insert_domain(&self.hostname, self.squatter).await?;
        }
        Ok(tenant)
    }

    async fn delete_pending_tenant(&self, id: Uuid) -> TenancyResult<bool> {
        self.inner.delete_pending_tenant(id).await
    }

    async fn get_tenant(&self, id: Uuid) -> TenancyResult<Option<Tenant>> {
        self.inner.get_tenant(id).await
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> TenancyResult<Option<Tenant>> {
        self.inner.get_tenant_by_slug(slug).await
    }

    async fn list_tenants(&self, statuses: &[TenantStatus]) -> TenancyResult<Vec<Tenant>> {
        self.inner.list_tenants(statuses).await
    }

    async fn set_schema(&self, id: Uuid, schema: Option<&SchemaName>) -> TenancyResult<()> {
        self.inner.set_schema(id, schema).await
    }

    async fn schema_owner(&self, schema: &SchemaName) -> TenancyResult<Option<Uuid>> {
        self.inner.schema_owner(schema).await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[TenantStatus],
        to: TenantStatus,
        deletion_due_at: Option<DateTime<Utc>>,
    ) -> TenancyResult<Option<Tenant>> {
        self.inner.transition(id, from, to, deletion_due_at).await
    }

    async fn record_attempt(&self, id: Uuid, error: Option<&str>) -> TenancyResult<Tenant> {
        self.inner.record_attempt(id, error).await
    }

    async fn reset_attempts(&self, id: Uuid) -> TenancyResult<()> {
        self.inner.reset_attempts(id).await
    }

    async fn update_settings(&self, id: Uuid, settings: &Value) -> TenancyResult<Tenant> {
        self.inner.update_settings(id, settings).await
    }

    async fn insert_domain(&self, hostname: &str, tenant_id: Uuid) -> TenancyResult<()> {
        self.inner.insert_domain(hostname, tenant_id).await
    }

    async fn delete_domain(&self, hostname: &str, tenant_id: Uuid) -> TenancyResult<bool> {
        self.inner.delete_domain(hostname, tenant_id).await
    }

    async fn delete_domains(&self, tenant_id: Uuid) -> TenancyResult<u64> {
        self.inner.delete_domains(tenant_id).await
    }

    async fn find_domain(&self, hostname: &str) -> TenancyResult<Option<Uuid>> {
        self.inner.find_domain(hostname).await
    }

    async fn list_domains(&self, tenant_id: Uuid) -> TenancyResult<Vec<TenantDomain>> {
        self.inner.list_domains(tenant_id).await
    }
}

#[tokio::test]
async fn domain_claimed_after_insert_rolls_the_tenant_back() {
    let backend = MemoryBackend::new();
    let squatter = backend.insert_tenant(&new_tenant("acme")).await.unwrap();
    let registry = SchemaRegistry::new(Arc::new(SquattedDomain {
        inner: backend.clone(),
        slug: "gamma".into(),
        hostname: "alumni.gamma.edu".into(),
        squatter: squatter.id,
    }));
    let lifecycle = LifecycleManager::new(
        registry.clone(),
        Provisioner::new(registry.clone(), Arc::new(backend.clone()), tenant_migrations()),
        LifecycleSettings::default(),
    );

    let err = lifecycle
        .create_tenant(request_with_domains("gamma", &["alumni.gamma.edu"]))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::DomainConflict { .. }));

    assert!(matches!(
        registry.find_by_slug("gamma").await,
        Err(TenancyError::TenantNotFound(_))
    ));
    assert_eq!(
        registry.resolve_by_domain("alumni.gamma.edu").await.unwrap(),
        squatter.id
    );
    assert_eq!(registry.list(&[TenantStatus::Provisioning]).await.unwrap().len(), 0);
    assert_eq!(registry.list(&[]).await.unwrap().len(), 1);

    // The slug is free again.
    let gamma = lifecycle.create_tenant(request("gamma")).await.unwrap();
    assert_eq!(gamma.status, TenantStatus::Provisioning);
}

#[tokio::test]
async fn sweep_picks_up_stale_pending_tenants() {
    let h = Harness::new();
    let fresh = h.backend.insert_tenant(&new_tenant("fresh")).await.unwrap();
    let stale = h.backend.insert_tenant(&new_tenant("stale")).await.unwrap();
    h.backend.backdate(stale.id, chrono::Duration::minutes(10));

    let report = h.lifecycle.sweep(Utc::now()).await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            provisioned: 1,
            ..SweepReport::default()
        }
    );

    let stale = h.registry.find(stale.id).await.unwrap();
    assert_eq!(stale.status, TenantStatus::Active);
    assert!(h.backend.has_schema(&schema_name(stale.id)));
    // A create still in flight is left alone.
    let fresh = h.registry.find(fresh.id).await.unwrap();
    assert_eq!(fresh.status, TenantStatus::Pending);
}

#[tokio::test]
async fn deletion_without_grace_queues_the_purge() {
    let h = Harness::with_settings(LifecycleSettings {
        deletion_grace: chrono::Duration::zero(),
        ..Default::default()
    });
    let tenant = h.active_tenant("acme").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let lifecycle = h.lifecycle.clone().with_queue(tx);

    lifecycle.delete_tenant(tenant.id).await.unwrap();
    let job = rx.try_recv().unwrap();
    assert_eq!(job, Job::Purge(tenant.id));

    lifecycle.handle(job).await;
    let tenant = h.registry.find(tenant.id).await.unwrap();
    assert_eq!(tenant.status, TenantStatus::Deleted);
    assert!(!h.backend.has_schema(&schema_name(tenant.id)));

    // With a grace period the purge waits for the sweep instead.
    let h = Harness::new();
    let tenant = h.active_tenant("beta").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.lifecycle.clone().with_queue(tx).delete_tenant(tenant.id).await.unwrap();
    assert!(rx.try_recv().is_err());
}

fn new_tenant(slug: &str) -> NewTenant {
    NewTenant {
        id: Uuid::new_v4(),
        slug: slug.into(),
        name: format!("{slug} alumni"),
        plan: PlanType::Free,
        trial_expires_at: None,
        settings: json!({}),
    }
}
