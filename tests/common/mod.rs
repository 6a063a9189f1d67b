#![allow(dead_code)]

use std::sync::Arc;

use alumni_tenancy::{
    config::Config,
    db::{memory::MemoryBackend, tenant::tenant_migrations},
    models::tenant::{CreateTenantRequest, Tenant},
    services::{
        lifecycle::{LifecycleManager, LifecycleSettings},
        provisioner::Provisioner,
        registry::SchemaRegistry,
        resolver::TenantResolver,
        scope::{TenancyMode, TenantDb},
    },
};

pub const BASE_DOMAIN: &str = "alumni.test";
pub const ADMIN_KEY: &str = "test-super-admin-key";

/// Tenancy services wired on a fresh in-memory backend.
pub struct Harness {
    pub backend: MemoryBackend,
    pub registry: SchemaRegistry,
    pub provisioner: Provisioner,
    pub lifecycle: LifecycleManager,
    pub db: TenantDb,
    pub resolver: TenantResolver,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(LifecycleSettings::default())
    }

    pub fn with_settings(settings: LifecycleSettings) -> Self {
        let backend = MemoryBackend::new();
        let registry = SchemaRegistry::new(Arc::new(backend.clone()))
            .with_base_domain(Some(BASE_DOMAIN.to_string()));
        let provisioner = Provisioner::new(
            registry.clone(),
            Arc::new(backend.clone()),
            tenant_migrations(),
        );
        let lifecycle = LifecycleManager::new(registry.clone(), provisioner.clone(), settings);
        let db = TenantDb::new(Arc::new(backend.clone()), TenancyMode::SchemaPerTenant);
        let resolver = TenantResolver::new(registry.clone());
        Self {
            backend,
            registry,
            provisioner,
            lifecycle,
            db,
            resolver,
        }
    }

    /// Creates and provisions a tenant, returning it `active`.
    pub async fn active_tenant(&self, slug: &str) -> Tenant {
        self.active_tenant_with(request(slug)).await
    }

    pub async fn active_tenant_with(&self, req: CreateTenantRequest) -> Tenant {
        let tenant = self.lifecycle.create_tenant(req).await.unwrap();
        self.lifecycle.provision(tenant.id).await.unwrap()
    }
}

pub fn request(slug: &str) -> CreateTenantRequest {
    CreateTenantRequest {
        slug: slug.to_string(),
        name: format!("{slug} alumni"),
        plan: None,
        trial_expires_at: None,
        domains: Vec::new(),
        settings: None,
    }
}

pub fn request_with_domains(slug: &str, domains: &[&str]) -> CreateTenantRequest {
    CreateTenantRequest {
        domains: domains.iter().map(|d| d.to_string()).collect(),
        ..request(slug)
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".into(),
        db_max_connections: 1,
        host: "127.0.0.1".into(),
        port: 0,
        super_admin_key: ADMIN_KEY.into(),
        app_base_domain: Some(BASE_DOMAIN.into()),
        tenancy_mode: TenancyMode::SchemaPerTenant,
        provisioning_max_attempts: 5,
        provisioning_backoff_seconds: 30,
        deletion_grace_hours: 72,
        worker_interval_seconds: 15,
    }
}
