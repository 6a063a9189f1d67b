// Library exports for the API server, the operator CLI and integration tests
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use config::Config;
use db::store::{RegistryStore, SchemaBackend, TenantDataBackend};
use db::tenant::tenant_migrations;
use services::{
    lifecycle::{Job, LifecycleManager},
    provisioner::Provisioner,
    registry::SchemaRegistry,
    resolver::TenantResolver,
    scope::TenantDb,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SchemaRegistry,
    pub provisioner: Provisioner,
    pub lifecycle: LifecycleManager,
    pub db: TenantDb,
    pub resolver: TenantResolver,
}

impl AppState {
    /// Wires the services on top of the storage seams. The returned receiver
    /// feeds the lifecycle worker.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn RegistryStore>,
        schemas: Arc<dyn SchemaBackend>,
        data: Arc<dyn TenantDataBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<Job>) {
        let registry =
            SchemaRegistry::new(store).with_base_domain(config.app_base_domain.clone());
        let provisioner = Provisioner::new(registry.clone(), schemas, tenant_migrations());
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let lifecycle = LifecycleManager::new(
            registry.clone(),
            provisioner.clone(),
            config.lifecycle_settings(),
        )
        .with_queue(jobs_tx);
        let db = TenantDb::new(data, config.tenancy_mode.clone());
        let resolver = TenantResolver::new(registry.clone());

        let state = Self {
            config,
            registry,
            provisioner,
            lifecycle,
            db,
            resolver,
        };
        (state, jobs_rx)
    }

    /// Same as [`AppState::new`] for a backend implementing every seam.
    pub fn with_backend<B>(config: Arc<Config>, backend: B) -> (Self, mpsc::UnboundedReceiver<Job>)
    where
        B: RegistryStore + SchemaBackend + TenantDataBackend + Clone + 'static,
    {
        Self::new(
            config,
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(backend),
        )
    }
}

/// Builds the HTTP router. Tenant routes run behind tenant resolution;
/// super-admin routes never enter a tenant context.
pub fn app(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route("/tenant/info", get(routes::tenant_info::get_tenant_info))
        .route("/settings", get(routes::settings::list_settings))
        .route(
            "/settings/{key}",
            get(routes::settings::get_setting)
                .put(routes::settings::put_setting)
                .delete(routes::settings::delete_setting),
        )
        .route("/audit-log", get(routes::audit_log::list_audit_log))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::tenant::require_tenant,
        ));

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::metrics_handler))
        .merge(tenant_routes)
        // Super-admin
        .route("/super-admin/tenants", get(routes::tenants::list_tenants).post(routes::tenants::create_tenant))
        .route("/super-admin/tenants/{id}", get(routes::tenants::get_tenant).delete(routes::tenants::delete_tenant))
        .route("/super-admin/tenants/{id}/settings", put(routes::tenants::update_tenant_settings))
        .route("/super-admin/tenants/{id}/suspend", post(routes::tenants::suspend_tenant))
        .route("/super-admin/tenants/{id}/reactivate", post(routes::tenants::reactivate_tenant))
        .route("/super-admin/tenants/{id}/retry-provisioning", post(routes::tenants::retry_provisioning))
        .route("/super-admin/tenants/{id}/purge", post(routes::tenants::purge_tenant))
        .route("/super-admin/tenants/{id}/domains", post(routes::tenants::claim_domain))
        .route("/super-admin/tenants/{id}/domains/{hostname}", delete(routes::tenants::release_domain))
        .route("/super-admin/migrate", post(routes::tenants::migrate_all))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
