use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, Counter, CounterVec, GaugeVec,
};
use tracing::warn;

use crate::models::tenant::TenantStatus;
use crate::services::registry::SchemaRegistry;

lazy_static! {
    // ── Event counters ──────────────────────────────────────────────────────
    pub static ref RESOLUTIONS_COUNTER: CounterVec = register_counter_vec!(
        "tenancy_resolutions_total",
        "Inbound tenant resolutions by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref MISSING_CONTEXT_COUNTER: Counter = register_counter!(
        "tenancy_missing_context_total",
        "Tenant-scoped operations rejected because no tenant context was active"
    ).unwrap();

    pub static ref UNSCOPED_ACCESS_COUNTER: Counter = register_counter!(
        "tenancy_unscoped_access_total",
        "Data accesses served through the explicit single-tenant opt-out"
    ).unwrap();

    pub static ref PROVISIONING_COUNTER: CounterVec = register_counter_vec!(
        "tenancy_provisioning_attempts_total",
        "Schema provisioning attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref SCHEMA_DROPS_COUNTER: Counter = register_counter!(
        "tenancy_schema_drops_total",
        "Tenant schemas dropped"
    ).unwrap();

    // ── Registry state ──────────────────────────────────────────────────────
    pub static ref TENANTS_GAUGE: GaugeVec = register_gauge_vec!(
        "tenancy_tenants",
        "Tenants by lifecycle status",
        &["status"]
    ).unwrap();
}

/// Recomputes the per-status tenant gauge from the registry.
pub async fn refresh_tenant_gauges(registry: &SchemaRegistry) {
    let tenants = match registry.list(&[]).await {
        Ok(t) => t,
        Err(e) => {
            warn!("Metrics: could not list tenants: {e}");
            return;
        }
    };
    for status in TenantStatus::ALL {
        let count = tenants.iter().filter(|t| t.status == status).count();
        TENANTS_GAUGE
            .with_label_values(&[status.as_str()])
            .set(count as f64);
    }
}
