use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{
    error::TenancyError,
    middleware::super_admin::SuperAdminAuth,
    models::tenant::{CreateTenantRequest, Tenant, TenantDomain, TenantStatus},
    services::{lifecycle::PurgeOutcome, provisioner::MigrationReport},
    AppState,
};

// ─── Tenant registry ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<TenantStatus>,
}

pub async fn list_tenants(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<Tenant>>, TenancyError> {
    let statuses: Vec<TenantStatus> = params.status.into_iter().collect();
    Ok(Json(state.registry.list(&statuses).await?))
}

/// Returns 202: the tenant comes back in `provisioning` and becomes `active`
/// once the worker has built its schema.
pub async fn create_tenant(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Json(body): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<Tenant>), TenancyError> {
    let tenant = state.lifecycle.create_tenant(body).await?;
    Ok((StatusCode::ACCEPTED, Json(tenant)))
}

#[derive(Serialize)]
pub struct TenantDetail {
    #[serde(flatten)]
    pub tenant: Tenant,
    pub domains: Vec<TenantDomain>,
}

pub async fn get_tenant(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<TenantDetail>, TenancyError> {
    let tenant = state.registry.find(id).await?;
    let domains = state.registry.domains(id).await?;
    Ok(Json(TenantDetail { tenant, domains }))
}

/// Schedules deletion; the schema is only dropped once the grace period ends.
pub async fn delete_tenant(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Tenant>, TenancyError> {
    Ok(Json(state.lifecycle.delete_tenant(id).await?))
}

/// Replaces the tenant's registry-level settings (branding, feature flags).
pub async fn update_tenant_settings(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<Tenant>, TenancyError> {
    Ok(Json(state.registry.update_settings(id, &Value::Object(body)).await?))
}

// ─── Lifecycle actions ───────────────────────────────────────────────────────

pub async fn suspend_tenant(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Tenant>, TenancyError> {
    Ok(Json(state.lifecycle.suspend_tenant(id).await?))
}

pub async fn reactivate_tenant(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Tenant>, TenancyError> {
    Ok(Json(state.lifecycle.reactivate_tenant(id).await?))
}

pub async fn retry_provisioning(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Tenant>, TenancyError> {
    Ok(Json(state.lifecycle.retry_provisioning(id).await?))
}

#[derive(Deserialize)]
pub struct PurgeQuery {
    #[serde(default)]
    pub force: bool,
}

/// `?force=true` skips the grace period, never the `pending_deletion` check.
pub async fn purge_tenant(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
    Query(params): Query<PurgeQuery>,
) -> Result<Json<PurgeOutcome>, TenancyError> {
    if params.force {
        tracing::warn!("Forced purge requested for tenant {id}");
    }
    Ok(Json(state.lifecycle.purge(id, params.force).await?))
}

// ─── Domains ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ClaimDomainRequest {
    pub hostname: String,
}

pub async fn claim_domain(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
    Json(body): Json<ClaimDomainRequest>,
) -> Result<(StatusCode, Json<Value>), TenancyError> {
    let hostname = state.registry.claim_domain(id, &body.hostname).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "tenant_id": id, "hostname": hostname })),
    ))
}

pub async fn release_domain(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path((id, hostname)): Path<(Uuid, String)>,
) -> Result<StatusCode, TenancyError> {
    if state.registry.release_domain(id, &hostname).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TenancyError::TenantNotFound(hostname))
    }
}

// ─── Migrations ──────────────────────────────────────────────────────────────

/// Rolls the compiled-in tenant migration set out to every live tenant.
pub async fn migrate_all(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
) -> Result<Json<MigrationReport>, TenancyError> {
    let provisioner = &state.provisioner;
    let report = provisioner.migrate_all(provisioner.migrations()).await?;
    Ok(Json(report))
}
