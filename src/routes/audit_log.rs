use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::{
    error::TenancyError, middleware::tenant::CurrentTenant, models::setting::AuditEntry, AppState,
};

#[derive(Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
}

/// GET /audit-log: newest entries first.
pub async fn list_audit_log(
    State(state): State<AppState>,
    _tenant: CurrentTenant,
    Query(params): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, TenancyError> {
    let entries = state.db.list_audit(params.limit.unwrap_or(50)).await?;
    Ok(Json(entries))
}
