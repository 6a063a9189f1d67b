use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{error::TenancyError, middleware::tenant::CurrentTenant, AppState};

/// GET /tenant/info: public profile of the tenant the request resolved to.
pub async fn get_tenant_info(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
) -> Result<Json<Value>, TenancyError> {
    let tenant = state.registry.find(ctx.tenant_id()).await?;
    Ok(Json(json!({
        "slug": tenant.slug,
        "name": tenant.name,
        "plan": tenant.plan,
        "trial_expires_at": tenant.trial_expires_at,
        "settings": tenant.settings,
    })))
}
