use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{
    error::TenancyError,
    middleware::tenant::CurrentTenant,
    models::setting::{NewAuditEntry, PutSettingRequest, TenantSetting},
    services::audit,
    AppState,
};

/// GET /settings
pub async fn list_settings(
    State(state): State<AppState>,
    _tenant: CurrentTenant,
) -> Result<Json<Vec<TenantSetting>>, TenancyError> {
    Ok(Json(state.db.list_settings().await?))
}

/// GET /settings/{key}
pub async fn get_setting(
    State(state): State<AppState>,
    _tenant: CurrentTenant,
    Path(key): Path<String>,
) -> Result<Response, TenancyError> {
    match state.db.get_setting(&key).await? {
        Some(setting) => Ok(Json(setting).into_response()),
        None => Ok(setting_not_found(&key)),
    }
}

/// PUT /settings/{key}
pub async fn put_setting(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
    Path(key): Path<String>,
    Json(body): Json<PutSettingRequest>,
) -> Result<Json<TenantSetting>, TenancyError> {
    let setting = state.db.put_setting(&key, &body.value).await?;
    tracing::debug!("Setting {key} updated for tenant {}", ctx.slug());

    audit::log(
        state.db.clone(),
        NewAuditEntry {
            action: "setting.updated".into(),
            resource_type: Some("setting".into()),
            resource_id: Some(key),
            detail: Some(body.value),
            ..Default::default()
        },
    );
    Ok(Json(setting))
}

/// DELETE /settings/{key}
pub async fn delete_setting(
    State(state): State<AppState>,
    _tenant: CurrentTenant,
    Path(key): Path<String>,
) -> Result<Response, TenancyError> {
    if !state.db.delete_setting(&key).await? {
        return Ok(setting_not_found(&key));
    }
    audit::log(
        state.db.clone(),
        NewAuditEntry {
            action: "setting.deleted".into(),
            resource_type: Some("setting".into()),
            resource_id: Some(key),
            ..Default::default()
        },
    );
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn setting_not_found(key: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("Setting {key} not found"), "code": "setting_not_found" })),
    )
        .into_response()
}
