use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::AppState;

/// Extractor that validates the `X-Super-Admin-Key` header against
/// `config.super_admin_key`. Tenant administration never goes through tenant
/// resolution, so these routes carry no tenant context.
pub struct SuperAdminAuth;

impl FromRequestParts<AppState> for SuperAdminAuth {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get("X-Super-Admin-Key")
            .and_then(|v| v.to_str().ok())
            .ok_or((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Missing X-Super-Admin-Key header" })),
            ))?;

        if !constant_time_eq(key.as_bytes(), state.config.super_admin_key.as_bytes()) {
            tracing::warn!("Rejected super-admin request with invalid key");
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid super-admin key" })),
            ));
        }

        Ok(SuperAdminAuth)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
