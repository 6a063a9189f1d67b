use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::TenancyError;
use crate::services::context::TenantContext;
use crate::AppState;

/// Resolves the tenant from the `X-Tenant` header or the `Host` header,
/// refuses suspended/unavailable tenants, and runs the rest of the request
/// inside that tenant's context. The context ends with the request.
pub async fn require_tenant(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let tenant_header = request
        .headers()
        .get("X-Tenant")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let ctx = match state
        .resolver
        .enter(tenant_header.as_deref(), host.as_deref())
        .await
    {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response(),
    };

    tracing::debug!("Request bound to tenant {}", ctx.slug());
    request.extensions_mut().insert(ctx.clone());
    ctx.scope(next.run(request)).await
}

/// Extractor for handlers behind [`require_tenant`].
#[derive(Debug, Clone)]
pub struct CurrentTenant(pub TenantContext);

impl<S> FromRequestParts<S> for CurrentTenant
where
    S: Send + Sync,
{
    type Rejection = TenancyError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .cloned()
            .map(CurrentTenant)
            .ok_or(TenancyError::MissingTenantContext)
    }
}
