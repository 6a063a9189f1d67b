use tracing::warn;

use crate::models::setting::NewAuditEntry;
use crate::services::context::TenantContext;
use crate::services::scope::TenantDb;

/// Fire-and-forget audit log entry in the current tenant's schema.
/// Spawns a background task carrying the caller's tenant context; never
/// blocks the request handler, never propagates errors (logs a warning).
pub fn log(db: TenantDb, entry: NewAuditEntry) {
    TenantContext::spawn(async move {
        if let Err(e) = db.record_audit(&entry).await {
            let tenant = TenantContext::current()
                .map(|c| c.slug().to_string())
                .unwrap_or_else(|| "-".into());
            warn!("Audit log insert failed for tenant {tenant}: {e}");
        }
    });
}
