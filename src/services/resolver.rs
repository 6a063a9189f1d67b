use tracing::debug;

use crate::error::{TenancyError, TenancyResult};
use crate::models::tenant::{normalize_hostname, validate_slug, Tenant};
use crate::services::context::TenantContext;
use crate::services::metrics::RESOLUTIONS_COUNTER;
use crate::services::registry::SchemaRegistry;

/// Subdomains of the base domain that never name a tenant.
const RESERVED_SUBDOMAINS: &[&str] = &["www", "api", "admin"];

/// Maps an inbound request to a tenant.
///
/// Order: explicit `X-Tenant` slug, then the exact hostname in the domain
/// table, then `<slug>.<base domain>`. Anything else, bare IPs included, is
/// `TenantNotFound`; there is no default tenant.
#[derive(Clone)]
pub struct TenantResolver {
    registry: SchemaRegistry,
}

impl TenantResolver {
    /// Subdomain routing uses the registry's base domain, the same one that
    /// custom domain claims are checked against.
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    pub async fn resolve(
        &self,
        tenant_header: Option<&str>,
        host: Option<&str>,
    ) -> TenancyResult<Tenant> {
        if let Some(raw) = tenant_header.map(str::trim).filter(|s| !s.is_empty()) {
            let slug = validate_slug(raw)?;
            return self.registry.find_by_slug(&slug).await;
        }

        let Some(host) = host else {
            return Err(TenancyError::TenantNotFound("<no host>".to_string()));
        };
        let hostname = normalize_hostname(host)?;

        match self.registry.resolve_by_domain(&hostname).await {
            Ok(tenant_id) => return self.registry.find(tenant_id).await,
            Err(TenancyError::TenantNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if let Some(slug) = self.subdomain_slug(&hostname) {
            debug!("Resolving {hostname} by subdomain slug {slug}");
            return self.registry.find_by_slug(&slug).await;
        }

        Err(TenancyError::TenantNotFound(hostname))
    }

    /// Resolves and admits in one step, recording the outcome.
    pub async fn enter(
        &self,
        tenant_header: Option<&str>,
        host: Option<&str>,
    ) -> TenancyResult<TenantContext> {
        let result = match self.resolve(tenant_header, host).await {
            Ok(tenant) => TenantContext::admit(&tenant),
            Err(e) => Err(e),
        };
        let outcome = match &result {
            Ok(_) => "resolved",
            Err(e) => e.code(),
        };
        RESOLUTIONS_COUNTER.with_label_values(&[outcome]).inc();
        result
    }

    fn subdomain_slug(&self, hostname: &str) -> Option<String> {
        let base = self.registry.base_domain()?;
        let label = hostname.strip_suffix(base)?.strip_suffix('.')?;
        if label.contains('.') || RESERVED_SUBDOMAINS.contains(&label) {
            return None;
        }
        validate_slug(label).ok()
    }
}
