//! Query scoping interceptor.
//!
//! Tenant data backends only accept a [`Scope`], and the only way to obtain
//! one is [`TenantDb::scoped`], which reads the active [`TenantContext`].
//! Without a context the call fails with `MissingTenantContext`; there is no
//! fallback to a default or first tenant.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::store::TenantDataBackend;
use crate::db::tenant::SchemaName;
use crate::error::{TenancyError, TenancyResult};
use crate::models::setting::{validate_setting_key, AuditEntry, NewAuditEntry, TenantSetting};
use crate::services::context::TenantContext;
use crate::services::metrics::{MISSING_CONTEXT_COUNTER, UNSCOPED_ACCESS_COUNTER};

/// How tenant data is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenancyMode {
    /// Every access needs an active tenant context (the default).
    SchemaPerTenant,
    /// Explicit opt-out: one fixed schema, no context needed. Every use is
    /// logged on the `tenancy::audit` target and counted.
    Single(SchemaName),
}

impl FromStr for TenancyMode {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "schema" => Ok(Self::SchemaPerTenant),
            other => match other.strip_prefix("single:") {
                Some(schema) => Ok(Self::Single(SchemaName::parse(schema)?)),
                None => Err(TenancyError::InvalidSchemaName(format!(
                    "unknown tenancy mode '{other}' (expected 'schema' or 'single:<schema>')"
                ))),
            },
        }
    }
}

impl fmt::Display for TenancyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemaPerTenant => f.write_str("schema"),
            Self::Single(schema) => write!(f, "single:{schema}"),
        }
    }
}

/// Proof that a data access has been routed to exactly one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    tenant_id: Option<Uuid>,
    schema: SchemaName,
}

impl Scope {
    /// `None` only in single-tenant mode.
    pub fn tenant_id(&self) -> Option<Uuid> {
        self.tenant_id
    }

    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }
}

/// Entry point for all tenant-scoped data access.
#[derive(Clone)]
pub struct TenantDb {
    backend: Arc<dyn TenantDataBackend>,
    mode: TenancyMode,
}

impl TenantDb {
    pub fn new(backend: Arc<dyn TenantDataBackend>, mode: TenancyMode) -> Self {
        Self { backend, mode }
    }

    pub fn mode(&self) -> &TenancyMode {
        &self.mode
    }

    pub fn scoped(&self) -> TenancyResult<Scope> {
        match &self.mode {
            TenancyMode::SchemaPerTenant => match TenantContext::current() {
                Some(ctx) => Ok(Scope {
                    tenant_id: Some(ctx.tenant_id()),
                    schema: ctx.schema().clone(),
                }),
                None => {
                    MISSING_CONTEXT_COUNTER.inc();
                    warn!("Rejected tenant-scoped access without tenant context");
                    Err(TenancyError::MissingTenantContext)
                }
            },
            TenancyMode::Single(schema) => {
                UNSCOPED_ACCESS_COUNTER.inc();
                debug!(target: "tenancy::audit", schema = %schema, "single-tenant access");
                Ok(Scope {
                    tenant_id: None,
                    schema: schema.clone(),
                })
            }
        }
    }

    pub async fn put_setting(&self, key: &str, value: &Value) -> TenancyResult<TenantSetting> {
        let scope = self.scoped()?;
        validate_setting_key(key)?;
        self.backend.put_setting(&scope, key, value).await
    }

    pub async fn get_setting(&self, key: &str) -> TenancyResult<Option<TenantSetting>> {
        let scope = self.scoped()?;
        self.backend.get_setting(&scope, key).await
    }

    pub async fn list_settings(&self) -> TenancyResult<Vec<TenantSetting>> {
        let scope = self.scoped()?;
        self.backend.list_settings(&scope).await
    }

    pub async fn delete_setting(&self, key: &str) -> TenancyResult<bool> {
        let scope = self.scoped()?;
        self.backend.delete_setting(&scope, key).await
    }

    pub async fn record_audit(&self, entry: &NewAuditEntry) -> TenancyResult<AuditEntry> {
        let scope = self.scoped()?;
        self.backend.record_audit(&scope, entry).await
    }

    pub async fn list_audit(&self, limit: i64) -> TenancyResult<Vec<AuditEntry>> {
        let scope = self.scoped()?;
        self.backend.list_audit(&scope, limit.clamp(1, 500)).await
    }
}
