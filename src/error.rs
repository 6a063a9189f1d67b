use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::models::tenant::TenantStatus;

/// Every failure the tenancy core can surface.
///
/// Context and resolution errors are meant to be turned into a response at the
/// request boundary. `ProvisioningFailure` is retried by the worker.
/// `UnsafeDeletion` is never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Schema {schema} is already registered to tenant {owner}")]
    SchemaConflict { schema: String, owner: Uuid },

    #[error("Domain {hostname} is already claimed by another tenant")]
    DomainConflict { hostname: String },

    #[error("Slug {0} is already taken")]
    SlugTaken(String),

    #[error("No tenant context is active for a tenant-scoped operation")]
    MissingTenantContext,

    #[error("Provisioning failed for tenant {tenant_id} (attempt {attempt}): {reason}")]
    ProvisioningFailure {
        tenant_id: Uuid,
        attempt: i32,
        reason: String,
    },

    #[error("Refusing to drop schema of tenant {tenant_id} while it is {status}")]
    UnsafeDeletion { tenant_id: Uuid, status: TenantStatus },

    #[error("Tenant {0} is suspended")]
    TenantSuspended(String),

    #[error("Tenant {slug} is not available ({status})")]
    TenantUnavailable { slug: String, status: TenantStatus },

    #[error("Trial period of tenant {0} has expired")]
    TrialExpired(String),

    #[error("Invalid tenant slug: {0}")]
    InvalidSlug(String),

    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("Invalid schema name: {0}")]
    InvalidSchemaName(String),

    #[error("Invalid setting key: {0}")]
    InvalidKey(String),

    #[error("Tenant {tenant_id} cannot move from {from} to {to}")]
    InvalidTransition {
        tenant_id: Uuid,
        from: TenantStatus,
        to: TenantStatus,
    },

    #[error("Invalid migration set: {0}")]
    InvalidMigrationSet(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type TenancyResult<T> = Result<T, TenancyError>;

impl TenancyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TenantNotFound(_) => StatusCode::NOT_FOUND,
            Self::SchemaConflict { .. }
            | Self::DomainConflict { .. }
            | Self::SlugTaken(_)
            | Self::UnsafeDeletion { .. }
            | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::TenantSuspended(_) => StatusCode::FORBIDDEN,
            Self::TenantUnavailable { .. } | Self::ProvisioningFailure { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::TrialExpired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::InvalidSlug(_) | Self::InvalidHostname(_) | Self::InvalidKey(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::MissingTenantContext
            | Self::InvalidSchemaName(_)
            | Self::InvalidMigrationSet(_)
            | Self::Storage(_)
            | Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code returned next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TenantNotFound(_) => "tenant_not_found",
            Self::SchemaConflict { .. } => "schema_conflict",
            Self::DomainConflict { .. } => "domain_conflict",
            Self::SlugTaken(_) => "slug_taken",
            Self::MissingTenantContext => "missing_tenant_context",
            Self::ProvisioningFailure { .. } => "provisioning_failure",
            Self::UnsafeDeletion { .. } => "unsafe_deletion",
            Self::TenantSuspended(_) => "tenant_suspended",
            Self::TenantUnavailable { .. } => "tenant_unavailable",
            Self::TrialExpired(_) => "trial_expired",
            Self::InvalidSlug(_) => "invalid_slug",
            Self::InvalidHostname(_) => "invalid_hostname",
            Self::InvalidSchemaName(_) => "invalid_schema_name",
            Self::InvalidKey(_) => "invalid_key",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidMigrationSet(_) => "invalid_migration_set",
            Self::Storage(_) => "storage_error",
            Self::Database(_) => "database_error",
        }
    }
}

impl IntoResponse for TenancyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{self}");
        }
        // Internal details of database failures stay in the logs.
        let message = match &self {
            Self::Database(_) | Self::Storage(_) => "Database error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message, "code": self.code() }))).into_response()
    }
}
