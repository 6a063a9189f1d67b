use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::store::SchemaBackend;
use crate::db::tenant::{schema_name, MigrationSet, SchemaName};
use crate::error::{TenancyError, TenancyResult};
use crate::models::tenant::TenantStatus;
use crate::services::metrics::SCHEMA_DROPS_COUNTER;
use crate::services::registry::SchemaRegistry;

/// Creates, migrates and drops tenant schemas.
#[derive(Clone)]
pub struct Provisioner {
    registry: SchemaRegistry,
    backend: Arc<dyn SchemaBackend>,
    migrations: Arc<MigrationSet>,
}

/// Outcome of a rolling migration over many tenants.
#[derive(Debug, Default, Serialize)]
pub struct MigrationReport {
    pub migrated: Vec<MigratedTenant>,
    pub failed: Vec<FailedTenant>,
}

#[derive(Debug, Serialize)]
pub struct MigratedTenant {
    pub tenant_id: Uuid,
    pub applied: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct FailedTenant {
    pub tenant_id: Uuid,
    pub error: String,
}

impl Provisioner {
    pub fn new(
        registry: SchemaRegistry,
        backend: Arc<dyn SchemaBackend>,
        migrations: MigrationSet,
    ) -> Self {
        Self {
            registry,
            backend,
            migrations: Arc::new(migrations),
        }
    }

    pub fn migrations(&self) -> &MigrationSet {
        &self.migrations
    }

    /// Creates the tenant's schema and brings it to the latest migration.
    ///
    /// Safe to call repeatedly: the name is derived from the tenant id, the
    /// schema is only created when absent, and migrations already recorded in
    /// the schema are skipped. A retry after a crash resumes where it stopped.
    pub async fn create_schema(&self, tenant_id: Uuid) -> TenancyResult<SchemaName> {
        let tenant = self.registry.find(tenant_id).await?;
        if matches!(
            tenant.status,
            TenantStatus::PendingDeletion | TenantStatus::Deleted
        ) {
            return Err(TenancyError::TenantUnavailable {
                slug: tenant.slug,
                status: tenant.status,
            });
        }

        let schema = schema_name(tenant_id);
        self.registry.register(tenant_id, &schema).await?;

        if self.backend.schema_exists(&schema).await? {
            debug!("Schema {schema} already exists, resuming migrations");
        } else {
            self.backend.create_schema(&schema).await?;
            info!("Created tenant schema {schema}");
        }

        let applied = self.apply_pending(&schema, &self.migrations).await?;
        info!(
            "Provisioned tenant schema {schema} ({} migration(s) applied)",
            applied.len()
        );
        Ok(schema)
    }

    /// Irreversibly drops the tenant's schema. Refused unless the tenant is
    /// `pending_deletion`. Returns whether a schema was actually removed.
    pub async fn drop_schema(&self, tenant_id: Uuid) -> TenancyResult<bool> {
        let tenant = self.registry.find(tenant_id).await?;
        if tenant.status != TenantStatus::PendingDeletion {
            warn!(
                "Refused to drop schema of tenant {} while {}",
                tenant.slug, tenant.status
            );
            return Err(TenancyError::UnsafeDeletion {
                tenant_id,
                status: tenant.status,
            });
        }

        // Derived rather than read from the registry: after an interrupted
        // purge the mapping may already be gone.
        let schema = schema_name(tenant_id);
        let dropped = self.backend.drop_schema(&schema).await?;
        if dropped {
            SCHEMA_DROPS_COUNTER.inc();
            warn!("Dropped schema {schema} of tenant {} ({tenant_id})", tenant.slug);
        } else {
            info!("Schema {schema} of tenant {} was already gone", tenant.slug);
        }
        Ok(dropped)
    }

    /// Removes a schema built by a provisioning attempt that lost the race
    /// against deletion. Only for tenants already on their way out.
    pub(crate) async fn discard_schema(&self, tenant_id: Uuid) -> TenancyResult<bool> {
        let tenant = self.registry.find(tenant_id).await?;
        if !matches!(
            tenant.status,
            TenantStatus::PendingDeletion | TenantStatus::Deleted
        ) {
            return Err(TenancyError::UnsafeDeletion {
                tenant_id,
                status: tenant.status,
            });
        }
        let schema = schema_name(tenant_id);
        let dropped = self.backend.drop_schema(&schema).await?;
        self.registry.deregister(tenant_id).await?;
        if dropped {
            SCHEMA_DROPS_COUNTER.inc();
            warn!(
                "Dropped schema {schema} provisioned for tenant {} after it was {}",
                tenant.slug, tenant.status
            );
        }
        Ok(dropped)
    }

    /// Applies the migrations of `set` not yet recorded in the tenant schema.
    pub async fn migrate_schema(
        &self,
        tenant_id: Uuid,
        set: &MigrationSet,
    ) -> TenancyResult<Vec<i64>> {
        let schema = self.registry.resolve(tenant_id).await?;
        if !self.backend.schema_exists(&schema).await? {
            return Err(TenancyError::Storage(format!(
                "schema {schema} of tenant {tenant_id} does not exist"
            )));
        }
        self.apply_pending(&schema, set).await
    }

    /// Rolls `set` out tenant by tenant. One tenant failing does not stop the
    /// others; failures are reported back.
    pub async fn migrate_all(&self, set: &MigrationSet) -> TenancyResult<MigrationReport> {
        let tenants = self
            .registry
            .list(&[TenantStatus::Active, TenantStatus::Suspended])
            .await?;

        let mut report = MigrationReport::default();
        for tenant in tenants {
            match self.migrate_schema(tenant.id, set).await {
                Ok(applied) => {
                    if !applied.is_empty() {
                        info!("Migrated tenant {}: {:?}", tenant.slug, applied);
                    }
                    report.migrated.push(MigratedTenant {
                        tenant_id: tenant.id,
                        applied,
                    });
                }
                Err(e) => {
                    warn!("Migration failed for tenant {}: {e}", tenant.slug);
                    report.failed.push(FailedTenant {
                        tenant_id: tenant.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn apply_pending(
        &self,
        schema: &SchemaName,
        set: &MigrationSet,
    ) -> TenancyResult<Vec<i64>> {
        let done: BTreeSet<i64> = self
            .backend
            .applied_versions(schema)
            .await?
            .into_iter()
            .collect();

        let mut applied = Vec::new();
        for migration in set.iter().filter(|m| !done.contains(&m.version)) {
            self.backend.apply_migration(schema, migration).await?;
            debug!(
                "Applied migration {} ({}) to {schema}",
                migration.version, migration.name
            );
            applied.push(migration.version);
        }
        Ok(applied)
    }
}
