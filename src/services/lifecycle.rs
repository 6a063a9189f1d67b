use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::tenant::schema_name;
use crate::error::{TenancyError, TenancyResult};
use crate::models::tenant::{
    normalize_hostname, validate_slug, CreateTenantRequest, NewTenant, Tenant, TenantStatus,
};
use crate::services::metrics::PROVISIONING_COUNTER;
use crate::services::provisioner::Provisioner;
use crate::services::registry::SchemaRegistry;

/// Upper bound on the retry delay between two provisioning attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// A `pending` tenant older than this was left behind by an interrupted
/// `create_tenant` and is provisioned by the sweep.
const STALE_PENDING_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub max_provisioning_attempts: i32,
    pub base_backoff: Duration,
    pub deletion_grace: chrono::Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_provisioning_attempts: 5,
            base_backoff: Duration::from_secs(30),
            deletion_grace: chrono::Duration::hours(72),
        }
    }
}

impl LifecycleSettings {
    /// Delay before retry number `attempts + 1`: none for the first attempt,
    /// then `base * 2^(attempts - 1)`, capped.
    pub fn backoff(&self, attempts: i32) -> Duration {
        if attempts <= 0 {
            return Duration::ZERO;
        }
        let exp = u32::try_from(attempts - 1).unwrap_or(u32::MAX).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(MAX_BACKOFF)
    }

    pub fn retry_due(&self, tenant: &Tenant, now: DateTime<Utc>) -> bool {
        if tenant.provisioning_attempts >= self.max_provisioning_attempts {
            return false;
        }
        let wait = chrono::Duration::from_std(self.backoff(tenant.provisioning_attempts))
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        tenant.updated_at + wait <= now
    }
}

/// Work item for the background worker. The registry remains the durable
/// record; a job is only a wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Provision(Uuid),
    Purge(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PurgeOutcome {
    Purged,
    AlreadyDeleted,
    NotDue { due_at: Option<DateTime<Utc>> },
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub provisioned: usize,
    pub provisioning_failed: usize,
    pub purged: usize,
    pub purge_failed: usize,
}

/// Sequences onboarding and offboarding so a partial failure always leaves a
/// tenant in a state the next attempt can resume from.
#[derive(Clone)]
pub struct LifecycleManager {
    registry: SchemaRegistry,
    provisioner: Provisioner,
    settings: LifecycleSettings,
    jobs: Option<mpsc::UnboundedSender<Job>>,
}

impl LifecycleManager {
    pub fn new(
        registry: SchemaRegistry,
        provisioner: Provisioner,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            provisioner,
            settings,
            jobs: None,
        }
    }

    /// Attaches the queue the worker listens on.
    pub fn with_queue(mut self, jobs: mpsc::UnboundedSender<Job>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    fn enqueue(&self, job: Job) {
        if let Some(jobs) = &self.jobs {
            if jobs.send(job).is_err() {
                // The periodic sweep still picks the tenant up from the registry.
                warn!("Worker queue closed, {job:?} left for the next sweep");
            }
        }
    }

    /// Registers a tenant and hands schema provisioning to the worker.
    /// Returns the tenant in `provisioning`.
    pub async fn create_tenant(&self, req: CreateTenantRequest) -> TenancyResult<Tenant> {
        let slug = validate_slug(&req.slug)?;
        let domains = req
            .domains
            .iter()
            .map(|d| normalize_hostname(d))
            .collect::<TenancyResult<Vec<_>>>()?;
        for hostname in &domains {
            self.registry.ensure_claimable(hostname)?;
            if self.registry.resolve_by_domain(hostname).await.is_ok() {
                return Err(TenancyError::DomainConflict {
                    hostname: hostname.clone(),
                });
            }
        }

        let id = Uuid::new_v4();
        let tenant = self
            .registry
            .insert(&NewTenant {
                id,
                slug,
                name: req.name.trim().to_string(),
                plan: req.plan.unwrap_or_default(),
                trial_expires_at: req.trial_expires_at,
                settings: req
                    .settings
                    .unwrap_or_else(|| Value::Object(Default::default())),
            })
            .await?;

        if let Err(e) = self.bind_names(id, &domains).await {
            // Another writer may have claimed a domain since the pre-check.
            match self.registry.discard_pending(id).await {
                Ok(_) => debug!("Rolled back tenant {} after: {e}", tenant.slug),
                Err(cleanup) => error!(
                    "Rollback of tenant {} failed, left for the sweep: {cleanup}",
                    tenant.slug
                ),
            }
            return Err(e);
        }

        let tenant = self
            .registry
            .transition(
                tenant.id,
                &[TenantStatus::Pending],
                TenantStatus::Provisioning,
                None,
            )
            .await?;
        info!("Tenant {} created, provisioning queued", tenant.slug);
        self.enqueue(Job::Provision(tenant.id));
        Ok(tenant)
    }

    async fn bind_names(&self, tenant_id: Uuid, domains: &[String]) -> TenancyResult<()> {
        self.registry.register(tenant_id, &schema_name(tenant_id)).await?;
        for hostname in domains {
            self.registry.claim_domain(tenant_id, hostname).await?;
        }
        Ok(())
    }

    /// A deletion that overtook a provisioning attempt must not leave the
    /// schema that attempt built behind.
    async fn abandon_if_offboarding(
        &self,
        tenant_id: Uuid,
    ) -> TenancyResult<Option<TenancyError>> {
        let tenant = self.registry.find(tenant_id).await?;
        if !matches!(
            tenant.status,
            TenantStatus::PendingDeletion | TenantStatus::Deleted
        ) {
            return Ok(None);
        }
        self.provisioner.discard_schema(tenant_id).await?;
        warn!(
            "Provisioning of tenant {} abandoned, tenant is {}",
            tenant.slug, tenant.status
        );
        Ok(Some(TenancyError::TenantUnavailable {
            slug: tenant.slug,
            status: tenant.status,
        }))
    }

    /// One provisioning attempt. On failure the tenant stays `provisioning`
    /// with the attempt recorded; it never becomes `active` without a usable
    /// schema.
    pub async fn provision(&self, tenant_id: Uuid) -> TenancyResult<Tenant> {
        let tenant = self.registry.find(tenant_id).await?;
        match tenant.status {
            TenantStatus::Active => return Ok(tenant),
            TenantStatus::Provisioning => {}
            TenantStatus::Pending => {
                self.registry
                    .transition(
                        tenant_id,
                        &[TenantStatus::Pending],
                        TenantStatus::Provisioning,
                        None,
                    )
                    .await?;
            }
            status => {
                return Err(TenancyError::InvalidTransition {
                    tenant_id,
                    from: status,
                    to: TenantStatus::Active,
                })
            }
        }

        let outcome = self.provisioner.create_schema(tenant_id).await;
        if let Some(e) = self.abandon_if_offboarding(tenant_id).await? {
            return Err(e);
        }

        match outcome {
            Ok(schema) => {
                self.registry.record_attempt(tenant_id, None).await?;
                let activated = self
                    .registry
                    .transition(
                        tenant_id,
                        &[TenantStatus::Provisioning],
                        TenantStatus::Active,
                        None,
                    )
                    .await;
                let tenant = match activated {
                    Ok(tenant) => tenant,
                    Err(e) => {
                        let abandoned = self.abandon_if_offboarding(tenant_id).await?;
                        return Err(abandoned.unwrap_or(e));
                    }
                };
                PROVISIONING_COUNTER.with_label_values(&["success"]).inc();
                info!("Tenant {} is active on schema {schema}", tenant.slug);
                Ok(tenant)
            }
            Err(e) => {
                PROVISIONING_COUNTER.with_label_values(&["failure"]).inc();
                let reason = e.to_string();
                let tenant = self.registry.record_attempt(tenant_id, Some(&reason)).await?;
                if tenant.provisioning_attempts >= self.settings.max_provisioning_attempts {
                    error!(
                        "Provisioning of tenant {} gave up after {} attempts, operator action required: {reason}",
                        tenant.slug, tenant.provisioning_attempts
                    );
                } else {
                    warn!(
                        "Provisioning of tenant {} failed (attempt {}): {reason}",
                        tenant.slug, tenant.provisioning_attempts
                    );
                }
                Err(TenancyError::ProvisioningFailure {
                    tenant_id,
                    attempt: tenant.provisioning_attempts,
                    reason,
                })
            }
        }
    }

    /// Operator override after the attempt budget ran out.
    pub async fn retry_provisioning(&self, tenant_id: Uuid) -> TenancyResult<Tenant> {
        let tenant = self.registry.find(tenant_id).await?;
        if tenant.status != TenantStatus::Provisioning {
            return Err(TenancyError::InvalidTransition {
                tenant_id,
                from: tenant.status,
                to: TenantStatus::Active,
            });
        }
        self.registry.reset_attempts(tenant_id).await?;
        info!("Provisioning of tenant {} re-armed by operator", tenant.slug);
        self.enqueue(Job::Provision(tenant_id));
        self.registry.find(tenant_id).await
    }

    /// New requests for a suspended tenant are refused at context entry;
    /// requests already running keep their captured context and finish.
    pub async fn suspend_tenant(&self, tenant_id: Uuid) -> TenancyResult<Tenant> {
        let tenant = self.registry.find(tenant_id).await?;
        if tenant.status == TenantStatus::Suspended {
            return Ok(tenant);
        }
        self.registry
            .transition(
                tenant_id,
                &[TenantStatus::Active],
                TenantStatus::Suspended,
                None,
            )
            .await
    }

    pub async fn reactivate_tenant(&self, tenant_id: Uuid) -> TenancyResult<Tenant> {
        let tenant = self.registry.find(tenant_id).await?;
        if tenant.status == TenantStatus::Active {
            return Ok(tenant);
        }
        self.registry
            .transition(
                tenant_id,
                &[TenantStatus::Suspended],
                TenantStatus::Active,
                None,
            )
            .await
    }

    /// Schedules deletion after the grace period. Calling it again on a tenant
    /// already pending deletion or deleted is a no-op.
    pub async fn delete_tenant(&self, tenant_id: Uuid) -> TenancyResult<Tenant> {
        let tenant = self.registry.find(tenant_id).await?;
        if matches!(
            tenant.status,
            TenantStatus::PendingDeletion | TenantStatus::Deleted
        ) {
            debug!("Tenant {} already {}, nothing to do", tenant.slug, tenant.status);
            return Ok(tenant);
        }
        let due_at = Utc::now() + self.settings.deletion_grace;
        let tenant = self
            .registry
            .transition(
                tenant_id,
                &[
                    TenantStatus::Pending,
                    TenantStatus::Provisioning,
                    TenantStatus::Active,
                    TenantStatus::Suspended,
                ],
                TenantStatus::PendingDeletion,
                Some(due_at),
            )
            .await?;
        warn!("Tenant {} scheduled for deletion at {due_at}", tenant.slug);
        if self.settings.deletion_grace <= chrono::Duration::zero() {
            self.enqueue(Job::Purge(tenant_id));
        }
        Ok(tenant)
    }

    /// Drops the schema, deregisters and marks the tenant deleted. Every step
    /// tolerates having already run, so an interrupted purge can be replayed.
    /// `force` skips the grace period, never the `pending_deletion` check.
    pub async fn purge(&self, tenant_id: Uuid, force: bool) -> TenancyResult<PurgeOutcome> {
        let tenant = self.registry.find(tenant_id).await?;
        match tenant.status {
            TenantStatus::Deleted => return Ok(PurgeOutcome::AlreadyDeleted),
            TenantStatus::PendingDeletion => {}
            status => return Err(TenancyError::UnsafeDeletion { tenant_id, status }),
        }
        if !force && tenant.deletion_due_at.is_some_and(|due| due > Utc::now()) {
            return Ok(PurgeOutcome::NotDue {
                due_at: tenant.deletion_due_at,
            });
        }

        self.provisioner.drop_schema(tenant_id).await?;
        self.registry.deregister(tenant_id).await?;
        self.registry
            .transition(
                tenant_id,
                &[TenantStatus::PendingDeletion],
                TenantStatus::Deleted,
                None,
            )
            .await?;
        warn!("Tenant {} ({tenant_id}) deleted", tenant.slug);
        Ok(PurgeOutcome::Purged)
    }

    pub async fn handle(&self, job: Job) {
        let result = match job {
            Job::Provision(id) => self.provision(id).await.map(|_| ()),
            Job::Purge(id) => self.purge(id, false).await.map(|_| ()),
        };
        if let Err(e) = result {
            // Retries come from the sweep, driven by the registry.
            debug!("{job:?} did not complete: {e}");
        }
    }

    /// Retries due provisioning, picks up stale `pending` tenants and purges
    /// due deletions.
    pub async fn sweep(&self, now: DateTime<Utc>) -> TenancyResult<SweepReport> {
        let mut report = SweepReport::default();

        let unfinished = self
            .registry
            .list(&[TenantStatus::Pending, TenantStatus::Provisioning])
            .await?;
        for tenant in unfinished {
            let due = match tenant.status {
                TenantStatus::Pending => {
                    tenant.updated_at + chrono::Duration::minutes(STALE_PENDING_MINUTES) <= now
                },
                _ => self.settings.retry_due(&tenant, now),
            };
            if !due {
                continue;
            }
            match self.provision(tenant.id).await {
                Ok(_) => report.provisioned += 1,
                Err(_) => report.provisioning_failed += 1,
            }
        }

        for tenant in self.registry.list(&[TenantStatus::PendingDeletion]).await? {
            if tenant.deletion_due_at.is_some_and(|due| due > now) {
                continue;
            }
            match self.purge(tenant.id, false).await {
                Ok(PurgeOutcome::Purged) => report.purged += 1,
                Ok(_) => {}
                Err(e) => {
                    error!("Purge of tenant {} failed: {e}", tenant.slug);
                    report.purge_failed += 1;
                }
            }
        }

        Ok(report)
    }
}
