mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use alumni_tenancy::{
    db::tenant::{schema_name, tenant_migrations, MigrationSet, TenantMigration},
    error::TenancyError,
    models::tenant::TenantStatus,
    services::{
        context::TenantContext,
        lifecycle::{LifecycleSettings, PurgeOutcome, SweepReport},
        worker,
    },
    AppState,
};

use common::{request, request_with_domains, Harness};

#[tokio::test]
async fn create_then_provision_activates_with_one_schema() {
    let h = Harness::new();
    let tenant = h.lifecycle.create_tenant(request("acme")).await.unwrap();
    assert_eq!(tenant.status, TenantStatus::Provisioning);
    assert_eq!(
        tenant.schema_name.as_deref(),
        Some(schema_name(tenant.id).as_str())
    );

    let tenant = h.lifecycle.provision(tenant.id).await.unwrap();
    assert_eq!(tenant.status, TenantStatus::Active);
    assert_eq!(tenant.provisioning_attempts, 1);
    assert!(h.backend.has_schema(&schema_name(tenant.id)));
    assert_eq!(h.registry.resolve(tenant.id).await.unwrap(), schema_name(tenant.id));
}

#[tokio::test]
async fn create_schema_twice_is_a_no_op() {
    let h = Harness::new();
    let tenant = h.active_tenant("acme").await;

    let first = h.provisioner.create_schema(tenant.id).await.unwrap();
    let second = h.provisioner.create_schema(tenant.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.backend.schema_count(), 1);

    let applied = h
        .provisioner
        .migrate_schema(tenant.id, h.provisioner.migrations())
        .await
        .unwrap();
    assert!(applied.is_empty());
}

#[tokio::test]
async fn schema_names_cannot_be_shared() {
    let h = Harness::new();
    let acme = h.active_tenant("acme").await;
    let beta = h.lifecycle.create_tenant(request("beta")).await.unwrap();

    let err = h
        .registry
        .register(beta.id, &schema_name(acme.id))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::SchemaConflict { owner, .. } if owner == acme.id));

    // Re-registering the owner's own schema is fine.
    h.registry.register(acme.id, &schema_name(acme.id)).await.unwrap();
}

#[tokio::test]
async fn duplicate_slug_is_rejected() {
    let h = Harness::new();
    h.active_tenant("acme").await;
    assert!(matches!(
        h.lifecycle.create_tenant(request("ACME")).await,
        Err(TenancyError::SlugTaken(_))
    ));
    assert!(matches!(
        h.lifecycle.create_tenant(request("bad_slug")).await,
        Err(TenancyError::InvalidSlug(_))
    ));
}

#[tokio::test]
async fn failed_provisioning_stays_provisioning_and_resumes() {
    let h = Harness::new();
    let tenant = h.lifecycle.create_tenant(request("acme")).await.unwrap();

    h.backend.fail_next_migrations(1);
    let err = h.lifecycle.provision(tenant.id).await.unwrap_err();
    assert!(matches!(err, TenancyError::ProvisioningFailure { attempt: 1, .. }));

    let stuck = h.registry.find(tenant.id).await.unwrap();
    assert_eq!(stuck.status, TenantStatus::Provisioning);
    assert_eq!(stuck.provisioning_attempts, 1);
    assert!(stuck.last_error.is_some());
    // The half-built schema is never served.
    assert!(matches!(
        TenantContext::enter(&h.registry, tenant.id).await,
        Err(TenancyError::TenantUnavailable { .. })
    ));

    // Not due until the backoff has elapsed.
    let report = h.lifecycle.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.provisioned, 0);

    h.backend.backdate(tenant.id, chrono::Duration::minutes(5));
    let report = h.lifecycle.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.provisioned, 1);

    let active = h.registry.find(tenant.id).await.unwrap();
    assert_eq!(active.status, TenantStatus::Active);
    assert_eq!(active.last_error, None);
    assert_eq!(h.backend.schema_count(), 1);
    let applied = h
        .provisioner
        .migrate_schema(tenant.id, h.provisioner.migrations())
        .await
        .unwrap();
    assert!(applied.is_empty());
}

#[tokio::test]
async fn exhausted_attempts_wait_for_the_operator() {
    let h = Harness::with_settings(LifecycleSettings {
        max_provisioning_attempts: 2,
        base_backoff: Duration::from_secs(1),
        ..Default::default()
    });
    let tenant = h.lifecycle.create_tenant(request("acme")).await.unwrap();

    h.backend.fail_next_migrations(10);
    assert!(h.lifecycle.provision(tenant.id).await.is_err());
    h.backend.backdate(tenant.id, chrono::Duration::hours(1));
    let report = h.lifecycle.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.provisioning_failed, 1);

    h.backend.backdate(tenant.id, chrono::Duration::hours(1));
    let report = h.lifecycle.sweep(Utc::now()).await.unwrap();
    assert_eq!(report, SweepReport::default());
    assert_eq!(
        h.registry.find(tenant.id).await.unwrap().provisioning_attempts,
        2
    );

    h.backend.fail_next_migrations(0);
    h.lifecycle.retry_provisioning(tenant.id).await.unwrap();
    let tenant = h.lifecycle.provision(tenant.id).await.unwrap();
    assert_eq!(tenant.status, TenantStatus::Active);
}

#[tokio::test]
async fn schemas_are_only_dropped_pending_deletion() {
    let h = Harness::new();
    let tenant = h.active_tenant("acme").await;

    assert!(matches!(
        h.provisioner.drop_schema(tenant.id).await,
        Err(TenancyError::UnsafeDeletion { status: TenantStatus::Active, .. })
    ));
    assert!(matches!(
        h.lifecycle.purge(tenant.id, true).await,
        Err(TenancyError::UnsafeDeletion { .. })
    ));
    assert!(matches!(
        h.registry.deregister(tenant.id).await,
        Err(TenancyError::UnsafeDeletion { .. })
    ));

    h.lifecycle.suspend_tenant(tenant.id).await.unwrap();
    assert!(matches!(
        h.provisioner.drop_schema(tenant.id).await,
        Err(TenancyError::UnsafeDeletion { status: TenantStatus::Suspended, .. })
    ));
    assert!(h.backend.has_schema(&schema_name(tenant.id)));
}

#[tokio::test]
async fn deletion_waits_for_grace_period_and_is_idempotent() {
    let h = Harness::new();
    let tenant = h
        .active_tenant_with(request_with_domains("acme", &["alumni.acme.edu"]))
        .await;

    let pending = h.lifecycle.delete_tenant(tenant.id).await.unwrap();
    assert_eq!(pending.status, TenantStatus::PendingDeletion);
    let due = pending.deletion_due_at.unwrap();
    assert!(due > Utc::now() + chrono::Duration::hours(71));

    let again = h.lifecycle.delete_tenant(tenant.id).await.unwrap();
    assert_eq!(again.status, TenantStatus::PendingDeletion);
    assert_eq!(again.deletion_due_at, Some(due));

    assert!(matches!(
        h.lifecycle.purge(tenant.id, false).await.unwrap(),
        PurgeOutcome::NotDue { .. }
    ));
    assert!(h.backend.has_schema(&schema_name(tenant.id)));

    h.backend.backdate(tenant.id, chrono::Duration::hours(73));
    let report = h.lifecycle.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.purged, 1);

    let deleted = h.registry.find(tenant.id).await.unwrap();
    assert_eq!(deleted.status, TenantStatus::Deleted);
    assert_eq!(deleted.schema_name, None);
    assert!(!h.backend.has_schema(&schema_name(tenant.id)));
    assert!(h.registry.resolve_by_domain("alumni.acme.edu").await.is_err());

    assert_eq!(
        h.lifecycle.purge(tenant.id, false).await.unwrap(),
        PurgeOutcome::AlreadyDeleted
    );
    let still = h.lifecycle.delete_tenant(tenant.id).await.unwrap();
    assert_eq!(still.status, TenantStatus::Deleted);
}

#[tokio::test]
async fn forced_purge_skips_only_the_grace_period() {
    let h = Harness::new();
    let tenant = h.active_tenant("acme").await;
    h.lifecycle.delete_tenant(tenant.id).await.unwrap();

    assert_eq!(
        h.lifecycle.purge(tenant.id, true).await.unwrap(),
        PurgeOutcome::Purged
    );
    assert_eq!(h.backend.schema_count(), 0);
}

#[tokio::test]
async fn interrupted_purge_resumes() {
    let h = Harness::new();
    let dropped_only = h.active_tenant("acme").await;
    let deregistered = h.active_tenant("beta").await;
    for id in [dropped_only.id, deregistered.id] {
        h.lifecycle.delete_tenant(id).await.unwrap();
    }

    // Crash after the schema drop.
    assert!(h.provisioner.drop_schema(dropped_only.id).await.unwrap());
    // Crash after deregistration.
    h.provisioner.drop_schema(deregistered.id).await.unwrap();
    h.registry.deregister(deregistered.id).await.unwrap();

    for id in [dropped_only.id, deregistered.id] {
        assert_eq!(h.lifecycle.purge(id, true).await.unwrap(), PurgeOutcome::Purged);
        let tenant = h.registry.find(id).await.unwrap();
        assert_eq!(tenant.status, TenantStatus::Deleted);
        assert_eq!(tenant.schema_name, None);
    }
    assert_eq!(h.backend.schema_count(), 0);
}

#[tokio::test]
async fn suspension_refuses_new_requests_but_not_in_flight_ones() {
    let h = Harness::new();
    let tenant = h.active_tenant("acme").await;
    let ctx = TenantContext::enter(&h.registry, tenant.id).await.unwrap();

    let db = h.db.clone();
    let lifecycle = h.lifecycle.clone();
    let id = tenant.id;
    ctx.scope(async move {
        db.put_setting("before", &json!(1)).await.unwrap();
        lifecycle.suspend_tenant(id).await.unwrap();
        // Already admitted: the request finishes on its captured context.
        db.put_setting("after", &json!(2)).await.unwrap();
        assert_eq!(db.list_settings().await.unwrap().len(), 2);
    })
    .await;

    assert!(matches!(
        TenantContext::enter(&h.registry, tenant.id).await,
        Err(TenancyError::TenantSuspended(_))
    ));

    h.lifecycle.reactivate_tenant(tenant.id).await.unwrap();
    assert!(TenantContext::enter(&h.registry, tenant.id).await.is_ok());
}

#[tokio::test]
async fn invalid_transitions_are_refused() {
    let h = Harness::new();
    let tenant = h.lifecycle.create_tenant(request("acme")).await.unwrap();
    assert!(matches!(
        h.lifecycle.suspend_tenant(tenant.id).await,
        Err(TenancyError::InvalidTransition { from: TenantStatus::Provisioning, .. })
    ));

    let active = h.lifecycle.provision(tenant.id).await.unwrap();
    assert!(matches!(
        h.lifecycle.retry_provisioning(active.id).await,
        Err(TenancyError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn rolling_migration_collects_failures() {
    let h = Harness::new();
    let acme = h.active_tenant("acme").await;
    let beta = h.active_tenant("beta").await;
    h.lifecycle.create_tenant(request("gamma")).await.unwrap();

    let mut migrations: Vec<TenantMigration> = tenant_migrations().iter().cloned().collect();
    migrations.push(TenantMigration::new(
        4,
        "create_events",
        "CREATE TABLE IF NOT EXISTS {schema}.events (id BIGSERIAL PRIMARY KEY)",
    ));
    let set = MigrationSet::new(migrations).unwrap();

    h.backend.fail_next_migrations(1);
    let report = h.provisioner.migrate_all(&set).await.unwrap();
    // gamma is still provisioning and is left alone.
    assert_eq!(report.migrated.len() + report.failed.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.migrated[0].applied, vec![4]);

    let report = h.provisioner.migrate_all(&set).await.unwrap();
    assert!(report.failed.is_empty());
    let mut applied: Vec<_> = report.migrated.iter().map(|m| m.applied.clone()).collect();
    applied.sort();
    assert_eq!(applied, vec![vec![], vec![4]]);

    for id in [acme.id, beta.id] {
        assert!(h.provisioner.migrate_schema(id, &set).await.unwrap().is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn worker_provisions_queued_tenants() {
    let (state, jobs) = AppState::with_backend(
        Arc::new(common::test_config()),
        alumni_tenancy::db::memory::MemoryBackend::new(),
    );
    let handle = worker::start(state.lifecycle.clone(), jobs, Duration::from_secs(15));

    let tenant = state.lifecycle.create_tenant(request("acme")).await.unwrap();
    let mut status = tenant.status;
    for _ in 0..100 {
        status = state.registry.find(tenant.id).await.unwrap().status;
        if status == TenantStatus::Active {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(status, TenantStatus::Active);
    handle.abort();
}
