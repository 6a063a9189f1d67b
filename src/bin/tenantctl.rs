/// Operator tooling for tenant schemas.
/// Runs against the registry directly; the API server does not need to be up.
///
/// Usage:
///   tenantctl migrate [--tenant ID]   Apply pending tenant migrations
///   tenantctl purge-due               Purge tenants whose deletion grace period ended
///   tenantctl retry --tenant ID       Re-arm provisioning after the attempt budget ran out
///   tenantctl status --tenant ID      Print the registry entry of one tenant
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use alumni_tenancy::{
    db::{self, postgres::PgBackend, tenant::tenant_migrations},
    models::tenant::TenantStatus,
    services::{
        lifecycle::{LifecycleManager, LifecycleSettings, PurgeOutcome},
        provisioner::Provisioner,
        registry::SchemaRegistry,
    },
};

#[derive(Parser)]
#[command(name = "tenantctl", about = "Manage alumni-tenancy tenant schemas")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending tenant migrations (all live tenants if --tenant is omitted)
    Migrate {
        #[arg(long)]
        tenant: Option<Uuid>,
    },
    /// Purge every pending_deletion tenant whose grace period has elapsed
    PurgeDue,
    /// Reset the provisioning attempt counter and try once more
    Retry {
        #[arg(long)]
        tenant: Uuid,
    },
    /// Show registry state for one tenant
    Status {
        #[arg(long)]
        tenant: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;
    let pool = db::create_pool(&database_url, 5).await?;
    db::run_migrations(&pool).await?;

    let backend = PgBackend::new(pool);
    let registry = SchemaRegistry::new(Arc::new(backend.clone()))
        .with_base_domain(std::env::var("APP_BASE_DOMAIN").ok());
    let provisioner = Provisioner::new(registry.clone(), Arc::new(backend), tenant_migrations());
    let lifecycle = LifecycleManager::new(
        registry.clone(),
        provisioner.clone(),
        LifecycleSettings::default(),
    );

    match args.command {
        Command::Migrate { tenant: Some(id) } => {
            let applied = provisioner.migrate_schema(id, provisioner.migrations()).await?;
            tracing::info!("Tenant {id}: applied {:?}", applied);
        }
        Command::Migrate { tenant: None } => {
            let report = provisioner.migrate_all(provisioner.migrations()).await?;
            tracing::info!(
                "Migrated {} tenant(s), {} failure(s)",
                report.migrated.len(),
                report.failed.len()
            );
            for failed in &report.failed {
                tracing::error!("Tenant {}: {}", failed.tenant_id, failed.error);
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} tenant(s) failed to migrate", report.failed.len());
            }
        }
        Command::PurgeDue => {
            let now = Utc::now();
            let due = registry.list(&[TenantStatus::PendingDeletion]).await?;
            tracing::info!("Checking {} tenant(s) pending deletion", due.len());
            for tenant in due {
                if tenant.deletion_due_at.is_some_and(|at| at > now) {
                    continue;
                }
                match lifecycle.purge(tenant.id, false).await {
                    Ok(PurgeOutcome::Purged) => tracing::info!("Purged tenant {}", tenant.slug),
                    Ok(outcome) => tracing::info!("Tenant {}: {:?}", tenant.slug, outcome),
                    Err(e) => tracing::error!("Error purging tenant {}: {}", tenant.slug, e),
                }
            }
        }
        Command::Retry { tenant } => {
            lifecycle.retry_provisioning(tenant).await?;
            let tenant = lifecycle.provision(tenant).await?;
            tracing::info!("Tenant {} is {}", tenant.slug, tenant.status);
        }
        Command::Status { tenant } => {
            let tenant = registry.find(tenant).await?;
            let domains = registry.domains(tenant.id).await?;
            println!("{}", serde_json::to_string_pretty(&tenant)?);
            for domain in domains {
                println!("domain: {}", domain.hostname);
            }
        }
    }

    Ok(())
}
