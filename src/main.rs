use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alumni_tenancy::{
    app,
    config::Config,
    db::{self, postgres::PgBackend},
    services::{scope::TenancyMode, worker},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and registry migrations applied");

    if let TenancyMode::Single(schema) = &config.tenancy_mode {
        warn!(
            target: "tenancy::audit",
            "TENANCY_MODE=single:{schema}, tenant data is NOT isolated per tenant"
        );
    }

    let (state, jobs) = AppState::with_backend(config.clone(), PgBackend::new(pool));

    // Bring every live tenant schema up to the compiled-in migration set
    // before serving traffic. Failures are reported, not fatal.
    let report = state
        .provisioner
        .migrate_all(state.provisioner.migrations())
        .await?;
    for failed in &report.failed {
        warn!("Tenant {} left behind on migrations: {}", failed.tenant_id, failed.error);
    }
    info!(
        "Tenant schemas checked against v{}: {} up to date, {} failed",
        state.provisioner.migrations().latest_version().unwrap_or(0),
        report.migrated.len(),
        report.failed.len()
    );

    let _worker = worker::start(state.lifecycle.clone(), jobs, config.worker_interval());

    let app = app(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("alumni-tenancy API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
