pub mod memory;
pub mod postgres;
pub mod store;
pub mod tenant;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Pool shared by every tenant. Connections go back to the pool with their
/// `search_path` reset, so a checked-out connection never carries the
/// previous request's tenant.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .after_release(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("RESET search_path").execute(&mut *conn).await?;
                Ok(true)
            })
        })
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run the public-schema (registry) migrations embedded in ./migrations/
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
