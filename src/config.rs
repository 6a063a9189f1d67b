use std::env;
use std::time::Duration;

use crate::services::lifecycle::LifecycleSettings;
use crate::services::scope::TenancyMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub host: String,
    pub port: u16,
    pub super_admin_key: String,
    /// Tenants are also reachable as `<slug>.<app_base_domain>`.
    pub app_base_domain: Option<String>,
    pub tenancy_mode: TenancyMode,
    pub provisioning_max_attempts: i32,
    pub provisioning_backoff_seconds: u64,
    pub deletion_grace_hours: i64,
    pub worker_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let tenancy_mode = env::var("TENANCY_MODE")
            .unwrap_or_else(|_| "schema".into())
            .parse::<TenancyMode>()?;

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".into())
                .parse()?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT").unwrap_or_else(|_| "8080".into()).parse()?,
            super_admin_key: required("SUPER_ADMIN_KEY")?,
            app_base_domain: env::var("APP_BASE_DOMAIN").ok().filter(|s| !s.is_empty()),
            tenancy_mode,
            provisioning_max_attempts: env::var("PROVISIONING_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "5".into())
                .parse()?,
            provisioning_backoff_seconds: env::var("PROVISIONING_BACKOFF_SECONDS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
            deletion_grace_hours: env::var("DELETION_GRACE_HOURS")
                .unwrap_or_else(|_| "72".into())
                .parse()?,
            worker_interval_seconds: env::var("WORKER_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "15".into())
                .parse()?,
        })
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            max_provisioning_attempts: self.provisioning_max_attempts,
            base_backoff: Duration::from_secs(self.provisioning_backoff_seconds),
            deletion_grace: chrono::Duration::hours(self.deletion_grace_hours),
        }
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_seconds.max(1))
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Missing required env var: {}", key))
}
