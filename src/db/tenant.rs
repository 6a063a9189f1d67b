use std::fmt;

use uuid::Uuid;

use crate::error::{TenancyError, TenancyResult};

/// A validated PostgreSQL schema identifier.
///
/// Only `[a-z0-9_]`, starting with a letter, at most 63 bytes, so it can be
/// interpolated (quoted) into DDL without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaName(String);

impl SchemaName {
    pub fn parse(raw: &str) -> TenancyResult<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 63
            && raw.starts_with(|c: char| c.is_ascii_lowercase())
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(TenancyError::InvalidSchemaName(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted identifier for use in SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the PostgreSQL schema name for a given tenant id.
/// Derived from the id alone so it never changes for the tenant's lifetime.
pub fn schema_name(tenant_id: Uuid) -> SchemaName {
    SchemaName(format!("tenant_{}", tenant_id.simple()))
}

/// One step of the per-tenant schema. `{schema}` in `sql` is replaced with the
/// quoted schema identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantMigration {
    pub version: i64,
    pub name: String,
    pub sql: String,
}

impl TenantMigration {
    pub fn new(version: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
        }
    }

    pub fn render(&self, schema: &SchemaName) -> String {
        self.sql.replace("{schema}", &schema.quoted())
    }
}

/// Ordered list of tenant migrations with strictly increasing versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSet {
    migrations: Vec<TenantMigration>,
}

impl MigrationSet {
    pub fn new(migrations: Vec<TenantMigration>) -> TenancyResult<Self> {
        for pair in migrations.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(TenancyError::InvalidMigrationSet(format!(
                    "version {} follows {}",
                    pair[1].version, pair[0].version
                )));
            }
        }
        if let Some(first) = migrations.first() {
            if first.version <= 0 {
                return Err(TenancyError::InvalidMigrationSet(format!(
                    "versions must be positive, got {}",
                    first.version
                )));
            }
        }
        Ok(Self { migrations })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TenantMigration> {
        self.migrations.iter()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.migrations.last().map(|m| m.version)
    }
}

/// The tables every tenant schema gets.
pub fn tenant_migrations() -> MigrationSet {
    let migrations = vec![
        TenantMigration::new(
            1,
            "create_settings",
            r#"CREATE TABLE IF NOT EXISTS {schema}.settings (
                key        VARCHAR(191) PRIMARY KEY,
                value      JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        ),
        TenantMigration::new(
            2,
            "create_audit_log",
            r#"CREATE TABLE IF NOT EXISTS {schema}.audit_log (
                id            BIGSERIAL PRIMARY KEY,
                actor         TEXT,
                action        VARCHAR(128) NOT NULL,
                resource_type VARCHAR(64),
                resource_id   TEXT,
                detail        JSONB,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS audit_log_created_at_idx
                ON {schema}.audit_log (created_at DESC)"#,
        ),
        TenantMigration::new(
            3,
            "settings_updated_at_trigger",
            r#"CREATE OR REPLACE FUNCTION {schema}.update_updated_at()
               RETURNS TRIGGER AS $fn$
               BEGIN NEW.updated_at = NOW(); RETURN NEW; END;
               $fn$ LANGUAGE plpgsql;
               DROP TRIGGER IF EXISTS settings_updated_at ON {schema}.settings;
               CREATE TRIGGER settings_updated_at
               BEFORE UPDATE ON {schema}.settings
               FOR EACH ROW EXECUTE FUNCTION {schema}.update_updated_at()"#,
        ),
    ];

    // Versions above are literal and ascending.
    MigrationSet { migrations }
}
