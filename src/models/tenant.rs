use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::tenant::SchemaName;
use crate::error::{TenancyError, TenancyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tenant_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Pending,
    Provisioning,
    Active,
    Suspended,
    PendingDeletion,
    Deleted,
}

impl TenantStatus {
    pub const ALL: [TenantStatus; 6] = [
        TenantStatus::Pending,
        TenantStatus::Provisioning,
        TenantStatus::Active,
        TenantStatus::Suspended,
        TenantStatus::PendingDeletion,
        TenantStatus::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::PendingDeletion => "pending_deletion",
            Self::Deleted => "deleted",
        }
    }

    /// Edges of the lifecycle state machine.
    pub fn can_transition_to(self, to: TenantStatus) -> bool {
        use TenantStatus::*;
        matches!(
            (self, to),
            (Pending, Provisioning)
                | (Provisioning, Active)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Pending, PendingDeletion)
                | (Provisioning, PendingDeletion)
                | (Active, PendingDeletion)
                | (Suspended, PendingDeletion)
                | (PendingDeletion, Deleted)
        )
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "plan_type", rename_all = "snake_case")]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    #[default]
    Free,
    Standard,
    Premium,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub schema_name: Option<String>,
    pub status: TenantStatus,
    pub plan: PlanType,
    pub trial_expires_at: Option<DateTime<Utc>>,
    pub settings: Value,
    pub provisioning_attempts: i32,
    pub last_error: Option<String>,
    pub deletion_due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn schema(&self) -> TenancyResult<Option<SchemaName>> {
        self.schema_name.as_deref().map(SchemaName::parse).transpose()
    }

    pub fn trial_expired(&self, now: DateTime<Utc>) -> bool {
        self.trial_expires_at.is_some_and(|expires_at| expires_at < now)
    }

    /// Decides whether a new request may enter this tenant's context.
    pub fn admit(&self, now: DateTime<Utc>) -> TenancyResult<()> {
        match self.status {
            TenantStatus::Active if self.trial_expired(now) => {
                Err(TenancyError::TrialExpired(self.slug.clone()))
            }
            TenantStatus::Active => Ok(()),
            TenantStatus::Suspended => Err(TenancyError::TenantSuspended(self.slug.clone())),
            status => Err(TenancyError::TenantUnavailable {
                slug: self.slug.clone(),
                status,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantDomain {
    pub hostname: String,
    pub tenant_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Registry row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub plan: PlanType,
    pub trial_expires_at: Option<DateTime<Utc>>,
    pub settings: Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub slug: String,
    pub name: String,
    pub plan: Option<PlanType>,
    pub trial_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub domains: Vec<String>,
    pub settings: Option<Value>,
}

/// Slugs end up in hostnames and in schema-related log lines: lowercase ASCII
/// letters, digits and hyphens, no leading or trailing hyphen, 2 to 63 chars.
pub fn validate_slug(raw: &str) -> TenancyResult<String> {
    let slug = raw.trim().to_lowercase();
    let len = slug.len();
    let valid = (2..=63).contains(&len)
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !slug.starts_with('-')
        && !slug.ends_with('-');
    if valid {
        Ok(slug)
    } else {
        Err(TenancyError::InvalidSlug(raw.to_string()))
    }
}

/// Canonical form of an inbound or registered hostname: trimmed, lower-cased,
/// without port and without the trailing root dot.
pub fn normalize_hostname(raw: &str) -> TenancyResult<String> {
    let trimmed = raw.trim();
    let host = if let Some(rest) = trimmed.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally followed by a port.
        match rest.split_once(']') {
            Some((addr, _)) => addr,
            None => return Err(TenancyError::InvalidHostname(raw.to_string())),
        }
    } else {
        trimmed.split(':').next().unwrap_or(trimmed)
    };
    let host = host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase();

    let valid = !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':')
        && host.split('.').all(|label| !label.is_empty() && label.len() <= 63);
    if valid {
        Ok(host)
    } else {
        Err(TenancyError::InvalidHostname(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_rules() {
        assert_eq!(validate_slug("Acme-U").unwrap(), "acme-u");
        assert!(validate_slug("a").is_err());
        assert!(validate_slug("-acme").is_err());
        assert!(validate_slug("acme-").is_err());
        assert!(validate_slug("acme_u").is_err());
        assert!(validate_slug("acme;drop").is_err());
    }

    #[test]
    fn hostnames_are_normalized() {
        assert_eq!(
            normalize_hostname("ACME.Example.COM").unwrap(),
            "acme.example.com"
        );
        assert_eq!(
            normalize_hostname(" acme.example.com:8443 ").unwrap(),
            "acme.example.com"
        );
        assert_eq!(
            normalize_hostname("acme.example.com.").unwrap(),
            "acme.example.com"
        );
        assert_eq!(normalize_hostname("[::1]:8080").unwrap(), "::1");
        assert!(normalize_hostname("").is_err());
        assert!(normalize_hostname("acme..com").is_err());
        assert!(normalize_hostname("acme/evil.com").is_err());
    }

    #[test]
    fn lifecycle_edges() {
        use TenantStatus::*;
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        assert!(PendingDeletion.can_transition_to(Deleted));
        assert!(!Provisioning.can_transition_to(Suspended));
        assert!(!Deleted.can_transition_to(Active));
        assert!(!Active.can_transition_to(Deleted));
    }

    fn tenant(status: TenantStatus, trial: Option<DateTime<Utc>>) -> Tenant {
        Tenant {
            id: Uuid::new_v4(),
            slug: "beta".into(),
            name: "Beta".into(),
            schema_name: None,
            status,
            plan: PlanType::Free,
            trial_expires_at: trial,
            settings: Value::Object(Default::default()),
            provisioning_attempts: 0,
            last_error: None,
            deletion_due_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn admission_follows_status_and_trial() {
        let now = Utc::now();
        assert!(tenant(TenantStatus::Active, None).admit(now).is_ok());
        assert!(matches!(
            tenant(TenantStatus::Suspended, None).admit(now),
            Err(TenancyError::TenantSuspended(_))
        ));
        assert!(matches!(
            tenant(TenantStatus::Provisioning, None).admit(now),
            Err(TenancyError::TenantUnavailable { .. })
        ));
        let expired = now - chrono::Duration::days(1);
        assert!(matches!(
            tenant(TenantStatus::Active, Some(expired)).admit(now),
            Err(TenancyError::TrialExpired(_))
        ));
    }
}
