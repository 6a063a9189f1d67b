use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::error::{TenancyError, TenancyResult};

/// One entry of a tenant's key-value settings bag, stored inside the tenant schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TenantSetting {
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PutSettingRequest {
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub detail: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// An audit log entry to record.
#[derive(Debug, Clone, Default)]
pub struct NewAuditEntry {
    pub actor: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub detail: Option<Value>,
}

pub fn validate_setting_key(key: &str) -> TenancyResult<()> {
    let valid = !key.is_empty()
        && key.len() <= 191
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(TenancyError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_keys() {
        assert!(validate_setting_key("branding.primary_color").is_ok());
        assert!(validate_setting_key("").is_err());
        assert!(validate_setting_key("a b").is_err());
        assert!(validate_setting_key(&"k".repeat(192)).is_err());
    }
}
