pub mod audit_log;
pub mod health;
pub mod metrics;
pub mod settings;
pub mod tenant_info;
pub mod tenants;
