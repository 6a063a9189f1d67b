pub mod audit;
pub mod context;
pub mod lifecycle;
pub mod metrics;
pub mod provisioner;
pub mod registry;
pub mod resolver;
pub mod scope;
pub mod worker;
