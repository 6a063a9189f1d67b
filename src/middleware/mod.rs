pub mod super_admin;
pub mod tenant;
