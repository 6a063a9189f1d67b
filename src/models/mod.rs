pub mod setting;
pub mod tenant;
