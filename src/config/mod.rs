//! Configuration and generated resources

pub mod minicluster;
pub mod params;
pub mod settings;
