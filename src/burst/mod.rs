//! Job admission and the bursting control loop

pub mod job;
pub mod registry;
pub mod runner;
pub mod scheduler;
