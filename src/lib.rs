//! Bursting of Flux jobs onto ephemeral GKE clusters through the Flux Operator

pub mod burst;
pub mod commands;
pub mod config;
pub mod install;
pub mod k8s;
pub mod utils;

#[cfg(test)]
pub mod testing;
