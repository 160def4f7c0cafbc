//! Utility modules for fluxburst-gke

pub mod dryrun;
pub mod errors;
pub mod logger;
pub mod preflight;
pub mod prereqs;
pub mod progress;
pub mod prompt;
pub mod retry;

pub use prompt::confirm;
