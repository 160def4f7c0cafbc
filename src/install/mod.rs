//! Cluster preparation: the Flux Operator and the munge key secret

pub mod credentials;
pub mod operator;
