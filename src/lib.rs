pub mod config;
pub mod domain;
pub mod error;
pub mod issuance;
pub mod renewal;
pub mod service;
pub mod storage;

#[cfg(test)]
mod testing;

pub use config::{BatchPolicy, CertificateSpec, ConfigError, ManagerConfig};
pub use error::{BatchError, ChallengeFailures, RenewalError};
pub use renewal::{BatchSummary, RenewalOrchestrator, RenewalRequest};
