use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::issuance::acme::AcmeError;
use crate::issuance::codec::CodecError;
use crate::issuance::dns_providers::DnsProviderError;
use crate::storage::StoreError;

/// Failure of a single certificate renewal.
#[derive(Debug, Error)]
pub enum RenewalError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("certificate authority error: {0}")]
    Authority(#[from] AcmeError),
    #[error(transparent)]
    ChallengeValidation(#[from] ChallengeFailures),
    #[error("DNS provider error: {0}")]
    Provider(#[from] DnsProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("certificate codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("renewal cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainFailureKind {
    /// The authorization offered no dns-01 challenge.
    NoDnsChallenge,
    /// The authority answered `invalid`; polling stopped early.
    Rejected {
        challenge_status: String,
        detail: Option<String>,
    },
    /// The retry budget ran out before the authorization became `valid`.
    NotValidated {
        attempts: u32,
        challenge_status: String,
        auth_status: String,
        detail: Option<String>,
    },
    Provider(String),
    Authority(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainFailure {
    pub domain: String,
    pub authorization_url: String,
    pub kind: DomainFailureKind,
}

impl fmt::Display for DomainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.domain)?;
        match &self.kind {
            DomainFailureKind::NoDnsChallenge => write!(
                f,
                "no DNS challenges for this authorization: {}",
                self.authorization_url
            ),
            DomainFailureKind::Rejected {
                challenge_status,
                detail,
            } => write!(
                f,
                "challenge rejected: [{}]{}",
                challenge_status,
                detail.as_deref().unwrap_or_default()
            ),
            DomainFailureKind::NotValidated {
                attempts,
                challenge_status,
                auth_status,
                detail,
            } => write!(
                f,
                "challenge validation was unsuccessful after {} attempt(s): [{}]{} auth status: [{}]",
                attempts,
                challenge_status,
                detail.as_deref().unwrap_or_default(),
                auth_status
            ),
            DomainFailureKind::Provider(message) => write!(f, "DNS provider failed: {message}"),
            DomainFailureKind::Authority(message) => {
                write!(f, "certificate authority failed: {message}")
            }
        }
    }
}

/// Every domain of one certificate whose challenge did not validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeFailures {
    pub certificate: String,
    pub failures: Vec<DomainFailure>,
}

impl ChallengeFailures {
    pub fn domains(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.domain.as_str()).collect()
    }
}

impl std::error::Error for ChallengeFailures {}

impl fmt::Display for ChallengeFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of the authorizations for '{}' failed",
            self.failures.len(),
            self.certificate
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CertificateFailure {
    pub name: String,
    pub elapsed: Duration,
    pub error: RenewalError,
}

/// Certificates that failed during one batch run.
#[derive(Debug)]
pub struct BatchError {
    pub failures: Vec<CertificateFailure>,
}

impl BatchError {
    pub fn names(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.name.as_str()).collect()
    }
}

impl std::error::Error for BatchError {}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} certificate renewal(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(
                f,
                "; '{}' after {}ms: {}",
                failure.name,
                failure.elapsed.as_millis(),
                failure.error
            )?;
        }
        Ok(())
    }
}
