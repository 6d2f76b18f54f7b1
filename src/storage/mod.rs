use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::CertificateSpec;
use crate::issuance::acme::{Account, AccountDetails, SigningKey};

mod cert_info;
mod composite;
mod filesystem;

pub use cert_info::cert_info_from_pkcs12;
pub use composite::CompositeCertificateStore;
pub use filesystem::{FileSystemAccountStore, FileSystemCertificateStore};

/// Errors produced by certificate and account storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid certificate identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("failed to read certificate archive '{identifier}': {detail}")]
    Archive { identifier: String, detail: String },
    #[error("failed to encode or decode account data: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("composite store needs at least one backing store")]
    NoBackingStore,
    #[error("{} of {total} backing store writes failed: {}", .failures.len(), .failures.join("; "))]
    Partial { total: usize, failures: Vec<String> },
}

/// Observed state of a previously issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub identifier: String,
    pub expiration: DateTime<Utc>,
    /// RFC 4514 subject, e.g. `CN=example.com`.
    pub subject_name: String,
    /// DNS names from the subject-alternative-name extension.
    pub subject_alternative_names: Vec<String>,
    /// SHA-256 over the leaf certificate DER, hex encoded.
    pub fingerprint: String,
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    fn describe(&self) -> String;
    /// `Ok(None)` when nothing has been issued under `identifier` yet.
    async fn get_cert_info(&self, identifier: &str) -> Result<Option<CertInfo>, StoreError>;
    async fn store_certificate(&self, identifier: &str, archive: &[u8])
    -> Result<(), StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self) -> Result<Option<Account>, StoreError>;
    async fn store_account(
        &self,
        details: &AccountDetails,
        key: &SigningKey,
    ) -> Result<(), StoreError>;
}

/// Picks the store a certificate is read from and written to.
#[derive(Clone)]
pub struct StoreRouter {
    default: Arc<dyn CertificateStore>,
}

impl StoreRouter {
    pub fn new(default: Arc<dyn CertificateStore>) -> Self {
        Self { default }
    }

    pub fn for_spec(&self, spec: &CertificateSpec) -> Arc<dyn CertificateStore> {
        match &spec.store {
            Some(root) => Arc::new(FileSystemCertificateStore::new(root.clone())),
            None => self.default.clone(),
        }
    }
}
