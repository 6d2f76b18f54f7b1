//! DNS-01 record provisioning.
//!
//! A [`DnsProvider`] creates one TXT record and hands back a [`DnsRecordHandle`]
//! that removes exactly that record when cleaned. Providers are selected per
//! certificate through [`ProviderRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use thiserror::Error;

use crate::config::CertificateSpec;

mod cloudflare;
mod digitalocean;
pub mod http;
mod manual;
mod retry;

pub use cloudflare::CloudflareProvider;
pub use digitalocean::DigitalOceanProvider;
pub use manual::ManualProvider;
pub use retry::retry_provider_verification;

pub const TXT_RECORD: &str = "TXT";

#[derive(Debug, Error)]
pub enum DnsProviderError {
    #[error("{provider} provider misconfigured: {message}")]
    Configuration {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} API call failed: {message}")]
    Api {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} could not verify {record}: {message}")]
    Verification {
        provider: &'static str,
        record: String,
        message: String,
    },
    #[error("{provider} does not support {record_type} records")]
    UnsupportedRecordType {
        provider: &'static str,
        record_type: String,
    },
}

impl DnsProviderError {
    pub(crate) fn api(provider: &'static str, err: anyhow::Error) -> Self {
        Self::Api {
            provider,
            message: format!("{err:#}"),
        }
    }
}

/// Statically known provider implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Cloudflare,
    DigitalOcean,
    Manual,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cloudflare" => Some(Self::Cloudflare),
            "digitalocean" | "digital-ocean" => Some(Self::DigitalOcean),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cloudflare => "cloudflare",
            Self::DigitalOcean => "digitalocean",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Publishes `value` at `fqdn`. The certificate supplies provider hints such as the zone.
    async fn create(
        &self,
        record_type: &str,
        fqdn: &str,
        value: &str,
        certificate: &CertificateSpec,
    ) -> Result<Box<dyn DnsRecordHandle>, DnsProviderError>;
}

#[async_trait]
pub trait DnsRecordHandle: Send + Sync {
    fn describe(&self) -> String;

    /// Removes the record this handle was created for, leaving other values at the same name.
    async fn clean(self: Box<Self>) -> Result<(), DnsProviderError>;
}

pub(crate) fn ensure_txt(provider: &'static str, record_type: &str) -> Result<(), DnsProviderError> {
    if record_type.eq_ignore_ascii_case(TXT_RECORD) {
        Ok(())
    } else {
        Err(DnsProviderError::UnsupportedRecordType {
            provider,
            record_type: record_type.to_string(),
        })
    }
}

/// Maps provider names to implementations, falling back to a fixed default.
pub struct ProviderRegistry {
    default: Arc<dyn DnsProvider>,
    providers: HashMap<ProviderKind, Arc<dyn DnsProvider>>,
}

impl ProviderRegistry {
    pub fn new(default: Arc<dyn DnsProvider>) -> Self {
        let mut providers = HashMap::new();
        providers.insert(default.kind(), default.clone());
        Self { default, providers }
    }

    pub fn with(mut self, provider: Arc<dyn DnsProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn DnsProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn default_kind(&self) -> ProviderKind {
        self.default.kind()
    }

    pub fn registered(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }

    /// Never fails: unknown, unregistered or absent names resolve to the default provider.
    pub fn resolve(&self, name: Option<&str>) -> Arc<dyn DnsProvider> {
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return self.default.clone();
        };
        match ProviderKind::parse(name) {
            Some(kind) => match self.providers.get(&kind) {
                Some(provider) => provider.clone(),
                None => {
                    warn!(
                        "[dns] provider '{}' is not registered; using default '{}'",
                        kind,
                        self.default.kind()
                    );
                    self.default.clone()
                }
            },
            None => {
                warn!(
                    "[dns] unknown provider '{}'; using default '{}'",
                    name,
                    self.default.kind()
                );
                self.default.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDnsProvider;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(ManualProvider::new()))
            .with(Arc::new(RecordingDnsProvider::new(ProviderKind::Cloudflare)))
    }

    #[test]
    fn parses_provider_names_case_insensitively() {
        assert_eq!(ProviderKind::parse("Cloudflare"), Some(ProviderKind::Cloudflare));
        assert_eq!(ProviderKind::parse(" DIGITALOCEAN "), Some(ProviderKind::DigitalOcean));
        assert_eq!(ProviderKind::parse("manual"), Some(ProviderKind::Manual));
        assert_eq!(ProviderKind::parse("route53"), None);
    }

    #[test]
    fn resolves_registered_provider() {
        let registry = registry();
        assert_eq!(registry.resolve(Some("CLOUDFLARE")).kind(), ProviderKind::Cloudflare);
    }

    #[test]
    fn absent_or_unknown_names_use_default() {
        let registry = registry();
        assert_eq!(registry.resolve(None).kind(), ProviderKind::Manual);
        assert_eq!(registry.resolve(Some("  ")).kind(), ProviderKind::Manual);
        assert_eq!(registry.resolve(Some("azure")).kind(), ProviderKind::Manual);
    }

    #[test]
    fn known_but_unregistered_provider_uses_default() {
        let registry = registry();
        assert_eq!(registry.resolve(Some("digitalocean")).kind(), ProviderKind::Manual);
        assert_eq!(
            registry.registered(),
            vec![ProviderKind::Cloudflare, ProviderKind::Manual]
        );
    }

    #[test]
    fn only_txt_records_are_supported() {
        assert!(ensure_txt("Manual", "txt").is_ok());
        assert!(matches!(
            ensure_txt("Manual", "CNAME"),
            Err(DnsProviderError::UnsupportedRecordType { .. })
        ));
    }
}
