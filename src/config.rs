use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::normalize_hostnames;
use crate::issuance::challenge::PollPolicy;
use crate::issuance::dns_providers::ProviderKind;

pub const DEFAULT_AUTHORITY_URL: &str = "https://acme-staging-v02.api.letsencrypt.org";
pub const DEFAULT_RENEWAL_THRESHOLD_DAYS: i64 = 10;
pub const DEFAULT_KEY_BITS: u32 = 2048;

const ENV_CONTACT_EMAIL: &str = "ACME_RENEWER_CONTACT_EMAIL";
const ENV_AUTHORITY_URL: &str = "ACME_RENEWER_AUTHORITY_URL";
const ENV_CLOUDFLARE_TOKEN: &str = "ACME_RENEWER_CLOUDFLARE_TOKEN";
const ENV_DIGITALOCEAN_TOKEN: &str = "ACME_RENEWER_DIGITALOCEAN_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("certificate '{certificate}': {message}")]
    Certificate { certificate: String, message: String },
    #[error("{provider} provider is selected by '{certificate}' but has no API token")]
    MissingCredentials {
        provider: &'static str,
        certificate: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchPolicy {
    /// Stop at the first certificate that fails to renew.
    #[default]
    FailFast,
    /// Attempt every certificate and report all failures together.
    ContinueOnError,
}

/// One configured certificate. Hostnames are normalized and never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSpec {
    pub name: String,
    pub hostnames: Vec<String>,
    pub dns_provider: Option<String>,
    pub dns_zone: Option<String>,
    pub store: Option<PathBuf>,
}

impl CertificateSpec {
    pub fn new<S: AsRef<str>>(name: &str, hostnames: &[S]) -> Result<Self, ConfigError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid(
                "certificate name is required".to_string(),
            ));
        }
        let hostnames = normalize_hostnames(hostnames).map_err(|err| ConfigError::Certificate {
            certificate: name.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            name: name.to_string(),
            hostnames,
            dns_provider: None,
            dns_zone: None,
            store: None,
        })
    }

    pub fn with_dns_provider(mut self, provider: impl Into<String>) -> Self {
        self.dns_provider = Some(provider.into());
        self
    }

    pub fn with_dns_zone(mut self, zone: impl Into<String>) -> Self {
        self.dns_zone = Some(zone.into());
        self
    }

    pub fn with_store(mut self, store: impl Into<PathBuf>) -> Self {
        self.store = Some(store.into());
        self
    }

    /// Common name for the CSR.
    pub fn primary_hostname(&self) -> Option<&str> {
        self.hostnames.first().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_token: String,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub contact_email: String,
    pub authority_url: Url,
    pub account_dir: PathBuf,
    pub certificate_dirs: Vec<PathBuf>,
    pub default_dns_provider: ProviderKind,
    pub batch_policy: BatchPolicy,
    pub renewal_threshold: chrono::Duration,
    pub key_bits: u32,
    pub poll: PollPolicy,
    pub cloudflare: Option<ProviderCredentials>,
    pub digitalocean: Option<ProviderCredentials>,
    pub certificates: Vec<CertificateSpec>,
}

impl ManagerConfig {
    pub fn authority_host(&self) -> &str {
        self.authority_url.host_str().unwrap_or_default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut file: ConfigFile = toml::from_str(&raw)?;
        file.apply_env_overrides(|key| std::env::var(key).ok());
        let config = file.into_config()?;
        info!(
            "[config] loaded {} certificate(s) from {}",
            config.certificates.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(raw)?;
        file.into_config()
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    manager: ManagerSection,
    #[serde(default)]
    certificates: BTreeMap<String, CertificateEntry>,
}

#[derive(Debug, Deserialize)]
struct ManagerSection {
    #[serde(default)]
    contact_email: String,
    authority_url: Option<String>,
    account_dir: PathBuf,
    certificate_dirs: Vec<PathBuf>,
    default_dns_provider: Option<String>,
    #[serde(default)]
    batch_policy: BatchPolicy,
    renewal_threshold_days: Option<i64>,
    key_bits: Option<u32>,
    #[serde(default)]
    challenge: ChallengeSection,
    cloudflare: Option<TokenSection>,
    digitalocean: Option<TokenSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ChallengeSection {
    propagation_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
    backoff_step_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenSection {
    api_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Hostnames {
    List(Vec<String>),
    Joined(String),
}

impl Hostnames {
    fn into_list(self) -> Vec<String> {
        match self {
            Hostnames::List(list) => list,
            Hostnames::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CertificateEntry {
    hostnames: Hostnames,
    dns_provider: Option<String>,
    dns_zone: Option<String>,
    store: Option<PathBuf>,
}

impl ConfigFile {
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let manager = &mut self.manager;
        if let Some(email) = lookup(ENV_CONTACT_EMAIL) {
            manager.contact_email = email;
        }
        if let Some(url) = lookup(ENV_AUTHORITY_URL) {
            manager.authority_url = Some(url);
        }
        if let Some(token) = lookup(ENV_CLOUDFLARE_TOKEN) {
            manager.cloudflare = Some(TokenSection { api_token: token });
        }
        if let Some(token) = lookup(ENV_DIGITALOCEAN_TOKEN) {
            manager.digitalocean = Some(TokenSection { api_token: token });
        }
    }

    fn into_config(self) -> Result<ManagerConfig, ConfigError> {
        let manager = self.manager;

        let contact_email = manager.contact_email.trim().to_string();
        if contact_email.is_empty() || !contact_email.contains('@') {
            return Err(ConfigError::Invalid(
                "manager.contact_email must be an email address".to_string(),
            ));
        }

        let raw_url = manager
            .authority_url
            .unwrap_or_else(|| DEFAULT_AUTHORITY_URL.to_string());
        let authority_url = Url::parse(raw_url.trim()).map_err(|err| {
            ConfigError::Invalid(format!("manager.authority_url '{raw_url}': {err}"))
        })?;
        if authority_url.host_str().is_none() {
            return Err(ConfigError::Invalid(format!(
                "manager.authority_url '{raw_url}' has no host"
            )));
        }

        if manager.certificate_dirs.is_empty() {
            return Err(ConfigError::Invalid(
                "manager.certificate_dirs needs at least one directory".to_string(),
            ));
        }

        let default_dns_provider = match manager.default_dns_provider.as_deref() {
            None => ProviderKind::Manual,
            Some(name) => ProviderKind::parse(name).ok_or_else(|| {
                ConfigError::Invalid(format!("unknown default_dns_provider '{name}'"))
            })?,
        };

        let threshold_days = manager
            .renewal_threshold_days
            .unwrap_or(DEFAULT_RENEWAL_THRESHOLD_DAYS);
        if threshold_days <= 0 {
            return Err(ConfigError::Invalid(
                "manager.renewal_threshold_days must be positive".to_string(),
            ));
        }

        let key_bits = manager.key_bits.unwrap_or(DEFAULT_KEY_BITS);
        if key_bits < 2048 {
            return Err(ConfigError::Invalid(format!(
                "manager.key_bits {key_bits} is below 2048"
            )));
        }

        let defaults = PollPolicy::default();
        let poll = PollPolicy {
            propagation_delay: manager
                .challenge
                .propagation_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.propagation_delay),
            max_attempts: manager
                .challenge
                .max_attempts
                .unwrap_or(defaults.max_attempts)
                .max(1),
            backoff_step: manager
                .challenge
                .backoff_step_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff_step),
        };

        let cloudflare = credentials(manager.cloudflare);
        let digitalocean = credentials(manager.digitalocean);

        let mut certificates = Vec::with_capacity(self.certificates.len());
        for (name, entry) in self.certificates {
            let mut spec = CertificateSpec::new(&name, &entry.hostnames.into_list())?;
            spec.dns_zone = entry.dns_zone.filter(|zone| !zone.trim().is_empty());
            spec.store = entry.store;
            if let Some(provider) = entry.dns_provider.filter(|p| !p.trim().is_empty()) {
                match ProviderKind::parse(&provider) {
                    Some(ProviderKind::Cloudflare) if cloudflare.is_none() => {
                        return Err(ConfigError::MissingCredentials {
                            provider: "Cloudflare",
                            certificate: name,
                        });
                    }
                    Some(ProviderKind::DigitalOcean) if digitalocean.is_none() => {
                        return Err(ConfigError::MissingCredentials {
                            provider: "DigitalOcean",
                            certificate: name,
                        });
                    }
                    Some(_) => {}
                    None => warn!(
                        "[config] certificate '{}' names unknown DNS provider '{}'; the default provider will be used",
                        name, provider
                    ),
                }
                spec.dns_provider = Some(provider);
            }
            certificates.push(spec);
        }

        Ok(ManagerConfig {
            contact_email,
            authority_url,
            account_dir: manager.account_dir,
            certificate_dirs: manager.certificate_dirs,
            default_dns_provider,
            batch_policy: manager.batch_policy,
            renewal_threshold: chrono::Duration::days(threshold_days),
            key_bits,
            poll,
            cloudflare,
            digitalocean,
            certificates,
        })
    }
}

fn credentials(section: Option<TokenSection>) -> Option<ProviderCredentials> {
    section
        .map(|s| s.api_token.trim().to_string())
        .filter(|token| !token.is_empty())
        .map(|api_token| ProviderCredentials { api_token })
}
