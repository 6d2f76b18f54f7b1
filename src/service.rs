use std::sync::Arc;

use log::info;
use reqwest::Client;

use crate::config::{ConfigError, ManagerConfig};
use crate::issuance::acme::HttpAcmeConnector;
use crate::issuance::codec::OpenSslCodec;
use crate::issuance::dns_providers::{
    CloudflareProvider, DigitalOceanProvider, DnsProvider, ManualProvider, ProviderKind,
    ProviderRegistry, http,
};
use crate::issuance::renewer::{CertificateRenewer, RenewerSettings};
use crate::renewal::RenewalOrchestrator;
use crate::storage::{
    CertificateStore, CompositeCertificateStore, FileSystemAccountStore,
    FileSystemCertificateStore, StoreRouter,
};

/// Registers every provider that has credentials. The default must be among them.
pub fn build_registry(config: &ManagerConfig, client: &Client) -> Result<ProviderRegistry, ConfigError> {
    let mut available: Vec<Arc<dyn DnsProvider>> = vec![Arc::new(ManualProvider::new())];
    if let Some(credentials) = &config.cloudflare {
        available.push(Arc::new(CloudflareProvider::new(
            client.clone(),
            credentials.api_token.clone(),
        )));
    }
    if let Some(credentials) = &config.digitalocean {
        available.push(Arc::new(DigitalOceanProvider::new(
            client.clone(),
            credentials.api_token.clone(),
        )));
    }

    let default_kind = config.default_dns_provider;
    let position = available
        .iter()
        .position(|provider| provider.kind() == default_kind)
        .ok_or_else(|| {
            ConfigError::Invalid(format!(
                "default_dns_provider {default_kind} has no API token configured"
            ))
        })?;
    let default = available.remove(position);

    let registry = available
        .into_iter()
        .fold(ProviderRegistry::new(default), ProviderRegistry::with);
    let names: Vec<&str> = registry.registered().iter().map(|k| k.as_str()).collect();
    info!(
        "[service] DNS providers: {} (default {})",
        names.join(", "),
        registry.default_kind()
    );
    Ok(registry)
}

pub fn build_store_router(config: &ManagerConfig) -> Result<StoreRouter, ConfigError> {
    let stores: Vec<Arc<dyn CertificateStore>> = config
        .certificate_dirs
        .iter()
        .map(|dir| Arc::new(FileSystemCertificateStore::new(dir.clone())) as Arc<dyn CertificateStore>)
        .collect();
    let composite =
        CompositeCertificateStore::new(stores).map_err(|err| ConfigError::Invalid(err.to_string()))?;
    Ok(StoreRouter::new(Arc::new(composite)))
}

/// Wires a configuration into an orchestrator backed by the HTTP authority and
/// filesystem stores.
pub fn build_orchestrator(config: &ManagerConfig) -> Result<RenewalOrchestrator, ConfigError> {
    let client = http::build_client();
    let registry = build_registry(config, &client)?;
    let stores = build_store_router(config)?;

    let settings = RenewerSettings {
        contact_email: config.contact_email.clone(),
        authority_host: config.authority_host().to_string(),
        key_bits: config.key_bits,
        poll: config.poll,
    };
    let renewer = CertificateRenewer::new(
        settings,
        Arc::new(HttpAcmeConnector::new(client, config.authority_url.as_str())),
        Arc::new(FileSystemAccountStore::new(config.account_dir.clone())),
        stores.clone(),
        Arc::new(registry),
        Arc::new(OpenSslCodec),
    );

    info!(
        "[service] authority {} with {} certificate store(s)",
        config.authority_url,
        config.certificate_dirs.len()
    );
    Ok(RenewalOrchestrator::new(
        config.certificates.clone(),
        stores,
        Arc::new(renewer),
        config.batch_policy,
        config.renewal_threshold,
    ))
}
