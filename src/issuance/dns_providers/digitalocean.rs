use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{
    DnsProvider, DnsProviderError, DnsRecordHandle, ProviderKind, TXT_RECORD, ensure_txt, http,
    retry_provider_verification,
};
use crate::config::CertificateSpec;
use crate::domain::matches_zone;

const PROVIDER: &str = "DigitalOcean";
const API_BASE: &str = "https://api.digitalocean.com/v2";
const RECORD_TTL: u32 = 300;
const DOMAINS_PER_PAGE: u32 = 200;
const VERIFY_TIMEOUT: Duration = Duration::from_secs(3);
const VERIFY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct DigitalOceanDnsRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    data: &'a str,
    ttl: u32,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordResponse {
    domain_record: DigitalOceanDnsRecordResult,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordResult {
    id: u64,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize)]
struct DigitalOceanDomain {
    name: String,
}

#[derive(Deserialize)]
struct DigitalOceanDomainListResponse {
    #[serde(default)]
    domains: Vec<DigitalOceanDomain>,
}

/// `_acme-challenge.example.com` in `example.com` becomes `_acme-challenge`.
fn to_relative_name(record_name: &str, domain: &str) -> String {
    let record_name = record_name.trim_end_matches('.');
    let domain = domain.trim_end_matches('.');
    if record_name.eq_ignore_ascii_case(domain) {
        return "@".to_string();
    }
    let suffix = format!(".{}", domain.to_ascii_lowercase());
    if record_name.to_ascii_lowercase().ends_with(&suffix) {
        record_name[..record_name.len() - suffix.len()].to_string()
    } else {
        record_name.to_string()
    }
}

/// DigitalOcean quotes TXT data itself.
fn normalize_txt_content(value: &str) -> String {
    value.trim().trim_matches('"').trim().to_string()
}

struct DigitalOceanApi {
    client: Client,
    api_token: String,
    base_url: String,
}

impl DigitalOceanApi {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn list_domains(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("/domains"))
            .query(&[("per_page", DOMAINS_PER_PAGE)])
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to list DigitalOcean domains")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.ok();
            return Err(http::status_error(PROVIDER, status, body));
        }

        let listed: DigitalOceanDomainListResponse = response
            .json()
            .await
            .context("Failed to parse DigitalOcean domain list")?;
        Ok(listed.domains.into_iter().map(|d| d.name).collect())
    }

    async fn create_txt_record(&self, domain: &str, record_name: &str, value: &str) -> Result<u64> {
        let relative_name = to_relative_name(record_name, domain);
        let data = normalize_txt_content(value);
        let record = DigitalOceanDnsRecord {
            record_type: TXT_RECORD,
            name: &relative_name,
            data: &data,
            ttl: RECORD_TTL,
        };

        let response = self
            .client
            .post(self.url(&format!("/domains/{domain}/records")))
            .bearer_auth(&self.api_token)
            .json(&record)
            .send()
            .await
            .context("Failed to create DigitalOcean DNS record")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.ok();
            return Err(http::status_error(PROVIDER, status, body));
        }

        let created: DigitalOceanDnsRecordResponse = response
            .json()
            .await
            .context("Failed to parse DigitalOcean DNS record response")?;
        Ok(created.domain_record.id)
    }

    async fn fetch_record_data(&self, domain: &str, record_id: u64) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.url(&format!("/domains/{domain}/records/{record_id}")))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to fetch DigitalOcean DNS record")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.ok();
            return Err(http::status_error(PROVIDER, status, body));
        }

        let record: DigitalOceanDnsRecordResponse = response
            .json()
            .await
            .context("Failed to parse DigitalOcean DNS record response")?;
        Ok(record.domain_record.data)
    }

    async fn delete_record(&self, domain: &str, record_id: u64) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/domains/{domain}/records/{record_id}")))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to delete DigitalOcean DNS record")?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(http::status_error(PROVIDER, status, None))
    }
}

pub struct DigitalOceanProvider {
    api: Arc<DigitalOceanApi>,
    domains: Mutex<Option<Vec<String>>>,
}

impl DigitalOceanProvider {
    pub fn new(client: Client, api_token: impl Into<String>) -> Self {
        Self::with_base_url(client, api_token, API_BASE)
    }

    pub fn with_base_url(
        client: Client,
        api_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            api: Arc::new(DigitalOceanApi {
                client,
                api_token: api_token.into(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
            }),
            domains: Mutex::new(None),
        }
    }

    async fn domain_for(&self, fqdn: &str, hint: Option<&str>) -> Result<String> {
        if let Some(hint) = hinted_domain(fqdn, hint) {
            return Ok(hint);
        }
        let mut cached = self.domains.lock().await;
        if let Some(domain) = cached
            .as_deref()
            .and_then(|domains| most_specific_domain(domains, fqdn))
        {
            return Ok(domain);
        }

        // Unknown name: domains may have been added since the last listing.
        let domains = self.api.list_domains().await?;
        let selected = most_specific_domain(&domains, fqdn);
        *cached = Some(domains);
        selected.ok_or_else(|| anyhow!("No DigitalOcean domain found for {}", fqdn))
    }
}

/// The configured zone, when `fqdn` actually lives inside it.
fn hinted_domain(fqdn: &str, hint: Option<&str>) -> Option<String> {
    hint.map(|h| h.trim().trim_end_matches('.'))
        .filter(|h| !h.is_empty() && matches_zone(fqdn, h))
        .map(|h| h.to_ascii_lowercase())
}

fn most_specific_domain(domains: &[String], fqdn: &str) -> Option<String> {
    domains
        .iter()
        .filter(|domain| matches_zone(fqdn, domain))
        .max_by_key(|domain| domain.len())
        .cloned()
}

#[async_trait]
impl DnsProvider for DigitalOceanProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DigitalOcean
    }

    async fn create(
        &self,
        record_type: &str,
        fqdn: &str,
        value: &str,
        certificate: &CertificateSpec,
    ) -> Result<Box<dyn DnsRecordHandle>, DnsProviderError> {
        ensure_txt(PROVIDER, record_type)?;
        let domain = self
            .domain_for(fqdn, certificate.dns_zone.as_deref())
            .await
            .map_err(|err| DnsProviderError::api(PROVIDER, err))?;
        let record_id = self
            .api
            .create_txt_record(&domain, fqdn, value)
            .await
            .map_err(|err| DnsProviderError::api(PROVIDER, err))?;

        let handle = DigitalOceanRecord {
            api: self.api.clone(),
            domain: domain.clone(),
            record_id,
            fqdn: fqdn.to_string(),
        };

        let expected = normalize_txt_content(value);
        let api = &self.api;
        let domain_ref = domain.as_str();
        let expected_ref = expected.as_str();
        let verified = retry_provider_verification(
            &format!("record {record_id}"),
            "DigitalOcean record verification",
            VERIFY_TIMEOUT,
            VERIFY_INTERVAL,
            || async move {
                Ok(api
                    .fetch_record_data(domain_ref, record_id)
                    .await?
                    .is_some_and(|data| normalize_txt_content(&data) == expected_ref))
            },
        )
        .await;

        if let Err(err) = verified {
            warn!("[digitalocean] {} failed verification: {:#}", fqdn, err);
            if let Err(clean_err) = Box::new(handle).clean().await {
                warn!("[digitalocean] rollback of {} failed: {}", fqdn, clean_err);
            }
            return Err(DnsProviderError::Verification {
                provider: PROVIDER,
                record: fqdn.to_string(),
                message: format!("{err:#}"),
            });
        }

        info!(
            "[digitalocean] [{}] TXT {} created in {} (id {})",
            certificate.name, fqdn, domain, record_id
        );
        Ok(Box::new(handle))
    }
}

struct DigitalOceanRecord {
    api: Arc<DigitalOceanApi>,
    domain: String,
    record_id: u64,
    fqdn: String,
}

#[async_trait]
impl DnsRecordHandle for DigitalOceanRecord {
    fn describe(&self) -> String {
        format!("digitalocean TXT {} ({})", self.fqdn, self.record_id)
    }

    async fn clean(self: Box<Self>) -> Result<(), DnsProviderError> {
        self.api
            .delete_record(&self.domain, self.record_id)
            .await
            .map_err(|err| DnsProviderError::api(PROVIDER, err))?;
        debug!("[digitalocean] removed {} ({})", self.fqdn, self.record_id);
        Ok(())
    }
}
