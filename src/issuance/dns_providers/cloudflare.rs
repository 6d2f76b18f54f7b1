use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    DnsProvider, DnsProviderError, DnsRecordHandle, ProviderKind, TXT_RECORD, ensure_txt, http,
    retry_provider_verification,
};
use crate::config::CertificateSpec;
use crate::domain::matches_zone;

const PROVIDER: &str = "Cloudflare";
const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const RECORD_TTL: u32 = 120;
const ZONES_PER_PAGE: u32 = 50;
const IDENTICAL_RECORD_EXISTS: u32 = 81058;
const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);
const VERIFY_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Deserialize)]
struct CloudflareZone {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct ResultInfo {
    #[serde(default)]
    total_pages: u32,
}

#[derive(Deserialize)]
struct CloudflareZoneListResponse {
    #[serde(default)]
    result: Vec<CloudflareZone>,
    success: bool,
    result_info: Option<ResultInfo>,
}

#[derive(Serialize)]
struct CloudflareDnsRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordResponse {
    result: Option<CloudflareDnsRecordResult>,
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareError>,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordListResponse {
    #[serde(default)]
    result: Vec<CloudflareDnsRecordResult>,
    success: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct CloudflareDnsRecordResult {
    id: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CloudflareError {
    code: u32,
    message: String,
}

fn describe_errors(errors: &[CloudflareError]) -> String {
    if errors.is_empty() {
        return "Unknown error".to_string();
    }
    errors
        .iter()
        .map(|err| format!("{}: {}", err.code, err.message))
        .collect::<Vec<_>>()
        .join(", ")
}

fn has_identical_record_error(errors: &[CloudflareError]) -> bool {
    errors.iter().any(|err| err.code == IDENTICAL_RECORD_EXISTS)
}

/// Cloudflare stores TXT content quoted.
fn format_txt_content(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed.to_string()
    } else {
        format!("\"{}\"", trimmed.trim_matches('"'))
    }
}

fn same_content(left: &str, right: &str) -> bool {
    left.trim().trim_matches('"') == right.trim().trim_matches('"')
}

/// Most specific zone containing `fqdn`. A configured zone hint wins when it is listed
/// and actually contains `fqdn`.
fn select_zone<'a>(
    zones: &'a [CloudflareZone],
    fqdn: &str,
    hint: Option<&str>,
) -> Option<&'a CloudflareZone> {
    if let Some(hint) = hint.filter(|hint| matches_zone(fqdn, hint)) {
        let hinted = zones
            .iter()
            .find(|zone| zone.name.eq_ignore_ascii_case(hint.trim().trim_end_matches('.')));
        if hinted.is_some() {
            return hinted;
        }
    }
    zones
        .iter()
        .filter(|zone| matches_zone(fqdn, &zone.name))
        .max_by_key(|zone| zone.name.len())
}

/// Bearer-token API client, owned by one provider instance and its record handles.
struct CloudflareApi {
    client: Client,
    api_token: String,
    base_url: String,
}

impl CloudflareApi {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn list_zones(&self) -> Result<Vec<CloudflareZone>> {
        let mut zones = Vec::new();
        let mut page = 1;
        loop {
            let response = self
                .client
                .get(self.url("/zones"))
                .query(&[("page", page), ("per_page", ZONES_PER_PAGE)])
                .bearer_auth(&self.api_token)
                .send()
                .await
                .context("Failed to list Cloudflare zones")?;

            if !response.status().is_success() {
                return Err(http::status_error(PROVIDER, response.status(), None));
            }

            let listed: CloudflareZoneListResponse = response
                .json()
                .await
                .context("Failed to parse Cloudflare zone list response")?;
            if !listed.success {
                return Err(anyhow!("Cloudflare API returned unsuccessful response"));
            }
            zones.extend(listed.result);

            let total_pages = listed.result_info.map(|info| info.total_pages).unwrap_or(1);
            if page >= total_pages {
                break;
            }
            page += 1;
        }
        debug!("[cloudflare] discovered {} zone(s)", zones.len());
        Ok(zones)
    }

    async fn list_txt_records(
        &self,
        zone_id: &str,
        record_name: &str,
    ) -> Result<Vec<CloudflareDnsRecordResult>> {
        let response = self
            .client
            .get(self.url(&format!("/zones/{zone_id}/dns_records")))
            .query(&[("type", TXT_RECORD), ("name", record_name)])
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to list Cloudflare DNS records")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.ok();
            return Err(http::status_error(PROVIDER, status, body));
        }

        let listed: CloudflareDnsRecordListResponse = response
            .json()
            .await
            .context("Failed to parse Cloudflare DNS record list")?;
        if !listed.success {
            return Err(anyhow!("Cloudflare API returned unsuccessful response"));
        }
        Ok(listed.result)
    }

    async fn find_record(
        &self,
        zone_id: &str,
        record_name: &str,
        content: &str,
    ) -> Result<Option<String>> {
        let existing = self.list_txt_records(zone_id, record_name).await?;
        Ok(existing
            .into_iter()
            .find(|record| {
                record
                    .content
                    .as_deref()
                    .is_some_and(|existing| same_content(existing, content))
            })
            .map(|record| record.id))
    }

    /// Returns the record id and whether the record already existed.
    async fn create_txt_record(
        &self,
        zone_id: &str,
        record_name: &str,
        content: &str,
    ) -> Result<(String, bool)> {
        if let Some(id) = self.find_record(zone_id, record_name, content).await? {
            debug!("[cloudflare] {} already holds the challenge value", record_name);
            return Ok((id, true));
        }

        let record = CloudflareDnsRecord {
            record_type: TXT_RECORD,
            name: record_name,
            content,
            ttl: RECORD_TTL,
        };
        let response = self
            .client
            .post(self.url(&format!("/zones/{zone_id}/dns_records")))
            .bearer_auth(&self.api_token)
            .json(&record)
            .send()
            .await
            .context("Failed to create Cloudflare DNS record")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read Cloudflare DNS record response")?;
        let parsed = serde_json::from_str::<CloudflareDnsRecordResponse>(&body).ok();

        if let Some(parsed) = &parsed {
            if has_identical_record_error(&parsed.errors) {
                debug!("[cloudflare] identical record exists for {}", record_name);
                return self
                    .find_record(zone_id, record_name, content)
                    .await?
                    .map(|id| (id, true))
                    .ok_or_else(|| anyhow!("TXT record not found: {}", record_name));
            }
        }

        if !status.is_success() {
            return Err(http::status_error(PROVIDER, status, Some(body)));
        }
        let parsed = parsed.context("Failed to parse Cloudflare DNS record response")?;
        if !parsed.success {
            return Err(anyhow!(
                "Cloudflare API error: {}",
                describe_errors(&parsed.errors)
            ));
        }
        let id = parsed
            .result
            .map(|record| record.id)
            .ok_or_else(|| anyhow!("Cloudflare API did not return record ID"))?;
        Ok((id, false))
    }

    async fn record_content(&self, zone_id: &str, record_id: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.url(&format!("/zones/{zone_id}/dns_records/{record_id}")))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to fetch Cloudflare DNS record")?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let fetched: CloudflareDnsRecordResponse = response
            .json()
            .await
            .context("Failed to parse Cloudflare DNS record response")?;
        Ok(fetched.result.and_then(|record| record.content))
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/zones/{zone_id}/dns_records/{record_id}")))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to delete Cloudflare DNS record")?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            debug!("[cloudflare] record {} already deleted (404)", record_id);
            return Ok(());
        }
        let body = response.text().await.ok();
        Err(http::status_error(PROVIDER, status, body))
    }
}

pub struct CloudflareProvider {
    api: Arc<CloudflareApi>,
    zones: Mutex<Option<Vec<CloudflareZone>>>,
}

impl CloudflareProvider {
    pub fn new(client: Client, api_token: impl Into<String>) -> Self {
        Self::with_base_url(client, api_token, API_BASE)
    }

    pub fn with_base_url(
        client: Client,
        api_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            api: Arc::new(CloudflareApi {
                client,
                api_token: api_token.into(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
            }),
            zones: Mutex::new(None),
        }
    }

    async fn zone_for(&self, fqdn: &str, hint: Option<&str>) -> Result<CloudflareZone> {
        let mut cached = self.zones.lock().await;
        if let Some(zone) = cached
            .as_deref()
            .and_then(|zones| select_zone(zones, fqdn, hint))
        {
            return Ok(zone.clone());
        }

        // Unknown name: the account may have gained zones since the last listing.
        let zones = self.api.list_zones().await?;
        let selected = select_zone(&zones, fqdn, hint).cloned();
        *cached = Some(zones);
        selected.ok_or_else(|| anyhow!("No Cloudflare zone found for {}", fqdn))
    }

    async fn verify(&self, zone_id: &str, record_id: &str, content: &str) -> Result<()> {
        retry_provider_verification(
            &format!("record {record_id}"),
            "Cloudflare record verification",
            VERIFY_TIMEOUT,
            VERIFY_INTERVAL,
            || async move {
                Ok(self
                    .api
                    .record_content(zone_id, record_id)
                    .await?
                    .is_some_and(|existing| same_content(&existing, content)))
            },
        )
        .await
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloudflare
    }

    async fn create(
        &self,
        record_type: &str,
        fqdn: &str,
        value: &str,
        certificate: &CertificateSpec,
    ) -> Result<Box<dyn DnsRecordHandle>, DnsProviderError> {
        ensure_txt(PROVIDER, record_type)?;
        let started = Instant::now();
        let zone = self
            .zone_for(fqdn, certificate.dns_zone.as_deref())
            .await
            .map_err(|err| DnsProviderError::api(PROVIDER, err))?;
        let content = format_txt_content(value);

        let (record_id, reused) = self
            .api
            .create_txt_record(&zone.id, fqdn, &content)
            .await
            .map_err(|err| DnsProviderError::api(PROVIDER, err))?;

        let handle = CloudflareRecord {
            api: self.api.clone(),
            zone_id: zone.id.clone(),
            record_id: record_id.clone(),
            fqdn: fqdn.to_string(),
        };

        if let Err(err) = self.verify(&zone.id, &record_id, &content).await {
            warn!("[cloudflare] {} failed verification: {:#}", fqdn, err);
            if !reused {
                if let Err(clean_err) = Box::new(handle).clean().await {
                    warn!("[cloudflare] rollback of {} failed: {}", fqdn, clean_err);
                }
            }
            return Err(DnsProviderError::Verification {
                provider: PROVIDER,
                record: fqdn.to_string(),
                message: format!("{err:#}"),
            });
        }

        info!(
            "[cloudflare] [{}] TXT {} ready in zone {} after {}ms{}",
            certificate.name,
            fqdn,
            zone.name,
            started.elapsed().as_millis(),
            if reused { " (reused)" } else { "" }
        );
        Ok(Box::new(handle))
    }
}

struct CloudflareRecord {
    api: Arc<CloudflareApi>,
    zone_id: String,
    record_id: String,
    fqdn: String,
}

#[async_trait]
impl DnsRecordHandle for CloudflareRecord {
    fn describe(&self) -> String {
        format!("cloudflare TXT {} ({})", self.fqdn, self.record_id)
    }

    async fn clean(self: Box<Self>) -> Result<(), DnsProviderError> {
        let started = Instant::now();
        self.api
            .delete_record(&self.zone_id, &self.record_id)
            .await
            .map_err(|err| DnsProviderError::api(PROVIDER, err))?;
        debug!(
            "[cloudflare] removed {} ({}) in {}ms",
            self.fqdn,
            self.record_id,
            started.elapsed().as_millis()
        );
        Ok(())
    }
}
