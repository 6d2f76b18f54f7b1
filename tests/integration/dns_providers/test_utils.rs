use std::env;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use serde::Deserialize;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

#[derive(Clone)]
pub struct CloudflareTestConfig {
    pub token: String,
    pub zone: String,
}

#[derive(Deserialize)]
struct CloudflareZone {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct CloudflareList<T> {
    result: Vec<T>,
    success: bool,
}

#[derive(Deserialize, Clone)]
pub struct CloudflareDnsRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub content: Option<String>,
}

pub fn load_cloudflare_config() -> Result<CloudflareTestConfig> {
    let token = env::var("DNS_TEST_CLOUDFLARE_TOKEN")
        .context("DNS_TEST_CLOUDFLARE_TOKEN not set")?;
    let zone =
        env::var("DNS_TEST_CLOUDFLARE_ZONE").context("DNS_TEST_CLOUDFLARE_ZONE not set")?;
    Ok(CloudflareTestConfig { token, zone })
}

pub fn record_name(zone: &str, label: &str) -> String {
    format!("_acme-challenge.integration-test.{}.{}", label, zone)
}

pub fn quoted(value: &str) -> String {
    format!("\"{}\"", value.trim().trim_matches('"'))
}

pub async fn list_txt_records(
    config: &CloudflareTestConfig,
    record_name: &str,
) -> Result<Vec<CloudflareDnsRecord>> {
    let zone_id = resolve_zone_id(config).await?;
    let response = Client::new()
        .get(format!("{API_BASE}/zones/{zone_id}/dns_records"))
        .query(&[("type", "TXT"), ("name", record_name)])
        .bearer_auth(&config.token)
        .send()
        .await
        .context("Failed to list Cloudflare DNS records")?;
    if !response.status().is_success() {
        return Err(anyhow!(
            "Failed to list Cloudflare DNS records: {}",
            response.status()
        ));
    }
    let list: CloudflareList<CloudflareDnsRecord> = response
        .json()
        .await
        .context("Failed to parse Cloudflare DNS record list")?;
    if !list.success {
        return Err(anyhow!("Cloudflare API returned unsuccessful response"));
    }
    Ok(list.result)
}

/// Polls until a record with `expected` content is listed under `record_name`.
pub async fn wait_for_record_content(
    config: &CloudflareTestConfig,
    record_name: &str,
    expected: &str,
) -> Result<CloudflareDnsRecord> {
    for _ in 0..5 {
        if let Some(record) = list_txt_records(config, record_name)
            .await?
            .into_iter()
            .find(|record| record.content.as_deref() == Some(expected))
        {
            return Ok(record);
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    Err(anyhow!("Cloudflare record content did not match expected value"))
}

/// Removes leftovers from earlier runs. Tests call it before and after they run.
pub async fn purge_txt_records(config: &CloudflareTestConfig, record_name: &str) -> Result<()> {
    let zone_id = resolve_zone_id(config).await?;
    for record in list_txt_records(config, record_name).await? {
        let response = Client::new()
            .delete(format!("{API_BASE}/zones/{zone_id}/dns_records/{}", record.id))
            .bearer_auth(&config.token)
            .send()
            .await
            .context("Failed to delete Cloudflare DNS record")?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Failed to delete Cloudflare DNS record: {}",
                response.status()
            ));
        }
    }
    Ok(())
}

async fn resolve_zone_id(config: &CloudflareTestConfig) -> Result<String> {
    let response = Client::new()
        .get(format!("{API_BASE}/zones"))
        .query(&[("name", config.zone.as_str())])
        .bearer_auth(&config.token)
        .send()
        .await
        .context("Failed to list Cloudflare zones")?;
    if !response.status().is_success() {
        return Err(anyhow!("Cloudflare zone list failed: {}", response.status()));
    }
    let zones: CloudflareList<CloudflareZone> = response
        .json()
        .await
        .context("Failed to parse Cloudflare zone list response")?;
    zones
        .result
        .into_iter()
        .find(|zone| zone.name == config.zone)
        .map(|zone| zone.id)
        .ok_or_else(|| anyhow!("No Cloudflare zone named {}", config.zone))
}
