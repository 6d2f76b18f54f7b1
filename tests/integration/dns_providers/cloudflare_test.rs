use anyhow::{Result, anyhow};

use acme_dns_renewer::CertificateSpec;
use acme_dns_renewer::issuance::dns_providers::{
    CloudflareProvider, DnsProvider, TXT_RECORD, http,
};

use super::test_utils::{
    CloudflareTestConfig, list_txt_records, load_cloudflare_config, purge_txt_records, quoted,
    record_name, wait_for_record_content,
};

fn provider(config: &CloudflareTestConfig) -> CloudflareProvider {
    CloudflareProvider::new(http::build_client(), config.token.clone())
}

fn certificate(config: &CloudflareTestConfig) -> Result<CertificateSpec> {
    Ok(CertificateSpec::new("integration-test", &[config.zone.as_str()])?
        .with_dns_zone(config.zone.clone()))
}

#[tokio::test]
async fn cloudflare_creates_and_cleans_its_record() -> Result<()> {
    let config = load_cloudflare_config()?;
    let name = record_name(&config.zone, "lifecycle");
    purge_txt_records(&config, &name).await?;

    let handle = provider(&config)
        .create(TXT_RECORD, &name, "integration-test-lifecycle", &certificate(&config)?)
        .await?;
    let record = wait_for_record_content(&config, &name, &quoted("integration-test-lifecycle")).await?;
    if record.name != name {
        return Err(anyhow!("Expected record name {}, got {}", name, record.name));
    }

    handle.clean().await?;
    let remaining = list_txt_records(&config, &name).await?;
    purge_txt_records(&config, &name).await?;
    if !remaining.is_empty() {
        return Err(anyhow!("Record {} still present after clean", name));
    }
    Ok(())
}

#[tokio::test]
async fn cloudflare_reuses_identical_content() -> Result<()> {
    let config = load_cloudflare_config()?;
    let name = record_name(&config.zone, "reuse");
    purge_txt_records(&config, &name).await?;

    let provider = provider(&config);
    let spec = certificate(&config)?;
    let first = provider.create(TXT_RECORD, &name, "integration-test-reuse", &spec).await?;
    let second = provider.create(TXT_RECORD, &name, "integration-test-reuse", &spec).await?;

    let records = list_txt_records(&config, &name).await?;
    first.clean().await?;
    let _ = second.clean().await;
    purge_txt_records(&config, &name).await?;
    if records.len() != 1 {
        return Err(anyhow!("Expected one record, found {}", records.len()));
    }
    Ok(())
}

#[tokio::test]
async fn cloudflare_clean_leaves_other_values() -> Result<()> {
    let config = load_cloudflare_config()?;
    let name = record_name(&config.zone, "siblings");
    purge_txt_records(&config, &name).await?;

    let provider = provider(&config);
    let spec = certificate(&config)?;
    let wildcard = provider.create(TXT_RECORD, &name, "integration-test-a", &spec).await?;
    let apex = provider.create(TXT_RECORD, &name, "integration-test-b", &spec).await?;

    wildcard.clean().await?;
    let remaining = list_txt_records(&config, &name).await?;
    apex.clean().await?;
    purge_txt_records(&config, &name).await?;

    let contents: Vec<_> = remaining.iter().filter_map(|r| r.content.clone()).collect();
    if contents != vec![quoted("integration-test-b")] {
        return Err(anyhow!("Unexpected remaining values: {:?}", contents));
    }
    Ok(())
}
