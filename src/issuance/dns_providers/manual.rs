use async_trait::async_trait;
use log::info;

use super::{DnsProvider, DnsProviderError, DnsRecordHandle, ProviderKind, TXT_RECORD, ensure_txt};
use crate::config::CertificateSpec;

/// Baseline provider: asks the operator to publish and remove records by hand.
#[derive(Debug, Default)]
pub struct ManualProvider;

impl ManualProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DnsProvider for ManualProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Manual
    }

    async fn create(
        &self,
        record_type: &str,
        fqdn: &str,
        value: &str,
        certificate: &CertificateSpec,
    ) -> Result<Box<dyn DnsRecordHandle>, DnsProviderError> {
        ensure_txt("Manual", record_type)?;
        info!(
            "[dns-manual] [{}] publish {} {} \"{}\"",
            certificate.name, TXT_RECORD, fqdn, value
        );
        Ok(Box::new(ManualRecord {
            fqdn: fqdn.to_string(),
            value: value.to_string(),
        }))
    }
}

struct ManualRecord {
    fqdn: String,
    value: String,
}

#[async_trait]
impl DnsRecordHandle for ManualRecord {
    fn describe(&self) -> String {
        format!("manual TXT {}", self.fqdn)
    }

    async fn clean(self: Box<Self>) -> Result<(), DnsProviderError> {
        info!("[dns-manual] remove {} {} \"{}\"", TXT_RECORD, self.fqdn, self.value);
        Ok(())
    }
}
