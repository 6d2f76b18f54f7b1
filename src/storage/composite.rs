use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use log::warn;

use super::{CertInfo, CertificateStore, StoreError};

/// Fans writes out to every backing store; reads come from the first (primary) store only.
pub struct CompositeCertificateStore {
    stores: Vec<Arc<dyn CertificateStore>>,
}

impl CompositeCertificateStore {
    pub fn new(stores: Vec<Arc<dyn CertificateStore>>) -> Result<Self, StoreError> {
        if stores.is_empty() {
            return Err(StoreError::NoBackingStore);
        }
        Ok(Self { stores })
    }

    fn primary(&self) -> &Arc<dyn CertificateStore> {
        &self.stores[0]
    }
}

#[async_trait]
impl CertificateStore for CompositeCertificateStore {
    fn describe(&self) -> String {
        let names: Vec<String> = self.stores.iter().map(|s| s.describe()).collect();
        format!("composite[{}]", names.join(", "))
    }

    async fn get_cert_info(&self, identifier: &str) -> Result<Option<CertInfo>, StoreError> {
        self.primary().get_cert_info(identifier).await
    }

    async fn store_certificate(
        &self,
        identifier: &str,
        archive: &[u8],
    ) -> Result<(), StoreError> {
        let writes = self
            .stores
            .iter()
            .map(|store| store.store_certificate(identifier, archive));
        let results = join_all(writes).await;

        let failures: Vec<String> = self
            .stores
            .iter()
            .zip(results)
            .filter_map(|(store, result)| {
                result.err().map(|err| {
                    warn!(
                        "[store] write of '{}' to {} failed: {}",
                        identifier,
                        store.describe(),
                        err
                    );
                    format!("{}: {}", store.describe(), err)
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Partial {
                total: self.stores.len(),
                failures,
            })
        }
    }
}
