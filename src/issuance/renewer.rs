use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CertificateSpec, ConfigError};
use crate::domain::normalize_hostnames;
use crate::error::{ChallengeFailures, RenewalError};
use crate::issuance::acme::{AcmeClient, AcmeConnector, AcmeError, STATUS_VALID};
use crate::issuance::challenge::{ChallengeOrchestrator, ChallengeOutcome, PollPolicy};
use crate::issuance::codec::CertificateCodec;
use crate::issuance::dns_providers::ProviderRegistry;
use crate::storage::{AccountStore, StoreRouter};

/// Renews one certificate end to end. Implemented by [`CertificateRenewer`].
#[async_trait]
pub trait CertificateRenewal: Send + Sync {
    async fn renew_certificate(
        &self,
        certificate: &CertificateSpec,
        cancel: &CancellationToken,
    ) -> Result<(), RenewalError>;
}

#[derive(Debug, Clone)]
pub struct RenewerSettings {
    pub contact_email: String,
    /// Host of the configured authority; stored accounts must reference it.
    pub authority_host: String,
    pub key_bits: u32,
    pub poll: PollPolicy,
}

pub struct CertificateRenewer {
    settings: RenewerSettings,
    connector: Arc<dyn AcmeConnector>,
    accounts: Arc<dyn AccountStore>,
    stores: StoreRouter,
    providers: Arc<ProviderRegistry>,
    codec: Arc<dyn CertificateCodec>,
}

impl CertificateRenewer {
    pub fn new(
        settings: RenewerSettings,
        connector: Arc<dyn AcmeConnector>,
        accounts: Arc<dyn AccountStore>,
        stores: StoreRouter,
        providers: Arc<ProviderRegistry>,
        codec: Arc<dyn CertificateCodec>,
    ) -> Self {
        Self {
            settings,
            connector,
            accounts,
            stores,
            providers,
            codec,
        }
    }

    /// Opens a session bound to an account of the configured authority, registering one if needed.
    async fn authorized_client(&self) -> Result<Box<dyn AcmeClient>, RenewalError> {
        let host = &self.settings.authority_host;
        let stored = match self.accounts.get_account().await? {
            Some(account) if account.belongs_to(host) => Some(account),
            Some(account) => {
                warn!(
                    "[renewer] stored account {} does not belong to {}; registering a new one",
                    account.details.kid, host
                );
                None
            }
            None => None,
        };

        if let Some(account) = stored {
            debug!("[renewer] using account {}", account.details.kid);
            return Ok(self.connector.connect(Some(account)).await?);
        }

        let client = self.connector.connect(None).await?;
        let contact = vec![format!("mailto:{}", self.settings.contact_email)];
        let account = client.create_account(&contact).await?;
        self.accounts
            .store_account(&account.details, &account.key)
            .await?;
        info!("[renewer] registered account {}", account.details.kid);
        Ok(client)
    }

    async fn renew(
        &self,
        certificate: &CertificateSpec,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), RenewalError> {
        let name = &certificate.name;
        let hostnames = normalize_hostnames(&certificate.hostnames).map_err(|err| {
            ConfigError::Certificate {
                certificate: name.clone(),
                message: err.to_string(),
            }
        })?;
        let common_name = hostnames[0].clone();

        let client = until_cancelled(cancel, self.authorized_client()).await?;
        let client = client.as_ref();
        debug!("[renewer] [{}]@{}ms client authorized", name, started.elapsed().as_millis());

        let order = until_cancelled(cancel, async {
            client.create_order(&hostnames).await.map_err(RenewalError::from)
        })
        .await?;
        info!(
            "[renewer] [{}]@{}ms order created with {} authorization(s)",
            name,
            started.elapsed().as_millis(),
            order.authorizations.len()
        );

        let orchestrator = ChallengeOrchestrator::new(
            client,
            &self.providers,
            certificate,
            self.settings.poll,
            cancel,
        );
        let outcomes = join_all(
            order
                .authorizations
                .iter()
                .map(|url| orchestrator.run(url)),
        )
        .await;

        let mut cancelled = false;
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                ChallengeOutcome::Valid => {}
                ChallengeOutcome::Cancelled => cancelled = true,
                ChallengeOutcome::Failed(failure) => failures.push(failure),
            }
        }
        if cancelled {
            return Err(RenewalError::Cancelled);
        }
        if !failures.is_empty() {
            let failures = ChallengeFailures {
                certificate: name.clone(),
                failures,
            };
            error!("[renewer] [{}] {}", name, failures);
            return Err(failures.into());
        }
        info!(
            "[renewer] [{}]@{}ms all authorizations valid",
            name,
            started.elapsed().as_millis()
        );

        let key = self.codec.generate_key_pair(self.settings.key_bits)?;
        let csr = self.codec.build_csr(&common_name, &hostnames, &key)?;

        let finalized = until_cancelled(cancel, async {
            client
                .finalize_order(&order, &csr)
                .await
                .map_err(RenewalError::from)
        })
        .await?;
        if finalized.status != STATUS_VALID {
            let reason = match &finalized.error {
                Some(problem) => problem.to_string(),
                None => format!("status is '{}'", finalized.status),
            };
            return Err(AcmeError::OrderNotValid(reason).into());
        }
        debug!("[renewer] [{}]@{}ms order finalized", name, started.elapsed().as_millis());

        let chain = until_cancelled(cancel, async {
            client
                .get_order_certificate(&finalized)
                .await
                .map_err(RenewalError::from)
        })
        .await?;
        let archive = self.codec.package_archive(&chain, &key)?;

        let store = self.stores.for_spec(certificate);
        store.store_certificate(name, &archive).await?;
        info!(
            "[renewer] [{}]@{}ms certificate stored in {}",
            name,
            started.elapsed().as_millis(),
            store.describe()
        );
        Ok(())
    }
}

#[async_trait]
impl CertificateRenewal for CertificateRenewer {
    async fn renew_certificate(
        &self,
        certificate: &CertificateSpec,
        cancel: &CancellationToken,
    ) -> Result<(), RenewalError> {
        let started = Instant::now();
        info!(
            "[renewer] [{}] renewing for {}",
            certificate.name,
            certificate.hostnames.join(", ")
        );
        let result = self.renew(certificate, cancel, started).await;
        if let Err(err) = &result {
            error!(
                "[renewer] [{}]@{}ms renewal failed: {}",
                certificate.name,
                started.elapsed().as_millis(),
                err
            );
        }
        result
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T, RenewalError>>,
) -> Result<T, RenewalError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RenewalError::Cancelled),
        result = future => result,
    }
}
