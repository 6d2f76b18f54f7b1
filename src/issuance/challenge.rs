//! DNS-01 lifecycle for a single authorization:
//! fetch, create record, wait, answer, poll, clean.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CertificateSpec;
use crate::error::{DomainFailure, DomainFailureKind};
use crate::issuance::acme::{AcmeClient, Authorization, Challenge, STATUS_INVALID, STATUS_VALID};
use crate::issuance::dns_providers::{DnsRecordHandle, ProviderRegistry};

/// Timing of the validation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Grace period between creating the record and answering the challenge.
    pub propagation_delay: Duration,
    pub max_attempts: u32,
    /// Attempt `n` waits `n * backoff_step` before fetching the authorization.
    pub backoff_step: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            propagation_delay: Duration::from_secs(2),
            max_attempts: 5,
            backoff_step: Duration::from_secs(1),
        }
    }
}

impl PollPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Valid,
    Failed(DomainFailure),
    Cancelled,
}

/// Owns a created record until it is cleaned. Dropping an armed guard
/// (the surrounding future was dropped) schedules the clean on the runtime.
struct CleanupGuard {
    handle: Option<Box<dyn DnsRecordHandle>>,
    domain: String,
}

impl CleanupGuard {
    fn new(handle: Box<dyn DnsRecordHandle>, domain: &str) -> Self {
        Self {
            handle: Some(handle),
            domain: domain.to_string(),
        }
    }

    async fn clean(mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let described = handle.describe();
        match handle.clean().await {
            Ok(()) => debug!("[challenge] [{}] cleaned {}", self.domain, described),
            Err(err) => warn!(
                "[challenge] [{}] failed to clean {}: {}",
                self.domain, described, err
            ),
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let domain = std::mem::take(&mut self.domain);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    "[challenge] [{}] interrupted; cleaning {} in the background",
                    domain,
                    handle.describe()
                );
                runtime.spawn(async move {
                    let described = handle.describe();
                    if let Err(err) = handle.clean().await {
                        warn!(
                            "[challenge] [{}] failed to clean {}: {}",
                            domain, described, err
                        );
                    }
                });
            }
            Err(_) => warn!(
                "[challenge] [{}] no runtime to clean {}; remove it manually",
                domain,
                handle.describe()
            ),
        }
    }
}

/// Drives one authorization of one order. Steps are strictly sequential.
pub struct ChallengeOrchestrator<'a> {
    acme: &'a dyn AcmeClient,
    providers: &'a ProviderRegistry,
    certificate: &'a CertificateSpec,
    poll: PollPolicy,
    cancel: &'a CancellationToken,
}

impl<'a> ChallengeOrchestrator<'a> {
    pub fn new(
        acme: &'a dyn AcmeClient,
        providers: &'a ProviderRegistry,
        certificate: &'a CertificateSpec,
        poll: PollPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            acme,
            providers,
            certificate,
            poll,
            cancel,
        }
    }

    pub async fn run(&self, authorization_url: &str) -> ChallengeOutcome {
        let started = Instant::now();

        let authorization = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return ChallengeOutcome::Cancelled,
            fetched = self.acme.get_authorization(authorization_url) => fetched,
        };
        let authorization = match authorization {
            Ok(authorization) => authorization,
            Err(err) => {
                warn!(
                    "[challenge] failed to fetch authorization {}: {}",
                    authorization_url, err
                );
                return failed(
                    authorization_url,
                    authorization_url,
                    DomainFailureKind::Authority(err.to_string()),
                );
            }
        };
        let domain = authorization.domain();

        if authorization.status == STATUS_VALID {
            info!("[challenge] [{}] authorization already valid", domain);
            return ChallengeOutcome::Valid;
        }

        let Some(challenge) = authorization.dns_challenge() else {
            warn!(
                "[challenge] [{}] no DNS challenges for this authorization: {}",
                domain, authorization_url
            );
            return failed(&domain, authorization_url, DomainFailureKind::NoDnsChallenge);
        };

        let record = match self.acme.decode_dns_challenge(&authorization, challenge) {
            Ok(record) => record,
            Err(err) => {
                warn!("[challenge] [{}] cannot decode challenge: {}", domain, err);
                return failed(
                    &domain,
                    authorization_url,
                    DomainFailureKind::Authority(err.to_string()),
                );
            }
        };

        let provider = self.providers.resolve(self.certificate.dns_provider.as_deref());
        debug!(
            "[challenge] [{}]@{}ms creating {} {} via {}",
            domain,
            started.elapsed().as_millis(),
            record.record_type,
            record.record_name,
            provider.kind()
        );

        // Creation is not raced against cancellation so a record that reaches the
        // provider always comes back with a handle.
        let handle = match provider
            .create(
                &record.record_type,
                &record.record_name,
                &record.record_value,
                self.certificate,
            )
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!("[challenge] [{}] DNS record creation failed: {}", domain, err);
                return failed(
                    &domain,
                    authorization_url,
                    DomainFailureKind::Provider(err.to_string()),
                );
            }
        };
        let guard = CleanupGuard::new(handle, &domain);
        info!(
            "[challenge] [{}]@{}ms DNS record created",
            domain,
            started.elapsed().as_millis()
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.validate(&domain, authorization_url, challenge, started) => Some(result),
        };

        guard.clean().await;

        match result {
            None => {
                warn!("[challenge] [{}] cancelled; DNS record cleaned", domain);
                ChallengeOutcome::Cancelled
            }
            Some(Ok(())) => {
                info!(
                    "[challenge] [{}]@{}ms authorization valid",
                    domain,
                    started.elapsed().as_millis()
                );
                ChallengeOutcome::Valid
            }
            Some(Err(kind)) => failed(&domain, authorization_url, kind),
        }
    }

    async fn validate(
        &self,
        domain: &str,
        authorization_url: &str,
        challenge: &Challenge,
        started: Instant,
    ) -> Result<(), DomainFailureKind> {
        tokio::time::sleep(self.poll.propagation_delay).await;

        let answered = self.acme.answer_challenge(&challenge.url).await.map_err(|err| {
            warn!("[challenge] [{}] answering challenge failed: {}", domain, err);
            DomainFailureKind::Authority(err.to_string())
        })?;
        debug!(
            "[challenge] [{}]@{}ms challenge answered: {}",
            domain,
            started.elapsed().as_millis(),
            answered.status
        );

        let mut last_auth_status = String::new();
        let mut last_challenge_status = answered.status.clone();
        let mut last_detail = problem_detail(&answered);

        for attempt in 1..=self.poll.max_attempts {
            tokio::time::sleep(self.poll.backoff(attempt)).await;

            let current: Authorization = self
                .acme
                .get_authorization(authorization_url)
                .await
                .map_err(|err| {
                    warn!(
                        "[challenge] [{}] polling attempt {} failed: {}",
                        domain, attempt, err
                    );
                    DomainFailureKind::Authority(err.to_string())
                })?;
            let current_challenge = current.dns_challenge();
            let challenge_status = current_challenge
                .map(|c| c.status.clone())
                .unwrap_or_default();
            let detail = current_challenge.and_then(problem_detail);

            debug!(
                "[challenge] [{}]@{}ms attempt {}/{}: auth [{}] challenge [{}]",
                domain,
                started.elapsed().as_millis(),
                attempt,
                self.poll.max_attempts,
                current.status,
                challenge_status
            );

            if current.status == STATUS_VALID {
                return Ok(());
            }
            if current.status == STATUS_INVALID || challenge_status == STATUS_INVALID {
                warn!(
                    "[challenge] [{}] rejected: [{}]{}",
                    domain,
                    challenge_status,
                    detail.as_deref().unwrap_or_default()
                );
                return Err(DomainFailureKind::Rejected {
                    challenge_status,
                    detail,
                });
            }

            last_auth_status = current.status;
            last_challenge_status = challenge_status;
            if detail.is_some() {
                last_detail = detail;
            }
        }

        warn!(
            "[challenge] [{}] not valid after {} attempt(s): auth [{}] challenge [{}]",
            domain, self.poll.max_attempts, last_auth_status, last_challenge_status
        );
        Err(DomainFailureKind::NotValidated {
            attempts: self.poll.max_attempts,
            challenge_status: last_challenge_status,
            auth_status: last_auth_status,
            detail: last_detail,
        })
    }
}

fn problem_detail(challenge: &Challenge) -> Option<String> {
    challenge.error.as_ref().map(|problem| problem.to_string())
}

fn failed(domain: &str, authorization_url: &str, kind: DomainFailureKind) -> ChallengeOutcome {
    ChallengeOutcome::Failed(DomainFailure {
        domain: domain.to_string(),
        authorization_url: authorization_url.to_string(),
        kind,
    })
}
