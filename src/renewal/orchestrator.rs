use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::decision::{RenewalDecision, RenewalReason, evaluate};
use crate::config::{BatchPolicy, CertificateSpec, ConfigError};
use crate::error::{BatchError, CertificateFailure, RenewalError};
use crate::issuance::renewer::CertificateRenewal;
use crate::storage::StoreRouter;

/// Narrows a batch run: bypass the decision and/or restrict it to one certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalRequest {
    pub force: bool,
    pub only: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub renewed: Vec<String>,
    pub current: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateCheck {
    pub name: String,
    pub decision: RenewalDecision,
}

pub struct RenewalOrchestrator {
    certificates: Vec<CertificateSpec>,
    stores: StoreRouter,
    renewer: Arc<dyn CertificateRenewal>,
    policy: BatchPolicy,
    threshold: chrono::Duration,
}

impl RenewalOrchestrator {
    pub fn new(
        certificates: Vec<CertificateSpec>,
        stores: StoreRouter,
        renewer: Arc<dyn CertificateRenewal>,
        policy: BatchPolicy,
        threshold: chrono::Duration,
    ) -> Self {
        Self {
            certificates,
            stores,
            renewer,
            policy,
            threshold,
        }
    }

    pub fn certificates(&self) -> &[CertificateSpec] {
        &self.certificates
    }

    /// Renews every configured certificate that is due. A no-op when nothing is.
    pub async fn renew_certificates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, BatchError> {
        self.renew_selected(&RenewalRequest::default(), cancel)
            .await
    }

    pub async fn renew_selected(
        &self,
        request: &RenewalRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, BatchError> {
        let run_id = Uuid::new_v4();
        let names: Vec<&str> = self.certificates.iter().map(|c| c.name.as_str()).collect();
        info!(
            "[orchestrator] run {} Found cert configs: {}",
            run_id,
            names.join(", ")
        );

        let selected = self.select(request.only.as_deref()).map_err(|err| BatchError {
            failures: vec![CertificateFailure {
                name: request.only.clone().unwrap_or_default(),
                elapsed: std::time::Duration::ZERO,
                error: err.into(),
            }],
        })?;

        let batch_started = Instant::now();
        let mut summary = BatchSummary::default();
        let mut failures = Vec::new();

        for certificate in selected {
            let started = Instant::now();
            if cancel.is_cancelled() {
                warn!(
                    "[orchestrator] run {} cancelled before '{}'",
                    run_id, certificate.name
                );
                failures.push(CertificateFailure {
                    name: certificate.name.clone(),
                    elapsed: started.elapsed(),
                    error: RenewalError::Cancelled,
                });
                break;
            }

            let outcome = self.process(certificate, request.force, cancel).await;
            let elapsed = started.elapsed();
            match outcome {
                Ok(true) => {
                    info!(
                        "[orchestrator] [{}] renewed in {}ms",
                        certificate.name,
                        elapsed.as_millis()
                    );
                    summary.renewed.push(certificate.name.clone());
                }
                Ok(false) => summary.current.push(certificate.name.clone()),
                Err(err) => {
                    error!(
                        "[orchestrator] [{}] failed after {}ms: {}",
                        certificate.name,
                        elapsed.as_millis(),
                        err
                    );
                    let stop = self.policy == BatchPolicy::FailFast
                        || matches!(err, RenewalError::Cancelled);
                    failures.push(CertificateFailure {
                        name: certificate.name.clone(),
                        elapsed,
                        error: err,
                    });
                    if stop {
                        break;
                    }
                }
            }
        }

        info!(
            "[orchestrator] run {} finished in {}ms: {} renewed, {} current, {} failed",
            run_id,
            batch_started.elapsed().as_millis(),
            summary.renewed.len(),
            summary.current.len(),
            failures.len()
        );

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(BatchError { failures })
        }
    }

    /// Decision for every certificate without renewing anything.
    pub async fn evaluate_all(&self) -> Result<Vec<CertificateCheck>, RenewalError> {
        let mut checks = Vec::with_capacity(self.certificates.len());
        for certificate in &self.certificates {
            checks.push(CertificateCheck {
                name: certificate.name.clone(),
                decision: self.decide(certificate).await?,
            });
        }
        Ok(checks)
    }

    fn select(&self, only: Option<&str>) -> Result<Vec<&CertificateSpec>, ConfigError> {
        match only {
            None => Ok(self.certificates.iter().collect()),
            Some(name) => self
                .certificates
                .iter()
                .find(|c| c.name == name)
                .map(|c| vec![c])
                .ok_or_else(|| ConfigError::Invalid(format!("no certificate named '{name}'"))),
        }
    }

    async fn decide(&self, certificate: &CertificateSpec) -> Result<RenewalDecision, RenewalError> {
        let store = self.stores.for_spec(certificate);
        let stored = store.get_cert_info(&certificate.name).await?;
        Ok(evaluate(
            &certificate.hostnames,
            stored.as_ref(),
            Utc::now(),
            self.threshold,
        ))
    }

    /// `Ok(true)` when a new certificate was stored.
    async fn process(
        &self,
        certificate: &CertificateSpec,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, RenewalError> {
        let decision = if force {
            RenewalDecision::Renew(RenewalReason::Forced)
        } else {
            self.decide(certificate).await?
        };

        let RenewalDecision::Renew(reason) = decision else {
            info!("[orchestrator] [{}] is current", certificate.name);
            return Ok(false);
        };
        info!("[orchestrator] [{}] renewing: {}", certificate.name, reason);
        self.renewer.renew_certificate(certificate, cancel).await?;
        Ok(true)
    }
}
