use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::domain::{san_covers_host, subject_names_host};
use crate::storage::CertInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalReason {
    /// Requested by the operator regardless of stored state.
    Forced,
    NoExistingCertificate,
    NearingExpiry { remaining: Duration },
    SubjectMismatch { expected: String },
    SanMissing { missing: Vec<String> },
}

impl fmt::Display for RenewalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenewalReason::Forced => f.write_str("forced"),
            RenewalReason::NoExistingCertificate => f.write_str("no certificate has been issued"),
            RenewalReason::NearingExpiry { remaining } if *remaining < Duration::zero() => {
                write!(f, "expired {} day(s) ago", -remaining.num_days())
            }
            RenewalReason::NearingExpiry { remaining } => {
                write!(f, "expires in {} day(s)", remaining.num_days())
            }
            RenewalReason::SubjectMismatch { expected } => {
                write!(f, "subject does not name {expected}")
            }
            RenewalReason::SanMissing { missing } => {
                write!(f, "SAN does not cover {}", missing.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalDecision {
    Renew(RenewalReason),
    Current,
}

impl RenewalDecision {
    pub fn should_renew(&self) -> bool {
        matches!(self, RenewalDecision::Renew(_))
    }
}

/// Rules apply in order and the first match wins: nothing stored, near expiry,
/// subject drift from the first hostname, then SAN coverage of every hostname.
pub fn evaluate(
    hostnames: &[String],
    stored: Option<&CertInfo>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> RenewalDecision {
    let Some(info) = stored else {
        return RenewalDecision::Renew(RenewalReason::NoExistingCertificate);
    };

    let remaining = info.expiration - now;
    if remaining < threshold {
        return RenewalDecision::Renew(RenewalReason::NearingExpiry { remaining });
    }

    if let Some(primary) = hostnames.first() {
        if !subject_names_host(&info.subject_name, primary) {
            return RenewalDecision::Renew(RenewalReason::SubjectMismatch {
                expected: primary.clone(),
            });
        }
    }

    let missing: Vec<String> = hostnames
        .iter()
        .filter(|host| !san_covers_host(&info.subject_alternative_names, host))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return RenewalDecision::Renew(RenewalReason::SanMissing { missing });
    }

    RenewalDecision::Current
}
