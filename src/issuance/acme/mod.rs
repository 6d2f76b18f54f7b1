//! ACME (RFC 8555) capability consumed by the renewer.
//!
//! A session returned by [`AcmeConnector::connect`] owns its nonce and account
//! state and is used by exactly one renewal.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod client;
mod jws;

pub use client::{HttpAcmeConnector, HttpAcmeSession};
pub use jws::{AccountKey, dns01_value};

pub const DNS01_CHALLENGE: &str = "dns-01";
pub const STATUS_VALID: &str = "valid";
pub const STATUS_INVALID: &str = "invalid";

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("ACME server rejected {operation}: {problem}")]
    Problem {
        operation: &'static str,
        problem: Problem,
    },
    #[error("unexpected ACME response to {operation}: {detail}")]
    Protocol {
        operation: &'static str,
        detail: String,
    },
    #[error("ACME key operation failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
    #[error("unsupported or unreadable account key ({0})")]
    UnsupportedKey(String),
    #[error("session has no registered account")]
    NoAccount,
    #[error("order isn't valid: {0}")]
    OrderNotValid(String),
}

/// RFC 7807 problem document returned by the authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl Problem {
    pub fn is_bad_nonce(&self) -> bool {
        self.kind == "urn:ietf:params:acme:error:badNonce"
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.detail, self.kind.is_empty()) {
            (Some(detail), false) => write!(f, "{} ({})", detail, self.kind),
            (Some(detail), true) => f.write_str(detail),
            (None, false) => f.write_str(&self.kind),
            (None, true) => f.write_str("unknown error"),
        }
    }
}

/// Server-assigned account identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetails {
    pub kid: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub contact: Vec<String>,
}

/// Exported account key: JWS algorithm tag plus PKCS#8 PEM.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey {
    pub algorithm: String,
    pub key_pem: String,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub details: AccountDetails,
    pub key: SigningKey,
}

impl Account {
    /// Accounts are only reused against the authority that issued their kid.
    pub fn belongs_to(&self, authority_host: &str) -> bool {
        let authority_host = authority_host.trim();
        if authority_host.is_empty() {
            return false;
        }
        reqwest::Url::parse(&self.details.kid)
            .ok()
            .and_then(|kid| kid.host_str().map(|host| host.eq_ignore_ascii_case(authority_host)))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(skip)]
    pub url: String,
    pub status: String,
    #[serde(default)]
    pub authorizations: Vec<String>,
    #[serde(default)]
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Authorization {
    #[serde(skip)]
    pub url: String,
    pub identifier: Identifier,
    pub status: String,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    pub fn domain(&self) -> String {
        if self.wildcard {
            format!("*.{}", self.identifier.value)
        } else {
            self.identifier.value.clone()
        }
    }

    pub fn dns_challenge(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == DNS01_CHALLENGE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<Problem>,
}

/// The TXT record an authority expects for a dns-01 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallenge {
    pub record_type: String,
    pub record_name: String,
    pub record_value: String,
}

#[async_trait]
pub trait AcmeConnector: Send + Sync {
    /// Opens a session bound to `account`, or an unregistered one when `None`.
    async fn connect(&self, account: Option<Account>) -> Result<Box<dyn AcmeClient>, AcmeError>;
}

#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Registers a new account with `contact` (already `mailto:` prefixed) and binds the session to it.
    async fn create_account(&self, contact: &[String]) -> Result<Account, AcmeError>;
    async fn create_order(&self, hostnames: &[String]) -> Result<Order, AcmeError>;
    async fn get_authorization(&self, url: &str) -> Result<Authorization, AcmeError>;
    fn decode_dns_challenge(
        &self,
        authorization: &Authorization,
        challenge: &Challenge,
    ) -> Result<DnsChallenge, AcmeError>;
    async fn answer_challenge(&self, url: &str) -> Result<Challenge, AcmeError>;
    async fn finalize_order(&self, order: &Order, csr_der: &[u8]) -> Result<Order, AcmeError>;
    /// PEM chain, leaf first.
    async fn get_order_certificate(&self, order: &Order) -> Result<Vec<u8>, AcmeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_must_reference_authority_host() {
        let account = Account {
            details: AccountDetails {
                kid: "https://acme-staging-v02.api.letsencrypt.org/acme/acct/1".to_string(),
                status: None,
                contact: vec![],
            },
            key: SigningKey {
                algorithm: "RS256".to_string(),
                key_pem: String::new(),
            },
        };
        assert!(account.belongs_to("acme-staging-v02.api.letsencrypt.org"));
        assert!(!account.belongs_to("acme-v02.api.letsencrypt.org"));
        assert!(!account.belongs_to(""));
        assert!(account.belongs_to("ACME-Staging-v02.api.letsencrypt.org"));
    }

    #[test]
    fn parent_domain_of_the_kid_host_is_not_the_authority() {
        let account = Account {
            details: AccountDetails {
                kid: "https://acme-v02.api.letsencrypt.org/acme/acct/7".to_string(),
                status: None,
                contact: vec![],
            },
            key: SigningKey {
                algorithm: "RS256".to_string(),
                key_pem: String::new(),
            },
        };
        assert!(!account.belongs_to("api.letsencrypt.org"));
        assert!(!account.belongs_to("letsencrypt.org"));

        let malformed = Account {
            details: AccountDetails {
                kid: "acme-v02.api.letsencrypt.org/acct/7".to_string(),
                ..account.details.clone()
            },
            ..account
        };
        assert!(!malformed.belongs_to("acme-v02.api.letsencrypt.org"));
    }

    #[test]
    fn signing_key_debug_hides_material() {
        let key = SigningKey {
            algorithm: "RS256".to_string(),
            key_pem: "secret".to_string(),
        };
        let rendered = format!("{key:?}");
        assert!(rendered.contains("RS256"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn decodes_authorization_documents() {
        let raw = r#"{
            "identifier": {"type": "dns", "value": "example.com"},
            "status": "pending",
            "wildcard": true,
            "challenges": [
                {"type": "http-01", "url": "https://ca.test/chall/1", "token": "a", "status": "pending"},
                {"type": "dns-01", "url": "https://ca.test/chall/2", "token": "b", "status": "pending"}
            ]
        }"#;
        let authz: Authorization = serde_json::from_str(raw).unwrap();
        assert_eq!(authz.domain(), "*.example.com");
        assert_eq!(authz.dns_challenge().map(|c| c.url.as_str()), Some("https://ca.test/chall/2"));
    }

    #[test]
    fn problem_display_prefers_detail() {
        let problem: Problem = serde_json::from_str(
            r#"{"type":"urn:ietf:params:acme:error:badNonce","detail":"JWS has an invalid anti-replay nonce","status":400}"#,
        )
        .unwrap();
        assert!(problem.is_bad_nonce());
        assert_eq!(
            problem.to_string(),
            "JWS has an invalid anti-replay nonce (urn:ietf:params:acme:error:badNonce)"
        );
    }
}
