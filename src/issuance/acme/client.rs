use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::jws::{AccountKey, dns01_value};
use super::{
    Account, AccountDetails, AcmeClient, AcmeConnector, AcmeError, Authorization, Challenge,
    DnsChallenge, Order, Problem,
};
use crate::domain::challenge_record_name;

const REPLAY_NONCE: &str = "replay-nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
const FINALIZE_POLL_ATTEMPTS: u32 = 10;
const FINALIZE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
    new_account: String,
    new_order: String,
}

/// Opens RFC 8555 sessions against one authority directory.
pub struct HttpAcmeConnector {
    http: Client,
    directory_url: String,
}

impl HttpAcmeConnector {
    pub fn new(http: Client, authority_url: &str) -> Self {
        Self {
            http,
            directory_url: directory_url(authority_url),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }
}

fn directory_url(authority_url: &str) -> String {
    let trimmed = authority_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/directory") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/directory")
    }
}

#[async_trait]
impl AcmeConnector for HttpAcmeConnector {
    async fn connect(&self, account: Option<Account>) -> Result<Box<dyn AcmeClient>, AcmeError> {
        let response = self
            .http
            .get(&self.directory_url)
            .send()
            .await
            .map_err(|source| AcmeError::Transport {
                url: self.directory_url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            let problem = read_problem(response).await;
            return Err(AcmeError::Problem {
                operation: "directory",
                problem,
            });
        }
        let directory: Directory = decode(response, "directory").await?;
        debug!("[acme] directory loaded from {}", self.directory_url);

        let (key, kid) = match account {
            Some(account) => (
                AccountKey::from_signing_key(&account.key)?,
                Some(account.details.kid),
            ),
            None => (AccountKey::generate()?, None),
        };

        Ok(Box::new(HttpAcmeSession::new(
            self.http.clone(),
            directory,
            key,
            kid,
        )?))
    }
}

/// One authority session: account key, kid and the replay-nonce chain.
pub struct HttpAcmeSession {
    http: Client,
    directory: Directory,
    key: AccountKey,
    thumbprint: String,
    kid: Mutex<Option<String>>,
    nonce: Mutex<Option<String>>,
}

impl HttpAcmeSession {
    fn new(
        http: Client,
        directory: Directory,
        key: AccountKey,
        kid: Option<String>,
    ) -> Result<Self, AcmeError> {
        let thumbprint = key.thumbprint()?;
        Ok(Self {
            http,
            directory,
            key,
            thumbprint,
            kid: Mutex::new(kid),
            nonce: Mutex::new(None),
        })
    }

    fn kid(&self) -> Option<String> {
        self.kid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remember_nonce(&self, response: &Response) {
        if let Some(nonce) = response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
        {
            *self
                .nonce
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(nonce.to_string());
        }
    }

    async fn next_nonce(&self) -> Result<String, AcmeError> {
        let cached = self
            .nonce
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(nonce) = cached {
            return Ok(nonce);
        }

        let url = &self.directory.new_nonce;
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|source| AcmeError::Transport {
                url: url.clone(),
                source,
            })?;
        response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol {
                operation: "newNonce",
                detail: "no replay-nonce header in response".to_string(),
            })
    }

    fn protected_header(&self, url: &str, nonce: &str) -> Result<Value, AcmeError> {
        let mut header = json!({
            "alg": self.key.algorithm(),
            "nonce": nonce,
            "url": url,
        });
        match self.kid() {
            Some(kid) => header["kid"] = Value::String(kid),
            None => header["jwk"] = self.key.jwk()?,
        }
        Ok(header)
    }

    /// Signed POST; a `badNonce` rejection is retried once with a fresh nonce.
    async fn post(
        &self,
        operation: &'static str,
        url: &str,
        payload: Option<&Value>,
        accept: Option<&str>,
    ) -> Result<Response, AcmeError> {
        let mut retried = false;
        loop {
            let nonce = self.next_nonce().await?;
            let body = self
                .key
                .sign_jws(&self.protected_header(url, &nonce)?, payload)?;

            let mut request = self
                .http
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .body(body.to_string());
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let response = request.send().await.map_err(|source| AcmeError::Transport {
                url: url.to_string(),
                source,
            })?;
            self.remember_nonce(&response);

            if response.status().is_success() {
                return Ok(response);
            }

            let problem = read_problem(response).await;
            if problem.is_bad_nonce() && !retried {
                debug!("[acme] {} hit a stale nonce, retrying once", operation);
                retried = true;
                continue;
            }
            warn!("[acme] {} rejected: {}", operation, problem);
            return Err(AcmeError::Problem { operation, problem });
        }
    }

    fn require_account(&self) -> Result<(), AcmeError> {
        match self.kid() {
            Some(_) => Ok(()),
            None => Err(AcmeError::NoAccount),
        }
    }

    async fn fetch_order(&self, url: &str) -> Result<Order, AcmeError> {
        let response = self.post("order", url, None, None).await?;
        let mut order: Order = decode(response, "order").await?;
        order.url = url.to_string();
        Ok(order)
    }
}

#[async_trait]
impl AcmeClient for HttpAcmeSession {
    async fn create_account(&self, contact: &[String]) -> Result<Account, AcmeError> {
        let payload = json!({
            "termsOfServiceAgreed": true,
            "contact": contact,
        });
        let url = self.directory.new_account.clone();
        let response = self
            .post("newAccount", &url, Some(&payload), None)
            .await?;
        let kid = header_string(&response, LOCATION).ok_or_else(|| AcmeError::Protocol {
            operation: "newAccount",
            detail: "no Location header in account response".to_string(),
        })?;

        #[derive(Deserialize)]
        struct AccountResponse {
            #[serde(default)]
            status: Option<String>,
            #[serde(default)]
            contact: Vec<String>,
        }
        let body: AccountResponse = decode(response, "newAccount").await?;

        *self
            .kid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(kid.clone());
        info!("[acme] registered account {}", kid);

        Ok(Account {
            details: AccountDetails {
                kid,
                status: body.status,
                contact: body.contact,
            },
            key: self.key.to_signing_key()?,
        })
    }

    async fn create_order(&self, hostnames: &[String]) -> Result<Order, AcmeError> {
        self.require_account()?;
        let identifiers: Vec<Value> = hostnames
            .iter()
            .map(|host| json!({"type": "dns", "value": host}))
            .collect();
        let url = self.directory.new_order.clone();
        let response = self
            .post(
                "newOrder",
                &url,
                Some(&json!({ "identifiers": identifiers })),
                None,
            )
            .await?;
        let order_url = header_string(&response, LOCATION).ok_or_else(|| AcmeError::Protocol {
            operation: "newOrder",
            detail: "no Location header in order response".to_string(),
        })?;
        let mut order: Order = decode(response, "newOrder").await?;
        order.url = order_url;
        Ok(order)
    }

    async fn get_authorization(&self, url: &str) -> Result<Authorization, AcmeError> {
        self.require_account()?;
        let response = self.post("authorization", url, None, None).await?;
        let mut authorization: Authorization = decode(response, "authorization").await?;
        authorization.url = url.to_string();
        Ok(authorization)
    }

    fn decode_dns_challenge(
        &self,
        authorization: &Authorization,
        challenge: &Challenge,
    ) -> Result<DnsChallenge, AcmeError> {
        if challenge.token.is_empty() {
            return Err(AcmeError::Protocol {
                operation: "authorization",
                detail: format!("dns-01 challenge {} carries no token", challenge.url),
            });
        }
        Ok(DnsChallenge {
            record_type: "TXT".to_string(),
            record_name: challenge_record_name(&authorization.identifier.value),
            record_value: dns01_value(&challenge.token, &self.thumbprint),
        })
    }

    async fn answer_challenge(&self, url: &str) -> Result<Challenge, AcmeError> {
        self.require_account()?;
        let response = self.post("challenge", url, Some(&json!({})), None).await?;
        decode(response, "challenge").await
    }

    async fn finalize_order(&self, order: &Order, csr_der: &[u8]) -> Result<Order, AcmeError> {
        self.require_account()?;
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self
            .post("finalize", &order.finalize, Some(&payload), None)
            .await?;
        let mut current: Order = decode(response, "finalize").await?;
        current.url = order.url.clone();

        let mut attempt = 0;
        while current.status == "processing" && attempt < FINALIZE_POLL_ATTEMPTS {
            attempt += 1;
            tokio::time::sleep(FINALIZE_POLL_INTERVAL).await;
            current = self.fetch_order(&order.url).await?;
            debug!(
                "[acme] order {} is {} after finalize poll {}",
                order.url, current.status, attempt
            );
        }
        Ok(current)
    }

    async fn get_order_certificate(&self, order: &Order) -> Result<Vec<u8>, AcmeError> {
        self.require_account()?;
        let url = order
            .certificate
            .as_deref()
            .ok_or_else(|| AcmeError::Protocol {
                operation: "certificate",
                detail: format!("order {} has no certificate URL", order.url),
            })?;
        let response = self
            .post("certificate", url, None, Some(PEM_CHAIN))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|source| AcmeError::Transport {
                url: url.to_string(),
                source,
            })?;
        Ok(bytes.to_vec())
    }
}

fn header_string(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn decode<T: DeserializeOwned>(
    response: Response,
    operation: &'static str,
) -> Result<T, AcmeError> {
    let body = response.text().await.map_err(|err| AcmeError::Protocol {
        operation,
        detail: format!("failed to read body: {err}"),
    })?;
    serde_json::from_str(&body).map_err(|err| AcmeError::Protocol {
        operation,
        detail: format!("failed to parse body: {err}"),
    })
}

async fn read_problem(response: Response) -> Problem {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    problem_from_body(status, &body)
}

fn problem_from_body(status: StatusCode, body: &str) -> Problem {
    match serde_json::from_str::<Problem>(body) {
        Ok(mut problem) => {
            problem.status.get_or_insert(status.as_u16());
            problem
        }
        Err(_) => Problem {
            kind: String::new(),
            detail: Some(if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {}", body.trim())
            }),
            status: Some(status.as_u16()),
        },
    }
}
