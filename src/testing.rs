//! Test doubles shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::CertificateSpec;
use crate::domain::challenge_record_name;
use crate::issuance::acme::{
    Account, AccountDetails, AcmeClient, AcmeConnector, AcmeError, Authorization, Challenge,
    DnsChallenge, Identifier, Order, Problem, SigningKey,
};
use crate::issuance::challenge::PollPolicy;
use crate::issuance::codec::{CertificateCodec, CodecError, KeyPair};
use crate::issuance::dns_providers::{
    DnsProvider, DnsProviderError, DnsRecordHandle, ProviderKind,
};
use crate::storage::{AccountStore, CertInfo, CertificateStore, StoreError};

pub(crate) fn instant_poll(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        propagation_delay: Duration::ZERO,
        max_attempts,
        backoff_step: Duration::ZERO,
    }
}

pub(crate) fn sample_cert_info(identifier: &str, days_until_expiry: i64) -> CertInfo {
    CertInfo {
        identifier: identifier.to_string(),
        expiration: Utc::now() + chrono::Duration::days(days_until_expiry),
        subject_name: "CN=example.com".to_string(),
        subject_alternative_names: vec!["example.com".to_string(), "www.example.com".to_string()],
        fingerprint: "00".repeat(32),
    }
}

/// How a scripted authorization answers the polls that follow the challenge answer.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AuthzScript {
    Validates { after_polls: u32 },
    Rejects { after_polls: u32 },
    NeverValidates,
    NoDnsChallenge,
    PollError,
}

#[derive(Default)]
struct SessionState {
    fetches: HashMap<String, u32>,
    orders: Vec<Vec<String>>,
    account: Option<String>,
}

/// Scripted ACME session. Unscripted domains validate on the first poll.
pub(crate) struct MockAcmeSession {
    scripts: HashMap<String, AuthzScript>,
    authority_host: String,
    final_status: String,
    state: Mutex<SessionState>,
    answers: AtomicU32,
    accounts_created: AtomicU32,
}

impl MockAcmeSession {
    pub(crate) fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            authority_host: "ca.test".to_string(),
            final_status: "valid".to_string(),
            state: Mutex::new(SessionState::default()),
            answers: AtomicU32::new(0),
            accounts_created: AtomicU32::new(0),
        }
    }

    pub(crate) fn with_authorization(mut self, domain: &str, script: AuthzScript) -> Self {
        self.scripts.insert(domain.to_string(), script);
        self
    }

    pub(crate) fn with_final_status(mut self, status: &str) -> Self {
        self.final_status = status.to_string();
        self
    }

    pub(crate) fn authorization_url(domain: &str) -> String {
        format!("https://ca.test/authz/{domain}")
    }

    fn domain_of(url: &str) -> &str {
        url.rsplit('/').next().unwrap_or(url)
    }

    pub(crate) fn answers(&self) -> u32 {
        self.answers.load(Ordering::SeqCst)
    }

    pub(crate) fn accounts_created(&self) -> u32 {
        self.accounts_created.load(Ordering::SeqCst)
    }

    /// Authorization fetches after the initial one.
    pub(crate) fn polls(&self, domain: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .fetches
            .get(&Self::authorization_url(domain))
            .map(|n| n.saturating_sub(1))
            .unwrap_or(0)
    }

    pub(crate) fn orders(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().orders.clone()
    }

    fn script(&self, domain: &str) -> AuthzScript {
        self.scripts
            .get(domain)
            .copied()
            .unwrap_or(AuthzScript::Validates { after_polls: 1 })
    }
}

fn challenge(kind: &str, domain: &str, status: &str, error: Option<Problem>) -> Challenge {
    Challenge {
        kind: kind.to_string(),
        url: format!("https://ca.test/chall/{domain}/{kind}"),
        token: format!("token-{domain}"),
        status: status.to_string(),
        error,
    }
}

#[async_trait]
impl AcmeClient for MockAcmeSession {
    async fn create_account(&self, contact: &[String]) -> Result<Account, AcmeError> {
        let n = self.accounts_created.fetch_add(1, Ordering::SeqCst) + 1;
        let kid = format!("https://{}/acme/acct/{}", self.authority_host, 100 + n);
        self.state.lock().unwrap().account = Some(kid.clone());
        Ok(Account {
            details: AccountDetails {
                kid,
                status: Some("valid".to_string()),
                contact: contact.to_vec(),
            },
            key: SigningKey {
                algorithm: "RS256".to_string(),
                key_pem: "generated-key".to_string(),
            },
        })
    }

    async fn create_order(&self, hostnames: &[String]) -> Result<Order, AcmeError> {
        self.state.lock().unwrap().orders.push(hostnames.to_vec());
        Ok(Order {
            url: "https://ca.test/order/1".to_string(),
            status: "pending".to_string(),
            authorizations: hostnames
                .iter()
                .map(|host| Self::authorization_url(host))
                .collect(),
            finalize: "https://ca.test/order/1/finalize".to_string(),
            certificate: None,
            error: None,
        })
    }

    async fn get_authorization(&self, url: &str) -> Result<Authorization, AcmeError> {
        let fetches = {
            let mut state = self.state.lock().unwrap();
            let count = state.fetches.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let polls = fetches - 1;
        let domain = Self::domain_of(url);

        let (status, challenges) = match self.script(domain) {
            AuthzScript::NoDnsChallenge => (
                "pending",
                vec![challenge("http-01", domain, "pending", None)],
            ),
            AuthzScript::PollError if polls > 0 => {
                return Err(AcmeError::Protocol {
                    operation: "authorization",
                    detail: "connection reset".to_string(),
                });
            }
            AuthzScript::Validates { after_polls } if polls > 0 && polls >= after_polls => {
                ("valid", vec![challenge("dns-01", domain, "valid", None)])
            }
            AuthzScript::Rejects { after_polls } if polls > 0 && polls >= after_polls => (
                "invalid",
                vec![challenge(
                    "dns-01",
                    domain,
                    "invalid",
                    Some(Problem {
                        kind: "urn:ietf:params:acme:error:unauthorized".to_string(),
                        detail: Some("incorrect TXT record".to_string()),
                        status: Some(403),
                    }),
                )],
            ),
            _ => (
                "pending",
                vec![challenge("dns-01", domain, "pending", None)],
            ),
        };

        Ok(Authorization {
            url: url.to_string(),
            identifier: Identifier {
                kind: "dns".to_string(),
                value: domain.to_string(),
            },
            status: status.to_string(),
            challenges,
            wildcard: false,
        })
    }

    fn decode_dns_challenge(
        &self,
        authorization: &Authorization,
        challenge: &Challenge,
    ) -> Result<DnsChallenge, AcmeError> {
        Ok(DnsChallenge {
            record_type: "TXT".to_string(),
            record_name: challenge_record_name(&authorization.identifier.value),
            record_value: format!("value-{}", challenge.token),
        })
    }

    async fn answer_challenge(&self, url: &str) -> Result<Challenge, AcmeError> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(Challenge {
            kind: "dns-01".to_string(),
            url: url.to_string(),
            token: String::new(),
            status: "processing".to_string(),
            error: None,
        })
    }

    async fn finalize_order(&self, order: &Order, _csr_der: &[u8]) -> Result<Order, AcmeError> {
        Ok(Order {
            status: self.final_status.clone(),
            certificate: Some("https://ca.test/cert/1".to_string()),
            ..order.clone()
        })
    }

    async fn get_order_certificate(&self, _order: &Order) -> Result<Vec<u8>, AcmeError> {
        Ok(b"-----BEGIN CERTIFICATE-----\nstub\n-----END CERTIFICATE-----\n".to_vec())
    }
}

/// Hands out sessions that all share one scripted [`MockAcmeSession`].
pub(crate) struct MockAcmeConnector {
    session: Arc<MockAcmeSession>,
    connected: Mutex<Vec<Option<String>>>,
}

impl MockAcmeConnector {
    pub(crate) fn new(session: Arc<MockAcmeSession>) -> Self {
        Self {
            session,
            connected: Mutex::new(Vec::new()),
        }
    }

    /// Account kid passed to each `connect` call.
    pub(crate) fn connected_kids(&self) -> Vec<Option<String>> {
        self.connected.lock().unwrap().clone()
    }
}

struct SharedSession(Arc<MockAcmeSession>);

#[async_trait]
impl AcmeClient for SharedSession {
    async fn create_account(&self, contact: &[String]) -> Result<Account, AcmeError> {
        self.0.create_account(contact).await
    }

    async fn create_order(&self, hostnames: &[String]) -> Result<Order, AcmeError> {
        self.0.create_order(hostnames).await
    }

    async fn get_authorization(&self, url: &str) -> Result<Authorization, AcmeError> {
        self.0.get_authorization(url).await
    }

    fn decode_dns_challenge(
        &self,
        authorization: &Authorization,
        challenge: &Challenge,
    ) -> Result<DnsChallenge, AcmeError> {
        self.0.decode_dns_challenge(authorization, challenge)
    }

    async fn answer_challenge(&self, url: &str) -> Result<Challenge, AcmeError> {
        self.0.answer_challenge(url).await
    }

    async fn finalize_order(&self, order: &Order, csr_der: &[u8]) -> Result<Order, AcmeError> {
        self.0.finalize_order(order, csr_der).await
    }

    async fn get_order_certificate(&self, order: &Order) -> Result<Vec<u8>, AcmeError> {
        self.0.get_order_certificate(order).await
    }
}

#[async_trait]
impl AcmeConnector for MockAcmeConnector {
    async fn connect(&self, account: Option<Account>) -> Result<Box<dyn AcmeClient>, AcmeError> {
        self.connected
            .lock()
            .unwrap()
            .push(account.map(|a| a.details.kid));
        Ok(Box::new(SharedSession(self.session.clone())))
    }
}

/// Provider that records every create and clean.
pub(crate) struct RecordingDnsProvider {
    kind: ProviderKind,
    creates: AtomicU32,
    cleans: Arc<AtomicU32>,
    events: Arc<Mutex<Vec<String>>>,
    failing_creates: Mutex<HashSet<String>>,
    failing_cleans: Arc<std::sync::atomic::AtomicBool>,
}

impl RecordingDnsProvider {
    pub(crate) fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            creates: AtomicU32::new(0),
            cleans: Arc::new(AtomicU32::new(0)),
            events: Arc::new(Mutex::new(Vec::new())),
            failing_creates: Mutex::new(HashSet::new()),
            failing_cleans: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub(crate) fn fail_creates_for(&self, fqdn: &str) {
        self.failing_creates.lock().unwrap().insert(fqdn.to_string());
    }

    pub(crate) fn fail_cleans(&self) {
        self.failing_cleans.store(true, Ordering::SeqCst);
    }

    pub(crate) fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub(crate) fn cleans(&self) -> u32 {
        self.cleans.load(Ordering::SeqCst)
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsProvider for RecordingDnsProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create(
        &self,
        _record_type: &str,
        fqdn: &str,
        _value: &str,
        _certificate: &CertificateSpec,
    ) -> Result<Box<dyn DnsRecordHandle>, DnsProviderError> {
        if self.failing_creates.lock().unwrap().contains(fqdn) {
            return Err(DnsProviderError::Api {
                provider: "Recording",
                message: format!("zone for {fqdn} not found"),
            });
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("create:{fqdn}"));
        Ok(Box::new(RecordingHandle {
            fqdn: fqdn.to_string(),
            cleans: self.cleans.clone(),
            events: self.events.clone(),
            fail: self.failing_cleans.clone(),
        }))
    }
}

struct RecordingHandle {
    fqdn: String,
    cleans: Arc<AtomicU32>,
    events: Arc<Mutex<Vec<String>>>,
    fail: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl DnsRecordHandle for RecordingHandle {
    fn describe(&self) -> String {
        format!("recording TXT {}", self.fqdn)
    }

    async fn clean(self: Box<Self>) -> Result<(), DnsProviderError> {
        self.cleans.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("clean:{}", self.fqdn));
        if self.fail.load(Ordering::SeqCst) {
            return Err(DnsProviderError::Api {
                provider: "Recording",
                message: "delete refused".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryCertificateStore {
    archives: Mutex<HashMap<String, Vec<u8>>>,
    infos: Mutex<HashMap<String, CertInfo>>,
    info_reads: AtomicUsize,
    fail_writes: bool,
}

impl MemoryCertificateStore {
    pub(crate) fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub(crate) fn insert_info(&self, info: CertInfo) {
        self.infos
            .lock()
            .unwrap()
            .insert(info.identifier.clone(), info);
    }

    pub(crate) fn archive(&self, identifier: &str) -> Option<Vec<u8>> {
        self.archives.lock().unwrap().get(identifier).cloned()
    }

    pub(crate) fn info_reads(&self) -> usize {
        self.info_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn get_cert_info(&self, identifier: &str) -> Result<Option<CertInfo>, StoreError> {
        self.info_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.infos.lock().unwrap().get(identifier).cloned())
    }

    async fn store_certificate(&self, identifier: &str, archive: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Io {
                path: identifier.into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        self.archives
            .lock()
            .unwrap()
            .insert(identifier.to_string(), archive.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryAccountStore {
    account: Mutex<Option<Account>>,
    writes: AtomicUsize,
}

impl MemoryAccountStore {
    pub(crate) fn with_account(account: Account) -> Self {
        Self {
            account: Mutex::new(Some(account)),
            writes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn current(&self) -> Option<Account> {
        self.account.lock().unwrap().clone()
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get_account(&self) -> Result<Option<Account>, StoreError> {
        Ok(self.current())
    }

    async fn store_account(
        &self,
        details: &AccountDetails,
        key: &SigningKey,
    ) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.account.lock().unwrap() = Some(Account {
            details: details.clone(),
            key: key.clone(),
        });
        Ok(())
    }
}

/// Codec that records CSR requests and wraps the chain instead of building PKCS#12.
#[derive(Default)]
pub(crate) struct StubCodec {
    csrs: Mutex<Vec<(String, Vec<String>)>>,
}

impl StubCodec {
    pub(crate) fn csrs(&self) -> Vec<(String, Vec<String>)> {
        self.csrs.lock().unwrap().clone()
    }
}

impl CertificateCodec for StubCodec {
    fn generate_key_pair(&self, bits: u32) -> Result<KeyPair, CodecError> {
        Ok(KeyPair::from_pem(format!("stub-key-{bits}")))
    }

    fn build_csr(
        &self,
        common_name: &str,
        sans: &[String],
        _key: &KeyPair,
    ) -> Result<Vec<u8>, CodecError> {
        self.csrs
            .lock()
            .unwrap()
            .push((common_name.to_string(), sans.to_vec()));
        Ok(b"csr".to_vec())
    }

    fn package_archive(&self, chain_pem: &[u8], key: &KeyPair) -> Result<Vec<u8>, CodecError> {
        let mut archive = key.private_key_pem().to_vec();
        archive.extend_from_slice(chain_pem);
        Ok(archive)
    }
}
