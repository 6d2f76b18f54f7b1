use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509, X509NameBuilder, X509ReqBuilder};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("OpenSSL operation failed: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("failed to parse certificate chain PEM: {0}")]
    Pem(#[from] pem::PemError),
    #[error("{0}")]
    Invalid(String),
}

/// Certificate private key, PKCS#8 PEM kept in zeroizing memory.
pub struct KeyPair {
    private_key_pem: Zeroizing<Vec<u8>>,
}

impl KeyPair {
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Self {
        Self {
            private_key_pem: Zeroizing::new(pem.into()),
        }
    }

    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    fn pkey(&self) -> Result<PKey<Private>, CodecError> {
        Ok(PKey::private_key_from_pem(&self.private_key_pem)?)
    }
}

/// Key generation, CSR construction and archive packaging.
pub trait CertificateCodec: Send + Sync {
    fn generate_key_pair(&self, bits: u32) -> Result<KeyPair, CodecError>;
    /// DER-encoded CSR with `CN=<common_name>` and every entry of `sans` as a DNS SAN.
    fn build_csr(
        &self,
        common_name: &str,
        sans: &[String],
        key: &KeyPair,
    ) -> Result<Vec<u8>, CodecError>;
    /// Password-less PKCS#12 holding the leaf, its chain and the private key.
    fn package_archive(&self, chain_pem: &[u8], key: &KeyPair) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSslCodec;

impl CertificateCodec for OpenSslCodec {
    fn generate_key_pair(&self, bits: u32) -> Result<KeyPair, CodecError> {
        let rsa = Rsa::generate(bits)?;
        let pkey = PKey::from_rsa(rsa)?;
        Ok(KeyPair::from_pem(pkey.private_key_to_pem_pkcs8()?))
    }

    fn build_csr(
        &self,
        common_name: &str,
        sans: &[String],
        key: &KeyPair,
    ) -> Result<Vec<u8>, CodecError> {
        if common_name.trim().is_empty() {
            return Err(CodecError::Invalid("CSR common name is required".to_string()));
        }
        let pkey = key.pkey()?;

        let mut builder = X509ReqBuilder::new()?;
        builder.set_pubkey(&pkey)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        builder.set_subject_name(&name.build())?;

        if !sans.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for host in sans {
                san.dns(host);
            }
            let extension = san.build(&builder.x509v3_context(None))?;
            let mut extensions = Stack::new()?;
            extensions.push(extension)?;
            builder.add_extensions(&extensions)?;
        }

        builder.sign(&pkey, MessageDigest::sha256())?;
        Ok(builder.build().to_der()?)
    }

    fn package_archive(&self, chain_pem: &[u8], key: &KeyPair) -> Result<Vec<u8>, CodecError> {
        let (leaf, chain) = split_certificate_chain(chain_pem)?;
        let pkey = key.pkey()?;
        if !leaf.public_key()?.public_eq(&pkey) {
            return Err(CodecError::Invalid(
                "issued certificate does not match the generated key".to_string(),
            ));
        }

        let alias = leaf
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
            .unwrap_or_else(|| "certificate".to_string());

        let mut builder = Pkcs12::builder();
        builder.name(&alias).pkey(&pkey).cert(&leaf);
        if !chain.is_empty() {
            let mut ca = Stack::new()?;
            for cert in chain {
                ca.push(cert)?;
            }
            builder.ca(ca);
        }
        Ok(builder.build2("")?.to_der()?)
    }
}

fn split_certificate_chain(chain_pem: &[u8]) -> Result<(X509, Vec<X509>), CodecError> {
    let blocks = pem::parse_many(chain_pem)?;
    let mut certs = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| X509::from_der(block.contents()));
    let leaf = certs
        .next()
        .ok_or_else(|| CodecError::Invalid("no certificate PEM blocks found".to_string()))??;
    let chain = certs.collect::<Result<Vec<_>, _>>()?;
    Ok((leaf, chain))
}
