use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{AcmeError, SigningKey};

const ALGORITHM: &str = "RS256";
const ACCOUNT_KEY_BITS: u32 = 2048;

/// RSA account key used to sign every JWS request of a session.
pub struct AccountKey {
    pkey: PKey<Private>,
}

impl AccountKey {
    pub fn generate() -> Result<Self, AcmeError> {
        let rsa = Rsa::generate(ACCOUNT_KEY_BITS)?;
        Ok(Self {
            pkey: PKey::from_rsa(rsa)?,
        })
    }

    pub fn from_signing_key(key: &SigningKey) -> Result<Self, AcmeError> {
        if key.algorithm != ALGORITHM {
            return Err(AcmeError::UnsupportedKey(format!(
                "algorithm {}",
                key.algorithm
            )));
        }
        let pkey = PKey::private_key_from_pem(key.key_pem.as_bytes())
            .map_err(|err| AcmeError::UnsupportedKey(err.to_string()))?;
        if pkey.rsa().is_err() {
            return Err(AcmeError::UnsupportedKey(
                "RS256 account key is not an RSA key".to_string(),
            ));
        }
        Ok(Self { pkey })
    }

    pub fn to_signing_key(&self) -> Result<SigningKey, AcmeError> {
        let pem = self.pkey.private_key_to_pem_pkcs8()?;
        let key_pem = String::from_utf8(pem)
            .map_err(|err| AcmeError::UnsupportedKey(err.to_string()))?;
        Ok(SigningKey {
            algorithm: ALGORITHM.to_string(),
            key_pem,
        })
    }

    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    pub fn jwk(&self) -> Result<Value, AcmeError> {
        let rsa = self.pkey.rsa()?;
        Ok(json!({
            "e": URL_SAFE_NO_PAD.encode(rsa.e().to_vec()),
            "kty": "RSA",
            "n": URL_SAFE_NO_PAD.encode(rsa.n().to_vec()),
        }))
    }

    /// RFC 7638 thumbprint: required members in lexicographic order, no whitespace.
    pub fn thumbprint(&self) -> Result<String, AcmeError> {
        let rsa = self.pkey.rsa()?;
        let canonical = format!(
            r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(rsa.e().to_vec()),
            URL_SAFE_NO_PAD.encode(rsa.n().to_vec())
        );
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
    }

    /// Flattened JWS body. `payload: None` produces a POST-as-GET request.
    pub fn sign_jws(&self, protected: &Value, payload: Option<&Value>) -> Result<Value, AcmeError> {
        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string());
        let payload_b64 = match payload {
            Some(value) => URL_SAFE_NO_PAD.encode(value.to_string()),
            None => String::new(),
        };
        let signing_input = format!("{protected_b64}.{payload_b64}");
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
        let signature = signer.sign_oneshot_to_vec(signing_input.as_bytes())?;
        Ok(json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature),
        }))
    }
}

/// TXT value for a dns-01 challenge: base64url(SHA-256(token "." thumbprint)).
pub fn dns01_value(token: &str, thumbprint: &str) -> String {
    let key_authorization = format!("{token}.{thumbprint}");
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}
