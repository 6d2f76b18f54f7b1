use chrono::{TimeZone, Utc};
use openssl::pkcs12::Pkcs12;
use sha2::{Digest, Sha256};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::parse_x509_certificate;

use super::{CertInfo, StoreError};

/// Reads the leaf certificate out of a password-less PKCS#12 archive.
pub fn cert_info_from_pkcs12(identifier: &str, archive: &[u8]) -> Result<CertInfo, StoreError> {
    let archive_error = |detail: String| StoreError::Archive {
        identifier: identifier.to_string(),
        detail,
    };

    let parsed = Pkcs12::from_der(archive)
        .and_then(|pkcs12| pkcs12.parse2(""))
        .map_err(|err| archive_error(format!("invalid PKCS#12 data: {err}")))?;
    let leaf = parsed
        .cert
        .ok_or_else(|| archive_error("archive holds no certificate".to_string()))?;
    let der = leaf
        .to_der()
        .map_err(|err| archive_error(format!("failed to encode certificate: {err}")))?;

    let (_, cert) = parse_x509_certificate(&der)
        .map_err(|err| archive_error(format!("failed to parse certificate: {err}")))?;

    let expiration = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| archive_error("certificate expiry is out of range".to_string()))?;

    let subject_alternative_names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(err) => return Err(archive_error(format!("malformed SAN extension: {err}"))),
    };

    let fingerprint = {
        let mut hasher = Sha256::new();
        hasher.update(&der);
        hex::encode(hasher.finalize())
    };

    Ok(CertInfo {
        identifier: identifier.to_string(),
        expiration,
        subject_name: cert.subject().to_string(),
        subject_alternative_names,
        fingerprint,
    })
}
