use anyhow::{Result, anyhow};

const CHALLENGE_LABEL: &str = "_acme-challenge";

pub fn normalize_domain_for_storage(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    let (wildcard, bare) = match trimmed.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let ascii =
        idna::domain_to_ascii(bare).map_err(|err| anyhow!("invalid domain name: {err}"))?;
    if ascii.is_empty() {
        return Err(anyhow!("invalid domain name: {input}"));
    }
    let ascii = ascii.to_lowercase();
    Ok(if wildcard { format!("*.{ascii}") } else { ascii })
}

/// Normalizes a configured hostname list, keeping the first occurrence of each name in order.
pub fn normalize_hostnames<S: AsRef<str>>(hostnames: &[S]) -> Result<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(hostnames.len());
    for raw in hostnames {
        let raw = raw.as_ref();
        if raw.trim().is_empty() {
            continue;
        }
        let host = normalize_domain_for_storage(raw)?;
        if !normalized.contains(&host) {
            normalized.push(host);
        }
    }
    if normalized.is_empty() {
        return Err(anyhow!("at least one hostname is required"));
    }
    Ok(normalized)
}

pub fn strip_wildcard(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// TXT record name the authority queries for a dns-01 challenge.
pub fn challenge_record_name(domain: &str) -> String {
    let domain = strip_wildcard(domain.trim().trim_end_matches('.'));
    if domain.starts_with(&format!("{CHALLENGE_LABEL}.")) {
        domain.to_string()
    } else {
        format!("{CHALLENGE_LABEL}.{domain}")
    }
}

/// True when `host` appears as the value of one of the `attr=value` tokens of an
/// RFC 4514 style subject (e.g. `CN=example.com, O=Example`).
pub fn subject_names_host(subject: &str, host: &str) -> bool {
    let host = host.trim();
    if host.is_empty() {
        return false;
    }
    subject
        .split([',', '+', '/'])
        .filter_map(|token| token.split_once('='))
        .any(|(_, value)| value.trim().eq_ignore_ascii_case(host))
}

pub fn san_covers_host<S: AsRef<str>>(sans: &[S], host: &str) -> bool {
    let host = host.trim().trim_end_matches('.');
    sans.iter()
        .any(|san| san.as_ref().trim().trim_end_matches('.').eq_ignore_ascii_case(host))
}

/// Exact zone match or a subdomain of the zone.
pub fn matches_zone(name: &str, zone_name: &str) -> bool {
    let name = match normalize_domain_for_storage(strip_wildcard(name)) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let zone_name = match normalize_domain_for_storage(zone_name) {
        Ok(value) => value,
        Err(_) => return false,
    };
    zone_name == name || name.ends_with(&format!(".{}", zone_name))
}
