use std::time::Duration;

use anyhow::anyhow;
use log::warn;
use reqwest::{Client, StatusCode};

pub const TIMEOUT_ENV: &str = "ACME_RENEWER_HTTP_TIMEOUT_SECS";
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Client shared by the providers and the ACME session of one service instance.
pub fn build_client() -> Client {
    let timeout = resolve_timeout();
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("acme-dns-renewer/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|err| {
            warn!("[dns-http] failed to build client: {err}");
            Client::new()
        })
}

pub(crate) fn resolve_timeout() -> Duration {
    let timeout = std::env::var(TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout == 0 {
        warn!("[dns-http] invalid timeout value; using default");
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    }
    Duration::from_secs(timeout)
}

pub fn status_error(provider: &str, status: StatusCode, body: Option<String>) -> anyhow::Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return anyhow!("{provider} authentication failed");
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return anyhow!("{provider} rate limit exceeded");
    }
    match body.filter(|b| !b.trim().is_empty()) {
        Some(body) => anyhow!("{provider} API error: {body}"),
        None => anyhow!("{provider} API error: {status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{TIMEOUT_ENV, resolve_timeout, status_error};
    use reqwest::StatusCode;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    fn with_timeout_env<T>(value: Option<&str>, f: impl FnOnce() -> T) -> T {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let previous = std::env::var(TIMEOUT_ENV).ok();
        // SAFETY: serialized by ENV_LOCK; no other test touches this variable.
        unsafe {
            match value {
                Some(value) => std::env::set_var(TIMEOUT_ENV, value),
                None => std::env::remove_var(TIMEOUT_ENV),
            }
        }
        let result = f();
        unsafe {
            match previous {
                Some(value) => std::env::set_var(TIMEOUT_ENV, value),
                None => std::env::remove_var(TIMEOUT_ENV),
            }
        }
        result
    }

    #[test]
    fn status_error_maps_auth() {
        let err = status_error("Cloudflare", StatusCode::FORBIDDEN, None);
        assert!(err.to_string().contains("Cloudflare authentication failed"));
    }

    #[test]
    fn status_error_maps_rate_limit() {
        let err = status_error("DigitalOcean", StatusCode::TOO_MANY_REQUESTS, None);
        assert!(err.to_string().contains("DigitalOcean rate limit exceeded"));
    }

    #[test]
    fn status_error_includes_body() {
        let err = status_error(
            "Cloudflare",
            StatusCode::BAD_REQUEST,
            Some("bad request".to_string()),
        );
        let msg = err.to_string();
        assert!(msg.contains("Cloudflare API error"));
        assert!(msg.contains("bad request"));
    }

    #[test]
    fn status_error_falls_back_to_status_for_blank_body() {
        let err = status_error("DigitalOcean", StatusCode::BAD_GATEWAY, Some("  ".to_string()));
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn resolve_timeout_defaults() {
        let timeout = with_timeout_env(None, resolve_timeout);
        assert_eq!(timeout, Duration::from_secs(15));
    }

    #[test]
    fn resolve_timeout_parses_env() {
        let timeout = with_timeout_env(Some("20"), resolve_timeout);
        assert_eq!(timeout, Duration::from_secs(20));
    }

    #[test]
    fn resolve_timeout_rejects_zero() {
        let timeout = with_timeout_env(Some("0"), resolve_timeout);
        assert_eq!(timeout, Duration::from_secs(15));
    }

    #[test]
    fn resolve_timeout_rejects_invalid() {
        let timeout = with_timeout_env(Some("nope"), resolve_timeout);
        assert_eq!(timeout, Duration::from_secs(15));
    }
}
