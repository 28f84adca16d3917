//! Checks applied before a sandbox's lifetime is extended for publishing.

use std::time::Duration;

use crate::sandbox::types::SandboxRuntimeConfig;

pub const MAX_PUBLISH_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Which URL hosts may be published for the active backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPolicy {
    /// Host must be a subdomain of this domain (`*.e2b.app`).
    Subdomain(String),
    /// Host must be one of these names exactly.
    Exact(Vec<String>),
}

impl HostPolicy {
    pub fn for_runtime(config: &SandboxRuntimeConfig) -> Self {
        match config {
            SandboxRuntimeConfig::E2b(c) => HostPolicy::Subdomain(c.domain.clone()),
            SandboxRuntimeConfig::Daytona(c) => HostPolicy::Subdomain(c.preview_domain.clone()),
            SandboxRuntimeConfig::Docker(c) => {
                let mut hosts: Vec<String> = ["localhost", "127.0.0.1", "0.0.0.0"]
                    .into_iter()
                    .map(String::from)
                    .collect();
                let public = c.endpoint.public_host();
                if !hosts.iter().any(|h| h == public) {
                    hosts.push(public.to_string());
                }
                HostPolicy::Exact(hosts)
            }
        }
    }

    pub fn check(&self, url: &str) -> Result<(), String> {
        let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid url {url:?}: {e}"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| format!("url {url:?} has no host"))?
            .to_ascii_lowercase();
        match self {
            HostPolicy::Subdomain(domain) => {
                if host.ends_with(&format!(".{}", domain.to_ascii_lowercase())) {
                    Ok(())
                } else {
                    Err(format!("URL must be on *.{domain} domain"))
                }
            }
            HostPolicy::Exact(hosts) => {
                if hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)) {
                    Ok(())
                } else {
                    Err(format!("URL must be on allowed Docker hosts: {}", hosts.join(", ")))
                }
            }
        }
    }
}

/// `500ms`, `90s`, `30m`, `12h`, `1d`, or a bare number of milliseconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    let millis_per_unit: u64 = match unit.trim() {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => return Err(format!("unknown duration unit {other:?}")),
    };
    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration {raw:?} is too large"))
}

/// Reject zero and anything beyond 24 hours.
pub fn check_duration(duration: Duration) -> Result<(), String> {
    if duration.is_zero() {
        return Err("Expiration must be greater than zero".into());
    }
    if duration > MAX_PUBLISH_DURATION {
        return Err("Expiration must be 24 hours or less".into());
    }
    Ok(())
}
