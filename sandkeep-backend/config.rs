use std::time::Duration;

use crate::sandbox::docker_engine::parse_endpoint;
use crate::sandbox::error::SandboxError;
use crate::sandbox::factory::DEFAULT_LIFETIME;
use crate::sandbox::ports::parse_port_range;
use crate::sandbox::templates::parse_image_overrides;
use crate::sandbox::timeouts::RegistryConfig;
use crate::sandbox::types::*;

pub const DEFAULT_E2B_API_URL: &str = "https://api.e2b.dev";
pub const DEFAULT_E2B_DOMAIN: &str = "e2b.app";
pub const DEFAULT_DAYTONA_API_URL: &str = "https://app.daytona.io/api";
pub const DEFAULT_DAYTONA_TARGET: &str = "us";
pub const DEFAULT_DAYTONA_PREVIEW_DOMAIN: &str = "daytona.app";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub sandbox: SandboxRuntimeConfig,
    pub registry: RegistryConfig,
    pub default_lifetime: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, SandboxError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from a key lookup (as it would read env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SandboxError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8081);
        let sentry_dsn = get("SENTRY_DSN");
        let environment = get("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        let sandbox = match select_backend(&get)? {
            SandboxBackendKind::E2b => SandboxRuntimeConfig::E2b(E2bConfig {
                api_key: require(&get, "E2B_API_KEY")?,
                api_url: get("E2B_API_URL").unwrap_or_else(|| DEFAULT_E2B_API_URL.into()),
                domain: get("E2B_DOMAIN").unwrap_or_else(|| DEFAULT_E2B_DOMAIN.into()),
                sandbox_url: get("E2B_SANDBOX_URL").map(|u| u.trim_end_matches('/').to_string()),
            }),
            SandboxBackendKind::Daytona => SandboxRuntimeConfig::Daytona(DaytonaConfig {
                api_key: require(&get, "DAYTONA_API_KEY")?,
                api_url: get("DAYTONA_API_URL").unwrap_or_else(|| DEFAULT_DAYTONA_API_URL.into()),
                target: get("DAYTONA_TARGET").unwrap_or_else(|| DEFAULT_DAYTONA_TARGET.into()),
                preview_domain: get("DAYTONA_PREVIEW_DOMAIN")
                    .unwrap_or_else(|| DEFAULT_DAYTONA_PREVIEW_DOMAIN.into()),
            }),
            SandboxBackendKind::Docker => SandboxRuntimeConfig::Docker(docker_config(&get)?),
        };

        let defaults = RegistryConfig::default();
        let registry = RegistryConfig {
            sweep_interval: millis(&get, "SANDBOX_SWEEP_INTERVAL_MS")?
                .unwrap_or(defaults.sweep_interval),
            stop_grace: match get("SANDBOX_STOP_GRACE_SECS") {
                Some(v) => Duration::from_secs(v.parse().map_err(|_| {
                    SandboxError::Config(format!("SANDBOX_STOP_GRACE_SECS is not a number: {v}"))
                })?),
                None => defaults.stop_grace,
            },
        };
        let default_lifetime = millis(&get, "SANDBOX_DEFAULT_LIFETIME_MS")?.unwrap_or(DEFAULT_LIFETIME);

        Ok(Config {
            port,
            sentry_dsn,
            environment,
            sandbox,
            registry,
            default_lifetime,
        })
    }
}

/// Explicit `SANDBOX_PROVIDER`, else the first credential present
/// (E2B, then Daytona), else the local Docker engine.
pub fn select_backend<F>(get: &F) -> Result<SandboxBackendKind, SandboxError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(explicit) = get("SANDBOX_PROVIDER") {
        return SandboxBackendKind::parse(&explicit).ok_or_else(|| {
            SandboxError::Config(format!(
                "unknown SANDBOX_PROVIDER {explicit:?} (expected e2b, daytona or docker)"
            ))
        });
    }
    if get("E2B_API_KEY").is_some() {
        Ok(SandboxBackendKind::E2b)
    } else if get("DAYTONA_API_KEY").is_some() {
        Ok(SandboxBackendKind::Daytona)
    } else {
        Ok(SandboxBackendKind::Docker)
    }
}

fn require<F>(get: &F, key: &str) -> Result<String, SandboxError>
where
    F: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| SandboxError::Config(format!("{key} is required for the selected provider")))
}

fn millis<F>(get: &F, key: &str) -> Result<Option<Duration>, SandboxError>
where
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|v| match v.parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
            _ => Err(SandboxError::Config(format!("{key} must be a positive number of milliseconds: {v}"))),
        })
        .transpose()
}

fn docker_config<F>(get: &F) -> Result<DockerConfig, SandboxError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = DockerConfig {
        endpoint: parse_endpoint(get("DOCKER_HOST").as_deref(), get("DOCKER_SOCKET").as_deref())?,
        ..DockerConfig::default()
    };
    if let Some(raw) = get("SANDBOX_DOCKER_IMAGES") {
        config.image_overrides = parse_image_overrides(&raw)?;
    }
    if let Some(raw) = get("SANDBOX_PORT_RANGE") {
        (config.port_range_start, config.port_range_end) = parse_port_range(&raw)?;
    }
    Ok(config)
}
