//! Configuration for the reconciliation agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use stratus_reconcile::EngineSettings;

/// API URL that selects the in-memory control plane.
pub const MOCK_API_URL: &str = "mock";

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control plane API URL, or `mock` for the in-memory control plane.
    pub api_url: String,

    /// Basic auth credentials for the control plane.
    pub api_user: Option<String>,
    pub api_password: Option<String>,

    /// Path to the desired-state manifest.
    pub manifest_path: PathBuf,

    /// Engine timing and reboot policy.
    pub engine: EngineSettings,

    /// Interval between reconciliation rounds.
    pub reconcile_interval: Duration,

    /// Run a single round and exit.
    pub once: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("STRATUS_API_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let api_user = lookup("STRATUS_API_USER");
        let api_password = lookup("STRATUS_API_PASSWORD");
        if api_user.is_some() != api_password.is_some() {
            anyhow::bail!("STRATUS_API_USER and STRATUS_API_PASSWORD must be set together");
        }

        let manifest_path = lookup("STRATUS_MANIFEST")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("stratus.toml"));

        let engine = EngineSettings {
            retry_delay: seconds(&lookup, "STRATUS_RETRY_DELAY_SECS", 5)?,
            retry_timeout: seconds(&lookup, "STRATUS_RETRY_TIMEOUT_SECS", 600)?,
            poll_interval: seconds(&lookup, "STRATUS_POLL_INTERVAL_SECS", 5)?,
            create_timeout: seconds(&lookup, "STRATUS_CREATE_TIMEOUT_SECS", 30 * 60)?,
            update_timeout: seconds(&lookup, "STRATUS_UPDATE_TIMEOUT_SECS", 10 * 60)?,
            delete_timeout: seconds(&lookup, "STRATUS_DELETE_TIMEOUT_SECS", 15 * 60)?,
            allow_owner_reboot: parse(&lookup, "STRATUS_ALLOW_SERVER_REBOOT", false)?,
        };

        if engine.poll_interval.is_zero() {
            anyhow::bail!("STRATUS_POLL_INTERVAL_SECS must be greater than 0");
        }

        let reconcile_interval = seconds(&lookup, "STRATUS_RECONCILE_INTERVAL_SECS", 60)?;
        if reconcile_interval.is_zero() {
            anyhow::bail!("STRATUS_RECONCILE_INTERVAL_SECS must be greater than 0");
        }

        let once = parse(&lookup, "STRATUS_ONCE", false)?;
        let log_level = lookup("STRATUS_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            api_url,
            api_user,
            api_password,
            manifest_path,
            engine,
            reconcile_interval,
            once,
            log_level,
        })
    }

    /// Whether the in-memory control plane was requested.
    pub fn uses_mock(&self) -> bool {
        self.api_url == MOCK_API_URL
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn seconds<F>(lookup: &F, key: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();

        assert_eq!(config.api_url, "http://127.0.0.1:8080");
        assert_eq!(config.manifest_path, PathBuf::from("stratus.toml"));
        assert_eq!(config.engine, EngineSettings::default());
        assert_eq!(config.reconcile_interval, Duration::from_secs(60));
        assert!(!config.once);
        assert!(!config.uses_mock());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("STRATUS_API_URL", "https://api.example.com/caas/"),
            ("STRATUS_API_USER", "ops"),
            ("STRATUS_API_PASSWORD", "secret"),
            ("STRATUS_RETRY_DELAY_SECS", "2"),
            ("STRATUS_DELETE_TIMEOUT_SECS", "120"),
            ("STRATUS_ALLOW_SERVER_REBOOT", "true"),
            ("STRATUS_ONCE", "true"),
        ])
        .unwrap();

        assert_eq!(config.api_url, "https://api.example.com/caas");
        assert_eq!(config.api_user.as_deref(), Some("ops"));
        assert_eq!(config.engine.retry_delay, Duration::from_secs(2));
        assert_eq!(config.engine.delete_timeout, Duration::from_secs(120));
        assert!(config.engine.allow_owner_reboot);
        assert!(config.once);
    }

    #[test]
    fn test_invalid_number_names_the_variable() {
        let err = config(&[("STRATUS_CREATE_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("STRATUS_CREATE_TIMEOUT_SECS"));
    }

    #[test]
    fn test_user_without_password() {
        assert!(config(&[("STRATUS_API_USER", "ops")]).is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        assert!(config(&[("STRATUS_POLL_INTERVAL_SECS", "0")]).is_err());
    }
}
