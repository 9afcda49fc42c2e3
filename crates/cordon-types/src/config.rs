use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} must be set")]
    Missing { key: &'static str },
}

/// Runtime configuration, assembled once at startup from environment
/// variables and held behind an `Arc` by every long-running task.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentConfig {
    pub node_name: String,
    pub metadata_endpoint: String,
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub dry_run: bool,
    pub enable_scheduled_maintenance: bool,
    pub enable_spot_itn: bool,
    pub cordon_only: bool,
    pub pod_termination_grace_period: Duration,
    pub metadata_tries: u32,
    pub webhook_url: Option<String>,
    pub webhook_template: Option<String>,
    pub webhook_headers: HashMap<String, String>,
    pub webhook_proxy: Option<String>,
    pub enable_prometheus: bool,
    pub prometheus_port: u16,
    pub json_logging: bool,
}

const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 1;
const DEFAULT_GRACE_PERIOD_SECS: u64 = 120;
const DEFAULT_METADATA_TRIES: u64 = 3;
const DEFAULT_PROMETHEUS_PORT: u64 = 9092;

impl AgentConfig {
    /// Reads configuration from environment variables, applying the same
    /// defaults a containerized deployment would bake into its manifest.
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_name = require_env("NODE_NAME")?;

        let metadata_endpoint =
            env::var("METADATA_ENDPOINT").unwrap_or_else(|_| DEFAULT_METADATA_ENDPOINT.to_string());

        let poll_interval = Duration::from_secs(parse_env_or(
            "POLL_INTERVAL_SECONDS",
            DEFAULT_POLL_INTERVAL_SECS,
        )?);
        let reconcile_interval = Duration::from_secs(parse_env_or(
            "RECONCILE_INTERVAL_SECONDS",
            DEFAULT_RECONCILE_INTERVAL_SECS,
        )?);
        let pod_termination_grace_period = Duration::from_secs(parse_env_or(
            "POD_TERMINATION_GRACE_PERIOD_SECONDS",
            DEFAULT_GRACE_PERIOD_SECS,
        )?);
        let metadata_tries = parse_env_or("METADATA_TRIES", DEFAULT_METADATA_TRIES)? as u32;

        let dry_run = parse_bool_env_or("DRY_RUN", false)?;
        let enable_scheduled_maintenance =
            parse_bool_env_or("ENABLE_SCHEDULED_MAINTENANCE", true)?;
        let enable_spot_itn = parse_bool_env_or("ENABLE_SPOT_ITN", true)?;
        let cordon_only = parse_bool_env_or("CORDON_ONLY", false)?;
        let json_logging = parse_bool_env_or("JSON_LOGGING", true)?;
        let enable_prometheus = parse_bool_env_or("ENABLE_PROMETHEUS", true)?;
        let prometheus_port = parse_env_or("PROMETHEUS_PORT", DEFAULT_PROMETHEUS_PORT)? as u16;

        let webhook_url = non_empty_env("WEBHOOK_URL");
        let webhook_template = non_empty_env("WEBHOOK_TEMPLATE");
        let webhook_headers = parse_header_env("WEBHOOK_HEADERS")?;
        let webhook_proxy = non_empty_env("WEBHOOK_PROXY");

        if !enable_scheduled_maintenance && !enable_spot_itn {
            return Err(ConfigError::InvalidValue {
                key: "ENABLE_SPOT_ITN/ENABLE_SCHEDULED_MAINTENANCE",
                value: "false,false".to_string(),
            });
        }

        Ok(Self {
            node_name,
            metadata_endpoint,
            poll_interval,
            reconcile_interval,
            dry_run,
            enable_scheduled_maintenance,
            enable_spot_itn,
            cordon_only,
            pod_termination_grace_period,
            metadata_tries,
            webhook_url,
            webhook_template,
            webhook_headers,
            webhook_proxy,
            enable_prometheus,
            prometheus_port,
            json_logging,
        })
    }
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing { key })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Parses `key=value` pairs separated by commas, e.g.
/// `X-Team=sre,X-Source=cordon-agent`. Absent or empty means no extra
/// headers.
fn parse_header_env(key: &'static str) -> Result<HashMap<String, String>, ConfigError> {
    let Some(raw) = non_empty_env(key) else {
        return Ok(HashMap::new());
    };

    let mut headers = HashMap::new();
    for pair in raw.split(',') {
        let (name, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
        })?;
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

fn parse_env_or(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env_or(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value }),
        },
        Err(_) => Ok(default),
    }
}
