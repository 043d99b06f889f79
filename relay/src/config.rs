use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Placeholder token replaced with the upstream's text in `time_text`.
pub const TEXT_PLACEHOLDER: &str = "%TEXT%";

/// Contents written when no config file exists yet.
pub const DEFAULT_CONFIG: &str = r#"[relay]
host = "0.0.0.0"
port = 25892
workers = 4
timeout = 25
time_text = "%TEXT% (Relayed)"
require_api_key = false
api_key = ""

[relay.admin_listener]
host = "127.0.0.1"
port = 25893

[relay.instances]
"https://api.wakatime.com/api/v1" = "API KEY HERE"
"#;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Timeout cannot be 0")]
    InvalidTimeout,

    #[error("No instances configured")]
    NoInstances,

    #[error("Invalid instance URL: {0}")]
    InvalidInstanceUrl(String),

    #[error("Empty credential for instance: {0}")]
    EmptyCredential(String),

    #[error("Primary does not match any configured instance: {0}")]
    UnknownPrimary(String),

    #[error("time_text is missing the {TEXT_PLACEHOLDER} placeholder: {0}")]
    MissingPlaceholder(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// StatsD sink for the metrics recorder
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

/// Relay configuration, read once at startup and shared read-only afterwards.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Separate listener for the health/readiness endpoints
    #[serde(default)]
    pub admin_listener: Option<Listener>,

    /// Runtime worker threads for the server
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-upstream-call timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Template applied to the status-bar text of the primary response.
    /// Must contain exactly one `%TEXT%` placeholder.
    #[serde(default = "default_time_text")]
    pub time_text: String,

    #[serde(default)]
    pub require_api_key: bool,

    /// The relay's own key, checked against inbound requests. Distinct from
    /// the per-instance credentials below.
    #[serde(default)]
    pub api_key: String,

    /// Base URL of the instance whose outcome answers the caller.
    /// Defaults to the first configured instance.
    #[serde(default)]
    pub primary: Option<String>,

    /// Ordered map of instance base URL to that instance's credential.
    /// Order matters: the first entry is the default primary.
    pub instances: IndexMap<String, String>,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    25892
}

fn default_workers() -> usize {
    4
}

fn default_timeout() -> u64 {
    25
}

fn default_time_text() -> String {
    "%TEXT% (Relayed)".to_string()
}

impl RelayConfig {
    /// Validates the relay configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if let Some(admin) = &self.admin_listener {
            admin.validate()?;
        }
        if self.timeout == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        if !self.time_text.contains(TEXT_PLACEHOLDER) {
            return Err(ValidationError::MissingPlaceholder(self.time_text.clone()));
        }
        if self.instances.is_empty() {
            return Err(ValidationError::NoInstances);
        }

        for (base_url, credential) in &self.instances {
            let parsed = Url::parse(base_url)
                .map_err(|_| ValidationError::InvalidInstanceUrl(base_url.clone()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ValidationError::InvalidInstanceUrl(base_url.clone()));
            }
            if credential.is_empty() {
                return Err(ValidationError::EmptyCredential(base_url.clone()));
            }
        }

        if let Some(primary) = &self.primary
            && !self.instances.contains_key(primary)
        {
            return Err(ValidationError::UnknownPrimary(primary.clone()));
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    relay: RelayConfig,
}

/// Loads and validates a config file in the `[relay]` TOML layout.
pub fn load_from_file(path: &Path) -> Result<RelayConfig, ConfigError> {
    let data = std::fs::read_to_string(path)?;
    let file: ConfigFile = toml::from_str(&data)?;
    file.relay.validate()?;
    Ok(file.relay)
}
