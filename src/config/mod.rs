//! Configuration Module
//!
//! Provides TOML-based configuration for the silo controller with support for:
//! - Silo identity (silo, tenant and owner IDs)
//! - One connection section per plane (control, data, local)
//! - Environment variable overrides (VSILO__* prefix)
//! - The flat environment variables of container deployments
//!   (vSiloID, tenantID, OwnerID, MQTTDataBrokerIP, ...)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use plane::{PlaneConfig, DEFAULT_PORT};

mod plane;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Silo identity
    pub silo: SiloConfig,
    /// Virtual-plane control broker
    pub control: PlaneConfig,
    /// Virtual-plane data broker
    pub data: PlaneConfig,
    /// Local broker
    #[serde(default = "PlaneConfig::local_default")]
    pub local: PlaneConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            silo: SiloConfig::default(),
            control: PlaneConfig::default(),
            data: PlaneConfig::default(),
            local: PlaneConfig::local_default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Silo identity configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SiloConfig {
    /// Silo identifier (vSiloID)
    pub id: String,
    /// Tenant identifier, first segment of every local topic
    pub tenant_id: String,
    /// Owner identifier carried in acks
    pub owner_id: String,
    /// Opaque flavour parameters passed by the orchestrator
    pub flavour_params: Option<String>,
}

/// Flat environment variables of container deployments and the keys they set
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("vSiloID", "silo.id"),
    ("tenantID", "silo.tenant_id"),
    ("OwnerID", "silo.owner_id"),
    ("flavourParams", "silo.flavour_params"),
];

/// Collect overrides from the flat deployment variables.
///
/// Broker IP and port variables are joined into a single `address`.
fn legacy_overrides<F>(lookup: F) -> Vec<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut overrides: Vec<(&'static str, String)> = LEGACY_ENV_KEYS
        .iter()
        .filter_map(|(var, key)| lookup(var).map(|value| (*key, value)))
        .collect();

    let brokers = [
        ("MQTTDataBrokerIP", "MQTTDataBrokerPort", "data.address"),
        ("MQTTControlBrokerIP", "MQTTControlBrokerPort", "control.address"),
    ];
    for (ip_var, port_var, key) in brokers {
        if let Some(ip) = lookup(ip_var) {
            let address = match lookup(port_var) {
                Some(port) => format!("{}:{}", ip, port),
                None => ip,
            };
            overrides.push((key, address));
        }
    }

    overrides
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Sources, lowest precedence first:
    /// 1. The file, with `${VAR}` or `${VAR:-default}` substituted
    /// 2. `VSILO__` variables with double underscores for nesting:
    ///    - `VSILO__SILO__ID=silo1` overrides `silo.id`
    ///    - `VSILO__DATA__ADDRESS=10.0.0.2:1883` overrides `data.address`
    /// 3. The flat deployment variables (`vSiloID`, `MQTTDataBrokerIP`, ...)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("local.address", "127.0.0.1:1883")?;

        // A missing file is not an error: container deployments use env only
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        builder = builder.add_source(
            Environment::with_prefix("VSILO")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in legacy_overrides(|var| std::env::var(var).ok()) {
            builder = builder.set_override(key, value)?;
        }

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.finalize();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.finalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill in plane names and derived client IDs
    fn finalize(&mut self) {
        if self.local.address.is_empty() {
            self.local.address = PlaneConfig::local_default().address;
        }

        let silo_id = self.silo.id.clone();
        for (name, plane) in [
            ("control", &mut self.control),
            ("data", &mut self.data),
            ("local", &mut self.local),
        ] {
            plane.name = name.to_string();
            if plane.client_id.is_empty() {
                plane.client_id = format!("vsilo-{}-{}", silo_id, name);
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("silo.id", &self.silo.id),
            ("silo.tenant_id", &self.silo.tenant_id),
            ("silo.owner_id", &self.silo.owner_id),
            ("control.address", &self.control.address),
            ("data.address", &self.data.address),
            ("local.address", &self.local.address),
        ];
        for (key, value) in required {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!("{} is required", key)));
            }
        }

        // The silo ID is a single topic level on the control plane
        if self.silo.id.contains(['/', '+', '#']) {
            return Err(ConfigError::Validation(format!(
                "silo.id '{}' must be a single topic level without wildcards",
                self.silo.id
            )));
        }

        for plane in [&self.control, &self.data, &self.local] {
            if plane.qos > 2 {
                return Err(ConfigError::Validation(format!(
                    "{}.qos must be 0, 1, or 2",
                    plane.name
                )));
            }
            if !plane.keep_alive.is_zero() && plane.keep_alive.as_secs() == 0 {
                return Err(ConfigError::Validation(format!(
                    "{}.keep_alive must be zero or at least one second",
                    plane.name
                )));
            }
            if plane.channel_capacity == 0 {
                return Err(ConfigError::Validation(format!(
                    "{}.channel_capacity must be greater than zero",
                    plane.name
                )));
            }
        }

        Ok(())
    }
}
