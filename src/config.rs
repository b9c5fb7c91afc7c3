//! Configuration loading using Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file (`config/scpi_daq.toml` unless a path is given)
//! 3. environment variables prefixed with `SCPI_DAQ_`, `__` separating sections
//! 4. the raw `INSTRUMENTS` variable, read into `instrument_list`
//!
//! # Example
//! ```no_run
//! use scpi_daq::config::DaqConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // SCPI_DAQ_POLLING__INTERVAL=500ms overrides polling.interval
//! let config = DaqConfig::load()?;
//! config.validate()?;
//! println!("Polling every {:?}", config.polling.interval);
//! # Ok(())
//! # }
//! ```

use crate::error::DaqResult;
use crate::instrument::InstrumentAddress;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read by [`DaqConfig::load`].
pub const DEFAULT_CONFIG_PATH: &str = "config/scpi_daq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SCPI_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaqConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument connection settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Poll scheduling
    #[serde(default)]
    pub polling: PollingConfig,
    /// Sample storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// Instruments declared in the config file
    #[serde(default)]
    pub instruments: Vec<InstrumentSpec>,
    /// Comma-separated `Name=host:port` list, normally from `INSTRUMENTS`
    #[serde(default)]
    pub instrument_list: Option<String>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Socket settings shared by every exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bound on connect plus write plus read, per exchange
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

/// Poll scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Tick period of every poll job
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// How long ending a session waits for its poll task to exit
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// CSV output file; samples stay in memory when unset
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
}

/// One instrument to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Display name; defaults to `host:port`
    #[serde(default)]
    pub name: Option<String>,
    /// Hostname or IP address
    pub host: String,
    /// TCP port of the SCPI socket
    pub port: u16,
}

impl InstrumentSpec {
    /// Network address of the instrument.
    pub fn address(&self) -> InstrumentAddress {
        InstrumentAddress::new(self.host.clone(), self.port)
    }

    /// Configured name, or `host:port` when none was given.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => self.address().to_string(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "scpi_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> Duration {
    crate::scpi::DEFAULT_TIMEOUT
}

fn default_interval() -> Duration {
    crate::runner::DEFAULT_POLL_INTERVAL
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

impl DaqConfig {
    /// Load configuration from `config/scpi_daq.toml` and the environment
    pub fn load() -> DaqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    /// The merged provider stack, before extraction.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(
                Env::raw()
                    .only(&["INSTRUMENTS"])
                    .map(|_| "instrument_list".into()),
            )
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.transport.timeout.is_zero() {
            return Err("transport.timeout must be greater than zero".to_string());
        }
        if self.polling.interval.is_zero() {
            return Err("polling.interval must be greater than zero".to_string());
        }

        for spec in &self.instruments {
            if spec.host.trim().is_empty() {
                return Err(format!("Instrument '{}' has an empty host", spec.display_name()));
            }
            if spec.port == 0 {
                return Err(format!("Instrument '{}' has port 0", spec.display_name()));
            }
        }

        Ok(())
    }

    /// Declared instruments followed by those from `instrument_list`.
    pub fn instrument_specs(&self) -> Vec<InstrumentSpec> {
        let mut specs = self.instruments.clone();
        if let Some(list) = &self.instrument_list {
            specs.extend(parse_instrument_list(list));
        }
        specs
    }
}

/// Parse `Name=host:port,host:port,...`.
///
/// Blank entries are skipped silently; malformed ones are logged and skipped.
pub fn parse_instrument_list(list: &str) -> Vec<InstrumentSpec> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let (name, address) = match entry.split_once('=') {
                Some((name, address)) => (Some(name.trim()), address),
                None => (None, entry),
            };

            match address.parse::<InstrumentAddress>() {
                Ok(address) if address.port != 0 => Some(InstrumentSpec {
                    name: name.filter(|n| !n.is_empty()).map(str::to_string),
                    host: address.host,
                    port: address.port,
                }),
                Ok(_) => {
                    tracing::warn!(entry, "Skipping instrument entry with port 0");
                    None
                }
                Err(e) => {
                    tracing::warn!(entry, error = %e, "Skipping malformed instrument entry");
                    None
                }
            }
        })
        .collect()
}
