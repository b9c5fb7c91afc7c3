//! Instrument identity and addressing.
//!
//! An instrument is known to the controller by a numeric [`InstrumentId`] and
//! reached through an [`InstrumentAddress`]. The [`catalog`] module keeps the
//! registry of known instruments and resolves ids into poll targets.

use crate::error::{DaqError, DaqResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod catalog;

pub use catalog::{InstrumentCatalog, InstrumentRecord, InstrumentResolver};

/// Numeric instrument identifier, as assigned by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(pub u64);

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network location of one physical instrument.
///
/// Immutable for the lifetime of any poll job that references it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentAddress {
    /// Hostname or IP address
    pub host: String,
    /// TCP port of the instrument's command socket
    pub port: u16,
}

impl InstrumentAddress {
    /// Create an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for InstrumentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for InstrumentAddress {
    type Err = DaqError;

    /// Parse `host:port`. The split happens on the last colon.
    fn from_str(s: &str) -> DaqResult<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| DaqError::Configuration(format!("invalid address {s:?} (need host:port)")))?;

        let host = host.trim();
        if host.is_empty() {
            return Err(DaqError::Configuration(format!("missing host in {s:?}")));
        }

        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| DaqError::Configuration(format!("bad port in {s:?}: {e}")))?;

        Ok(Self::new(host, port))
    }
}
