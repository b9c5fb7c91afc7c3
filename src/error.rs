//! Custom error types for the instrument link.
//!
//! `DaqError` is the single error enum of the crate. The three protocol-level
//! variants mirror what can go wrong in one command exchange:
//!
//! - **`Connectivity`**: dialing, writing, or a non-timeout read failed. Carries the
//!   instrument address and the underlying I/O cause.
//! - **`ProtocolDecode`**: the instrument answered, but the reply is malformed or
//!   short. Carries the raw reply text and a reason naming the failing field.
//! - **`EmptyReply`**: a reply was required and none arrived before the deadline.
//!
//! The remaining variants cover the collaborators around the protocol layer
//! (instrument catalog, sample storage, configuration). Transport and codec never
//! retry; whoever calls them decides what a failure means. The polling loop turns
//! every error into a log event, while connectivity checks hand it to the caller.

use crate::instrument::{InstrumentAddress, InstrumentId};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Errors produced by the instrument link and its collaborators.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Dial, write, or non-timeout read failure against one instrument.
    #[error("Instrument {address} unreachable: {source}")]
    Connectivity {
        /// Instrument the exchange targeted.
        address: InstrumentAddress,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// Reply arrived but could not be decoded.
    #[error("Malformed reply {raw:?}: {reason}")]
    ProtocolDecode {
        /// Reply text as received (trimmed).
        raw: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A query got no reply at all.
    #[error("No reply to {command}")]
    EmptyReply {
        /// The wire command that went unanswered.
        command: &'static str,
    },

    /// No catalog record for this id.
    #[error("Unknown instrument {0}")]
    UnknownInstrument(InstrumentId),

    /// A sample sink failed to persist.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Config sources could not be merged or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A value was rejected at runtime.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local I/O outside an instrument exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    pub(crate) fn connectivity(address: &InstrumentAddress, source: std::io::Error) -> Self {
        DaqError::Connectivity {
            address: address.clone(),
            source,
        }
    }

    pub(crate) fn decode(raw: &str, reason: impl Into<String>) -> Self {
        DaqError::ProtocolDecode {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }

    /// True for the errors a poll loop skips over: unreachable instrument,
    /// malformed reply, or silence.
    pub fn is_exchange_failure(&self) -> bool {
        matches!(
            self,
            DaqError::Connectivity { .. }
                | DaqError::ProtocolDecode { .. }
                | DaqError::EmptyReply { .. }
        )
    }
}
