//! # SCPI DAQ Controller Library
//!
//! Polls networked measurement instruments over plain-text SCPI-style commands
//! and records their readings per experiment.
//!
//! ## Crate Structure
//!
//! - **`scpi`**: the wire layer. A bounded TCP exchange per command, the fixed
//!   command set, and decoders for identification and sample replies.
//! - **`runner`**: the `PollRunner` scheduler, one cancellable polling task per
//!   active experiment.
//! - **`experiment`**: the start/stop workflow that arms instruments with
//!   `FUNC:RUN` before polling and disarms them afterwards.
//! - **`instrument`**: instrument ids, addresses and the in-memory catalog that
//!   resolves ids to poll targets.
//! - **`data`**: the persisted `Sample` record and the sinks it is saved to.
//! - **`hardware`**: a scripted transport and a simulated TCP instrument for
//!   tests and development.
//! - **`config`**: Figment-based configuration (TOML file plus environment).
//! - **`tracing_init`**: tracing subscriber setup.
//! - **`error`**: the crate-wide `DaqError`.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod instrument;
pub mod runner;
pub mod scpi;
pub mod tracing_init;

pub use error::{DaqError, DaqResult};
pub use experiment::{ExperimentController, ExperimentId};
pub use instrument::{InstrumentAddress, InstrumentId};
pub use runner::{PollRunner, PollTarget};
pub use scpi::ScpiClient;
