//! Hardware stand-ins.
//!
//! Simulated instruments for development and tests; real instruments are reached
//! through [`crate::scpi`].

pub mod mock;

pub use mock::{MockTransport, SimulatedInstrument};
