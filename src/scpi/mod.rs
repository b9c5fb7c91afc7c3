//! SCPI instrument protocol over raw TCP.
//!
//! - [`transport`]: one connection per command exchange, deadline-bounded
//! - [`codec`]: wire commands and reply decoding
//! - [`client`]: `identify` / `fetch_all` / `run` / `stop` / `clear_error` helpers
//!
//! # Wire protocol
//!
//! | Command        | Reply                                                     |
//! |----------------|-----------------------------------------------------------|
//! | `*IDN?`        | `model,firmware,serial[,...]`                             |
//! | `FETCH:ALL_S?` | `voltage,current,charge,resistance,deviceTime,source,math,temperature,humidity,errorCode` |
//! | `FUNC:RUN`     | none                                                      |
//! | `FUNC:STOP`    | none                                                      |
//! | `HAND:ERROR`   | none                                                      |

pub mod client;
pub mod codec;
pub mod transport;

pub use client::ScpiClient;
pub use codec::{Command, IdentificationReply, SampleReply};
pub use transport::{exchange, ScpiTransport, TcpTransport, DEFAULT_TIMEOUT};
