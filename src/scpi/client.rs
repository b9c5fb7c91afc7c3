//! Fixed-command instrument client.

use crate::error::{DaqError, DaqResult};
use crate::instrument::InstrumentAddress;
use crate::scpi::codec::{self, Command, IdentificationReply, SampleReply};
use crate::scpi::transport::{ScpiTransport, TcpTransport};
use std::sync::Arc;
use std::time::Duration;

/// Command helpers on top of a [`ScpiTransport`].
///
/// Cheap to clone; every clone shares the same transport. Nothing here retries.
#[derive(Clone)]
pub struct ScpiClient {
    transport: Arc<dyn ScpiTransport>,
}

impl ScpiClient {
    /// Create a client over an arbitrary transport.
    pub fn new(transport: Arc<dyn ScpiTransport>) -> Self {
        Self { transport }
    }

    /// Create a client over TCP with the given per-exchange timeout.
    pub fn tcp(timeout: Duration) -> Self {
        Self::new(Arc::new(TcpTransport::new(timeout)))
    }

    /// Send a command and return the raw trimmed reply.
    pub async fn send(&self, address: &InstrumentAddress, command: Command) -> DaqResult<String> {
        self.transport.exchange(address, command.as_str()).await
    }

    /// `*IDN?` - query model, firmware and serial.
    pub async fn identify(&self, address: &InstrumentAddress) -> DaqResult<IdentificationReply> {
        let raw = self.send(address, Command::Identify).await?;
        codec::parse_identification(&raw)
    }

    /// `FETCH:ALL_S?` - read one full sample.
    pub async fn fetch_all(&self, address: &InstrumentAddress) -> DaqResult<SampleReply> {
        let raw = self.send(address, Command::FetchAll).await?;
        if raw.is_empty() {
            return Err(DaqError::EmptyReply {
                command: Command::FetchAll.as_str(),
            });
        }
        codec::parse_sample(&raw)
    }

    /// `FUNC:RUN` - start measuring. Silence is success.
    pub async fn run(&self, address: &InstrumentAddress) -> DaqResult<()> {
        self.send(address, Command::Run).await.map(drop)
    }

    /// `FUNC:STOP` - stop measuring. Silence is success.
    pub async fn stop(&self, address: &InstrumentAddress) -> DaqResult<()> {
        self.send(address, Command::Stop).await.map(drop)
    }

    /// `HAND:ERROR` - clear the instrument's error state. Silence is success.
    pub async fn clear_error(&self, address: &InstrumentAddress) -> DaqResult<()> {
        self.send(address, Command::ClearError).await.map(drop)
    }
}

impl Default for ScpiClient {
    fn default() -> Self {
        Self::new(Arc::new(TcpTransport::default()))
    }
}
