//! Shared fixtures for integration tests.
#![allow(dead_code)]

use scpi_daq::config::InstrumentSpec;
use scpi_daq::data::MemorySink;
use scpi_daq::hardware::SimulatedInstrument;
use scpi_daq::instrument::InstrumentCatalog;
use scpi_daq::{ExperimentController, InstrumentAddress, PollRunner, ScpiClient};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Exchange timeout used against local sockets.
pub const TEST_TIMEOUT: Duration = Duration::from_millis(200);

/// Poll tick used by the fixtures.
pub const TEST_INTERVAL: Duration = Duration::from_millis(25);

/// A local port with nothing listening on it.
pub async fn closed_address() -> InstrumentAddress {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    InstrumentAddress::new("127.0.0.1", port)
}

pub async fn simulator(model: &str) -> SimulatedInstrument {
    SimulatedInstrument::spawn("127.0.0.1:0", model)
        .await
        .expect("simulator should bind")
}

pub fn spec_for(address: &InstrumentAddress) -> InstrumentSpec {
    InstrumentSpec {
        name: None,
        host: address.host.clone(),
        port: address.port,
    }
}

/// Catalog, runner and controller wired over real TCP into a memory sink.
pub struct Stack {
    pub client: ScpiClient,
    pub catalog: Arc<InstrumentCatalog>,
    pub sink: Arc<MemorySink>,
    pub runner: Arc<PollRunner>,
    pub controller: ExperimentController,
}

impl Stack {
    pub fn new() -> Self {
        let client = ScpiClient::tcp(TEST_TIMEOUT);
        let catalog = Arc::new(InstrumentCatalog::new());
        let sink = Arc::new(MemorySink::new());
        let runner = Arc::new(PollRunner::new(client.clone(), sink.clone()));
        let controller = ExperimentController::new(
            catalog.clone(),
            client.clone(),
            runner.clone(),
            TEST_INTERVAL,
        );
        Self {
            client,
            catalog,
            sink,
            runner,
            controller,
        }
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn wait_until<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
