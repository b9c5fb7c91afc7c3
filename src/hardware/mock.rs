//! Mock Hardware Implementations
//!
//! Provides simulated instruments for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockTransport` - In-process [`ScpiTransport`] with scripted replies,
//!   unreachable-instrument injection and a call log
//! - `SimulatedInstrument` - Real TCP server speaking the instrument's SCPI
//!   dialect on a local port

use crate::error::{DaqError, DaqResult};
use crate::instrument::InstrumentAddress;
use crate::scpi::transport::ScpiTransport;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockTransport - scripted in-process transport
// =============================================================================

/// Scripted transport for unit tests.
///
/// Replies are keyed by (address, command). Unscripted commands get an empty
/// reply, which is what a silent instrument looks like after a read timeout.
///
/// # Example
///
/// ```
/// use scpi_daq::hardware::mock::MockTransport;
/// use scpi_daq::instrument::InstrumentAddress;
/// use scpi_daq::scpi::ScpiClient;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let address = InstrumentAddress::new("10.0.0.5", 45454);
/// let transport = Arc::new(MockTransport::new());
/// transport.reply(&address, "*IDN?", "TH2690,V1.0.22,R08C240109");
///
/// let client = ScpiClient::new(transport);
/// assert_eq!(client.identify(&address).await.unwrap().model, "TH2690");
/// # })
/// ```
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<(InstrumentAddress, String), String>>,
    unreachable: Mutex<HashSet<InstrumentAddress>>,
    calls: Mutex<Vec<(InstrumentAddress, String)>>,
    latency: Duration,
}

impl MockTransport {
    /// Create a transport with no scripted replies and no latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every exchange by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Script the reply `address` gives to `command`.
    pub fn reply(&self, address: &InstrumentAddress, command: &str, reply: &str) {
        lock(&self.replies).insert((address.clone(), command.to_string()), reply.to_string());
    }

    /// Make every exchange with `address` fail with a refused connection.
    pub fn set_unreachable(&self, address: &InstrumentAddress, unreachable: bool) {
        let mut set = lock(&self.unreachable);
        if unreachable {
            set.insert(address.clone());
        } else {
            set.remove(address);
        }
    }

    /// Every exchange attempted so far, in order.
    pub fn calls(&self) -> Vec<(InstrumentAddress, String)> {
        lock(&self.calls).clone()
    }

    /// Number of times `command` was sent to `address`.
    pub fn call_count(&self, address: &InstrumentAddress, command: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|(a, c)| a == address && c == command)
            .count()
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    async fn exchange(&self, address: &InstrumentAddress, command: &str) -> DaqResult<String> {
        lock(&self.calls).push((address.clone(), command.to_string()));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if lock(&self.unreachable).contains(address) {
            return Err(DaqError::connectivity(
                address,
                io::Error::from(io::ErrorKind::ConnectionRefused),
            ));
        }

        Ok(lock(&self.replies)
            .get(&(address.clone(), command.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// SimulatedInstrument - TCP server speaking the instrument dialect
// =============================================================================

struct SimState {
    model: String,
    serial: String,
    measuring: AtomicBool,
    silent: AtomicBool,
    error_code: AtomicI32,
    fetches: AtomicU64,
}

impl SimState {
    /// Reply for one command line, or `None` when the command is silent.
    fn respond(&self, command: &str) -> Option<String> {
        if self.silent.load(Ordering::SeqCst) {
            return None;
        }

        match command {
            "*IDN?" => Some(format!("{},V1.0.22,{}", self.model, self.serial)),
            "FETCH:ALL_S?" => {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                Some(self.sample_line())
            }
            "FUNC:RUN" => {
                self.measuring.store(true, Ordering::SeqCst);
                None
            }
            "FUNC:STOP" => {
                self.measuring.store(false, Ordering::SeqCst);
                None
            }
            "HAND:ERROR" => {
                self.error_code.store(0, Ordering::SeqCst);
                None
            }
            other => {
                tracing::warn!(command = other, "Simulated instrument got unknown command");
                None
            }
        }
    }

    fn sample_line(&self) -> String {
        let mut rng = rand::thread_rng();
        let source = if self.measuring.load(Ordering::SeqCst) {
            1.0
        } else {
            0.0
        };
        let voltage = source * 1000.0 + rng.gen_range(-0.5..0.5);
        let current = source * rng.gen_range(1e-12..1e-9);
        let charge = current * 0.2;
        let resistance = if current > 0.0 { voltage / current } else { 0.0 };
        let device_time = chrono::Utc::now().format("%H:%M:%S%.3f");

        format!(
            "{:.6},{:.15},{:.15},{:.1},{},{:.3},{:.6},{:.2},{:.2},{}",
            voltage,
            current,
            charge,
            resistance,
            device_time,
            source * 1000.0,
            voltage - source * 1000.0,
            rng.gen_range(22.0..26.0),
            rng.gen_range(35.0..45.0),
            self.error_code.load(Ordering::SeqCst),
        )
    }
}

/// A simulated instrument listening on a local TCP port.
///
/// Answers `*IDN?` and `FETCH:ALL_S?`, tracks `FUNC:RUN`/`FUNC:STOP`, and stays
/// silent for fire-and-forget commands exactly like the real device.
pub struct SimulatedInstrument {
    address: InstrumentAddress,
    state: Arc<SimState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SimulatedInstrument {
    /// Bind to `bind` (use port 0 for an ephemeral port) and start serving.
    pub async fn spawn(bind: &str, model: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        let address = InstrumentAddress::new(local.ip().to_string(), local.port());

        let state = Arc::new(SimState {
            model: model.to_string(),
            serial: format!("SIM{:05}", local.port()),
            measuring: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            error_code: AtomicI32::new(0),
            fetches: AtomicU64::new(0),
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let server_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            tracing::trace!(%peer, "Simulated instrument accepted connection");
                            tokio::spawn(serve_connection(socket, server_state.clone()));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Simulated instrument accept failed");
                        }
                    }
                }
            }
        });

        tracing::info!(%address, model, "Simulated instrument listening");

        Ok(Self {
            address,
            state,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Address clients should connect to.
    pub fn address(&self) -> &InstrumentAddress {
        &self.address
    }

    /// Whether the last control command was `FUNC:RUN`.
    pub fn is_measuring(&self) -> bool {
        self.state.measuring.load(Ordering::SeqCst)
    }

    /// Number of `FETCH:ALL_S?` queries answered.
    pub fn fetch_count(&self) -> u64 {
        self.state.fetches.load(Ordering::SeqCst)
    }

    /// Error code reported in the next samples (cleared by `HAND:ERROR`).
    pub fn set_error_code(&self, code: i32) {
        self.state.error_code.store(code, Ordering::SeqCst);
    }

    /// Stop answering anything, as a hung instrument would.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "Simulated instrument task failed");
        }
    }
}

impl Drop for SimulatedInstrument {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_connection(socket: TcpStream, state: Arc<SimState>) {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let Some(reply) = state.respond(line.trim()) else {
                    continue;
                };
                let frame = format!("{}\r\n", reply);
                if let Err(e) = reader.get_mut().write_all(frame.as_bytes()).await {
                    tracing::debug!(error = %e, "Simulated instrument write failed");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Simulated instrument read failed");
                break;
            }
        }
    }
}
